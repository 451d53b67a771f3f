//! Static capability vetting
//!
//! The [`PolicyCompiler`] parses a fragment into a syntax tree and checks it
//! against a [`Policy`] without executing, importing or evaluating anything.
//! A fragment with no findings becomes a [`VettedUnit`]; anything else comes
//! back as the complete, location-sorted list of [`Violation`]s.
//!
//! Constructs the walker cannot reason about (computed attribute lookups,
//! star or relative imports, async code, `match`) are rejected as
//! [`ViolationRule::SyntaxUnsupported`] rather than allowed.

mod checker;
mod location;
mod violation;

pub use violation::{Location, Violation, ViolationRule};

use crate::config::types::{Policy, RunnerConfig};
use crate::extract::Fragment;
use checker::{bracket_depth, Checker};
use location::LineIndex;
use rustpython_parser::{ast, Parse};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Builtins a fragment may reach, before `denied_names` is applied
pub const SAFE_BUILTINS: &[&str] = &[
    "__build_class__",
    "abs",
    "all",
    "any",
    "ascii",
    "bin",
    "bool",
    "bytearray",
    "bytes",
    "callable",
    "chr",
    "classmethod",
    "complex",
    "delattr",
    "dict",
    "divmod",
    "enumerate",
    "filter",
    "float",
    "format",
    "frozenset",
    "getattr",
    "hasattr",
    "hash",
    "hex",
    "id",
    "int",
    "isinstance",
    "issubclass",
    "iter",
    "len",
    "list",
    "map",
    "max",
    "min",
    "next",
    "object",
    "oct",
    "ord",
    "pow",
    "print",
    "property",
    "range",
    "repr",
    "reversed",
    "round",
    "set",
    "setattr",
    "slice",
    "sorted",
    "staticmethod",
    "str",
    "sum",
    "super",
    "tuple",
    "type",
    "zip",
    "Ellipsis",
    "NotImplemented",
    "ArithmeticError",
    "AssertionError",
    "AttributeError",
    "BaseException",
    "DeprecationWarning",
    "Exception",
    "FloatingPointError",
    "GeneratorExit",
    "ImportError",
    "IndexError",
    "KeyError",
    "LookupError",
    "MemoryError",
    "ModuleNotFoundError",
    "NameError",
    "NotImplementedError",
    "OverflowError",
    "RecursionError",
    "RuntimeError",
    "RuntimeWarning",
    "StopIteration",
    "SystemExit",
    "TypeError",
    "UnicodeDecodeError",
    "UnicodeEncodeError",
    "UnicodeError",
    "UserWarning",
    "ValueError",
    "Warning",
    "ZeroDivisionError",
];

/// What the worker may bind into the fragment's globals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictedNamespace {
    /// Builtin names that survive the deny list
    pub builtins: Vec<String>,
    /// Modules the runtime import guard lets through
    pub allowed_modules: Vec<String>,
    /// Whether `emit_artifact` relays data out of the worker
    pub artifact_channel: bool,
}

impl RestrictedNamespace {
    fn for_policy(policy: &Policy) -> Self {
        let builtins = SAFE_BUILTINS
            .iter()
            .filter(|name| !policy.is_denied(name))
            .map(|name| name.to_string())
            .collect();

        Self {
            builtins,
            allowed_modules: policy.allowed_modules.iter().cloned().collect(),
            artifact_channel: policy.capture_artifacts,
        }
    }
}

/// A fragment proven to satisfy the policy it was compiled against
#[derive(Debug, Clone)]
pub struct VettedUnit {
    source: String,
    namespace: RestrictedNamespace,
    digest: String,
    fragment_index: usize,
}

impl VettedUnit {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn namespace(&self) -> &RestrictedNamespace {
        &self.namespace
    }

    /// Hex SHA-256 of the source
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn fragment_index(&self) -> usize {
        self.fragment_index
    }
}

/// Static policy checker
#[derive(Debug, Clone)]
pub struct PolicyCompiler {
    max_fragment_bytes: usize,
    max_nesting_depth: usize,
}

impl Default for PolicyCompiler {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

impl PolicyCompiler {
    pub fn new(max_fragment_bytes: usize, max_nesting_depth: usize) -> Self {
        Self {
            max_fragment_bytes,
            max_nesting_depth,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.max_fragment_bytes, config.max_nesting_depth)
    }

    /// Vet `fragment` against `policy`
    ///
    /// `Err` always carries at least one violation.
    pub fn compile(
        &self,
        fragment: &Fragment,
        policy: &Policy,
    ) -> std::result::Result<VettedUnit, Vec<Violation>> {
        let violations = self.check(&fragment.text, policy);

        if !violations.is_empty() {
            log::debug!(
                "fragment {} rejected with {} violation(s)",
                fragment.index,
                violations.len()
            );
            return Err(violations);
        }

        let digest = format!("{:x}", Sha256::digest(fragment.text.as_bytes()));
        log::debug!("fragment {} vetted, sha256={}", fragment.index, digest);

        Ok(VettedUnit {
            source: fragment.text.clone(),
            namespace: RestrictedNamespace::for_policy(policy),
            digest,
            fragment_index: fragment.index,
        })
    }

    /// All violations in `source`, sorted by location
    pub fn check(&self, source: &str, policy: &Policy) -> Vec<Violation> {
        let index = LineIndex::new(source);
        let start = Location { line: 1, column: 1 };

        if source.len() > self.max_fragment_bytes {
            return vec![Violation {
                location: start,
                rule: ViolationRule::SyntaxUnsupported,
                detail: format!(
                    "fragment is {} bytes, larger than the {} byte limit",
                    source.len(),
                    self.max_fragment_bytes
                ),
            }];
        }

        // The parser itself recurses on brackets
        let (depth, offset) = bracket_depth(source);
        if depth > self.max_nesting_depth {
            return vec![Violation {
                location: index.location(offset),
                rule: ViolationRule::SyntaxUnsupported,
                detail: format!("nesting deeper than {} levels", self.max_nesting_depth),
            }];
        }

        let suite = match ast::Suite::parse(source, "<fragment>") {
            Ok(suite) => suite,
            Err(err) => {
                return vec![Violation {
                    location: index.location(usize::from(err.offset)),
                    rule: ViolationRule::SyntaxUnsupported,
                    detail: format!("fragment does not parse: {}", err.error),
                }];
            }
        };

        Checker::new(policy, source, self.max_nesting_depth).check_suite(&suite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::presets;

    fn fragment(text: &str) -> Fragment {
        Fragment {
            text: text.to_string(),
            source_span: (0, text.len()),
            language_tag: Some("python".to_string()),
            index: 0,
        }
    }

    fn check(text: &str) -> Vec<Violation> {
        PolicyCompiler::default().check(text, &Policy::default())
    }

    fn rules(text: &str) -> Vec<ViolationRule> {
        check(text).into_iter().map(|v| v.rule).collect()
    }

    #[test]
    fn test_clean_fragment_is_vetted() {
        let unit = PolicyCompiler::default()
            .compile(&fragment("import math\nprint(math.sqrt(16))"), &Policy::default())
            .unwrap();
        assert_eq!(unit.source(), "import math\nprint(math.sqrt(16))");
        assert_eq!(unit.digest().len(), 64);
        assert!(unit.namespace().builtins.contains(&"print".to_string()));
        assert!(!unit.namespace().builtins.contains(&"open".to_string()));
        assert!(unit.namespace().allowed_modules.contains(&"math".to_string()));
    }

    #[test]
    fn test_denied_import_names_module() {
        let violations = check("import os\nos.listdir('.')");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, ViolationRule::DeniedImport);
        assert!(violations[0].detail.contains("'os'"));
        assert_eq!(violations[0].location, Location { line: 1, column: 1 });
    }

    #[test]
    fn test_from_import_checks_module() {
        assert_eq!(rules("from subprocess import run"), vec![ViolationRule::DeniedImport]);
        assert!(rules("from collections import Counter").is_empty());
    }

    #[test]
    fn test_submodule_of_allowed_parent() {
        let policy = presets::data_science();
        let violations = PolicyCompiler::default()
            .check("import matplotlib.pyplot as plt\nplt.plot([1, 2])", &policy);
        assert!(violations.is_empty());
    }

    #[test]
    fn test_denied_bare_name() {
        let violations = check("x = 1\ndata = open('/etc/passwd').read()");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, ViolationRule::DeniedName);
        assert_eq!(violations[0].location, Location { line: 2, column: 8 });
    }

    #[test]
    fn test_denied_attribute() {
        let violations = check("x = ().__class__.__bases__[0]");
        assert!(violations
            .iter()
            .all(|v| v.rule == ViolationRule::DeniedAttributeAccess));
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn test_alias_resolves_qualified_name() {
        let policy = presets::data_science();
        let violations =
            PolicyCompiler::default().check("import numpy as np\narr = np.load('x.npy')", &policy);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, ViolationRule::DeniedAttributeAccess);
        assert!(violations[0].detail.contains("numpy.load"));
    }

    #[test]
    fn test_assignment_alias_tracked() {
        let policy = Policy::default().allow_module("os");
        let violations =
            PolicyCompiler::default().check("import os\nsh = os\nsh.system('id')", &policy);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].detail.contains("os.system"));
    }

    #[test]
    fn test_from_import_of_denied_name() {
        let policy = Policy::default().allow_module("os");
        let violations = PolicyCompiler::default().check("from os import system", &policy);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, ViolationRule::DeniedName);
    }

    #[test]
    fn test_getattr_literal_and_computed() {
        assert_eq!(
            rules("getattr(object, '__subclasses__')"),
            vec![ViolationRule::DeniedAttributeAccess]
        );
        assert_eq!(
            rules("name = 'x'\ngetattr(object, name)"),
            vec![ViolationRule::SyntaxUnsupported]
        );
        assert!(rules("getattr(object, 'mro', None)").is_empty());
    }

    #[test]
    fn test_unsupported_constructs() {
        assert_eq!(rules("from math import *"), vec![ViolationRule::SyntaxUnsupported]);
        assert_eq!(rules("from . import x"), vec![ViolationRule::SyntaxUnsupported]);
        assert_eq!(
            rules("async def f():\n    pass"),
            vec![ViolationRule::SyntaxUnsupported]
        );
        assert_eq!(
            rules("match x:\n    case 1:\n        pass"),
            vec![ViolationRule::SyntaxUnsupported]
        );
    }

    #[test]
    fn test_parse_error_is_unsupported() {
        let violations = check("def broken(:\n    pass");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, ViolationRule::SyntaxUnsupported);
        assert!(violations[0].detail.contains("does not parse"));
    }

    #[test]
    fn test_all_violations_collected_and_sorted() {
        let violations = check("import socket\nimport os\neval('1')\nexec('2')");
        assert_eq!(violations.len(), 4);
        let lines: Vec<usize> = violations.iter().map(|v| v.location.line).collect();
        assert_eq!(lines, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_nesting_bound() {
        let deep = format!("x = {}1{}", "(".repeat(150), ")".repeat(150));
        let violations = check(&deep);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].detail.contains("nesting"));
    }

    #[test]
    fn test_brackets_in_strings_and_comments_not_nesting() {
        let source = format!(
            "banner = \"{}\"\n# {}\nprint(banner)",
            "(".repeat(300),
            "[".repeat(300)
        );
        assert!(check(&source).is_empty());
        assert_eq!(bracket_depth(&source), (1, source.len() - "(banner)".len()));
    }

    #[test]
    fn test_size_bound() {
        let compiler = PolicyCompiler::new(16, 100);
        let violations = compiler.check("x = 'this is longer than sixteen bytes'", &Policy::default());
        assert_eq!(violations[0].rule, ViolationRule::SyntaxUnsupported);
    }

    #[test]
    fn test_wildcard_still_applies_denied_names() {
        let policy = Policy::default().allow_module("*");
        let violations =
            PolicyCompiler::default().check("import subprocess\nsubprocess.Popen(['ls'])", &policy);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, ViolationRule::DeniedAttributeAccess);
    }

    #[test]
    fn test_ordinary_code_passes() {
        let code = r#"
import math
from collections import Counter

class Point:
    def __init__(self, x, y):
        self.x = x
        self.y = y

    def norm(self) -> float:
        return math.hypot(self.x, self.y)

counts = Counter(c for c in "hello world" if c != " ")
squares = {n: n * n for n in range(10)}
try:
    value = 1 / 0
except ZeroDivisionError as exc:
    value = None
finally:
    pass
with_lambda = sorted([3, 1, 2], key=lambda v: -v)
print(f"{Point(3, 4).norm():.1f}", counts.most_common(1), squares[3])
"#;
        assert!(check(code).is_empty());
    }

    #[test]
    fn test_denied_name_removed_from_builtins() {
        let policy = Policy::default().deny_name("print");
        let unit = PolicyCompiler::default()
            .compile(&fragment("x = 1"), &policy)
            .unwrap();
        assert!(!unit.namespace().builtins.contains(&"print".to_string()));
    }
}
