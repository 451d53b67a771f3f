/// Named capability policies
///
/// Each preset is an explicit, immutable policy. The `standard` preset is what
/// `Policy::default()` returns; callers pick another by name or build on top of
/// one with the `Policy` builder methods.
use crate::config::types::Policy;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Computation-only standard library modules
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "math",
    "cmath",
    "random",
    "statistics",
    "decimal",
    "fractions",
    "itertools",
    "functools",
    "operator",
    "collections",
    "heapq",
    "bisect",
    "array",
    "string",
    "re",
    "textwrap",
    "json",
    "datetime",
    "calendar",
    "time",
    "copy",
    "enum",
    "dataclasses",
    "typing",
    "abc",
    "numbers",
    "pprint",
];

/// Names that give a fragment a way out of the restricted namespace
pub const DEFAULT_DENIED_NAMES: &[&str] = &[
    // dynamic evaluation and raw I/O
    "eval",
    "exec",
    "compile",
    "open",
    "__import__",
    "globals",
    "locals",
    "vars",
    "breakpoint",
    "input",
    "help",
    "exit",
    "quit",
    "memoryview",
    // namespace escapes
    "__builtins__",
    "__globals__",
    "__subclasses__",
    "__class__",
    "__bases__",
    "__mro__",
    "__base__",
    "__code__",
    "__closure__",
    "__dict__",
    "__getattribute__",
    "__loader__",
    "__spec__",
    "__reduce__",
    "__reduce_ex__",
    "__self__",
    "__func__",
    "gi_frame",
    "f_globals",
    "f_locals",
    "f_builtins",
    "tb_frame",
    // process and file primitives reachable from otherwise allowed modules
    "os.system",
    "os.popen",
    "os.fork",
    "os.execv",
    "os.execve",
    "os.spawnv",
    "os.remove",
    "os.unlink",
    "os.kill",
    "subprocess.Popen",
    "subprocess.run",
    "subprocess.call",
    "subprocess.check_output",
    "shutil.rmtree",
    "numpy.load",
    "numpy.save",
    "numpy.fromfile",
    "numpy.ctypeslib",
    "pandas.read_pickle",
    "pandas.read_csv",
    "pandas.read_sql",
];

const SCIENCE_MODULES: &[&str] = &["numpy", "pandas", "matplotlib", "scipy"];

fn to_set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// General-purpose policy: computation-only stdlib, 5s wall, 256 MiB
pub fn standard() -> Policy {
    Policy {
        allowed_modules: to_set(DEFAULT_ALLOWED_MODULES),
        denied_names: to_set(DEFAULT_DENIED_NAMES),
        max_wall_time: Duration::from_secs(5),
        max_cpu_time: Duration::from_secs(5),
        max_memory_bytes: 256 * 1024 * 1024,
        capture_artifacts: false,
    }
}

/// No imports at all, tight limits
pub fn minimal() -> Policy {
    Policy {
        allowed_modules: BTreeSet::new(),
        denied_names: to_set(DEFAULT_DENIED_NAMES),
        max_wall_time: Duration::from_secs(2),
        max_cpu_time: Duration::from_secs(1),
        max_memory_bytes: 64 * 1024 * 1024,
        capture_artifacts: false,
    }
}

/// Numeric stack plus charting, with the artifact relay switched on
pub fn data_science() -> Policy {
    let mut policy = standard();
    policy.allowed_modules.extend(to_set(SCIENCE_MODULES));
    policy.max_wall_time = Duration::from_secs(30);
    policy.max_cpu_time = Duration::from_secs(30);
    policy.max_memory_bytes = 1024 * 1024 * 1024;
    policy.capture_artifacts = true;
    policy
}

/// A registered policy preset
#[derive(Debug, Clone)]
pub struct PolicyPreset {
    pub id: String,
    pub description: String,
    pub policy: Policy,
}

/// Preset registry, keyed by id
pub struct PolicyPresets {
    presets: HashMap<String, PolicyPreset>,
}

impl PolicyPresets {
    pub fn new() -> Self {
        let mut registry = Self {
            presets: HashMap::new(),
        };

        registry.register("standard", "Computation-only standard library", standard());
        registry.register("minimal", "No imports, tight limits", minimal());
        registry.register(
            "data_science",
            "numpy, pandas, scipy and matplotlib with artifact capture",
            data_science(),
        );

        registry
    }

    fn register(&mut self, id: &str, description: &str, policy: Policy) {
        self.presets.insert(
            id.to_string(),
            PolicyPreset {
                id: id.to_string(),
                description: description.to_string(),
                policy,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&PolicyPreset> {
        self.presets.get(id)
    }

    pub fn list(&self) -> Vec<&PolicyPreset> {
        let mut all: Vec<&PolicyPreset> = self.presets.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn has(&self, id: &str) -> bool {
        self.presets.contains_key(id)
    }
}

impl Default for PolicyPresets {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the global preset registry
pub fn get_presets() -> &'static PolicyPresets {
    use std::sync::OnceLock;
    static PRESETS: OnceLock<PolicyPresets> = OnceLock::new();
    PRESETS.get_or_init(PolicyPresets::new)
}
