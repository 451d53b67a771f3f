//! Syntax-tree walker applying the capability policy
//!
//! Every violation is collected; nothing short-circuits except the nesting
//! bound, which stops descending into the offending subtree.

use crate::config::types::Policy;
use crate::policy::location::LineIndex;
use crate::policy::violation::{Violation, ViolationRule};
use rustpython_parser::ast::{self, Ranged};
use rustpython_parser::{lexer, Mode, Tok};
use std::collections::HashMap;

/// Calls that look an attribute up by string
enum DynamicLookup {
    /// Attribute name is the positional argument at this index
    Positional(usize),
    /// Every positional argument is an attribute name (dotted allowed)
    AllArgs,
}

fn dynamic_lookup(qualified: &str) -> Option<DynamicLookup> {
    match qualified {
        "getattr" | "setattr" | "delattr" | "hasattr" => Some(DynamicLookup::Positional(1)),
        "operator.methodcaller" => Some(DynamicLookup::Positional(0)),
        "operator.attrgetter" => Some(DynamicLookup::AllArgs),
        _ => None,
    }
}

fn start_of<T: Ranged>(node: &T) -> usize {
    usize::from(node.range().start())
}

/// Deepest bracket nesting in `source`: (depth, byte offset where it was reached)
///
/// Counted on the token stream, so brackets in strings and comments are
/// ignored. Lexing stops at the first error and the parser reports it.
pub(crate) fn bracket_depth(source: &str) -> (usize, usize) {
    let mut depth = 0usize;
    let mut max = (0, 0);
    for (tok, range) in lexer::lex(source, Mode::Module).map_while(|token| token.ok()) {
        match tok {
            Tok::Lpar | Tok::Lsqb | Tok::Lbrace => {
                depth += 1;
                if depth > max.0 {
                    max = (depth, usize::from(range.start()));
                }
            }
            Tok::Rpar | Tok::Rsqb | Tok::Rbrace => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

pub(crate) struct Checker<'p, 'src> {
    policy: &'p Policy,
    index: LineIndex<'src>,
    /// local name -> qualified name (`np` -> `numpy`)
    aliases: HashMap<String, String>,
    violations: Vec<Violation>,
    depth: usize,
    max_depth: usize,
    depth_reported: bool,
}

impl<'p, 'src> Checker<'p, 'src> {
    pub fn new(policy: &'p Policy, source: &'src str, max_depth: usize) -> Self {
        Self {
            policy,
            index: LineIndex::new(source),
            aliases: HashMap::new(),
            violations: Vec::new(),
            depth: 0,
            max_depth,
            depth_reported: false,
        }
    }

    /// Walk the whole suite and return the sorted findings
    pub fn check_suite(mut self, suite: &[ast::Stmt]) -> Vec<Violation> {
        self.visit_body(suite);
        self.into_violations()
    }

    pub fn into_violations(mut self) -> Vec<Violation> {
        self.violations.sort();
        self.violations.dedup();
        self.violations
    }

    pub fn report(&mut self, offset: usize, rule: ViolationRule, detail: String) {
        self.violations.push(Violation {
            location: self.index.location(offset),
            rule,
            detail,
        });
    }

    fn unsupported(&mut self, offset: usize, what: &str) {
        self.report(offset, ViolationRule::SyntaxUnsupported, format!("{} not supported", what));
    }

    fn enter(&mut self, offset: usize) -> bool {
        self.depth += 1;
        if self.depth > self.max_depth {
            self.depth -= 1;
            if !self.depth_reported {
                self.depth_reported = true;
                self.report(
                    offset,
                    ViolationRule::SyntaxUnsupported,
                    format!("nesting deeper than {} levels", self.max_depth),
                );
            }
            return false;
        }
        true
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn visit_body(&mut self, body: &[ast::Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_exprs(&mut self, exprs: &[ast::Expr]) {
        for expr in exprs {
            self.visit_expr(expr);
        }
    }

    fn visit_opt(&mut self, expr: &Option<Box<ast::Expr>>) {
        if let Some(expr) = expr {
            self.visit_expr(expr);
        }
    }

    fn visit_stmt(&mut self, stmt: &ast::Stmt) {
        let offset = start_of(stmt);
        if !self.enter(offset) {
            return;
        }

        match stmt {
            ast::Stmt::FunctionDef(ast::StmtFunctionDef {
                args,
                body,
                decorator_list,
                returns,
                ..
            }) => {
                self.visit_exprs(decorator_list);
                self.visit_arguments(args);
                self.visit_opt(returns);
                self.visit_body(body);
            }
            ast::Stmt::ClassDef(ast::StmtClassDef {
                bases,
                keywords,
                body,
                decorator_list,
                ..
            }) => {
                self.visit_exprs(decorator_list);
                self.visit_exprs(bases);
                for keyword in keywords {
                    self.visit_expr(&keyword.value);
                }
                self.visit_body(body);
            }
            ast::Stmt::Return(ast::StmtReturn { value, .. }) => self.visit_opt(value),
            ast::Stmt::Delete(ast::StmtDelete { targets, .. }) => self.visit_exprs(targets),
            ast::Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                self.visit_exprs(targets);
                self.visit_expr(value);
                self.track_assignment(targets, value);
            }
            ast::Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
                self.visit_expr(target);
                self.visit_expr(value);
            }
            ast::Stmt::AnnAssign(ast::StmtAnnAssign {
                target,
                annotation,
                value,
                ..
            }) => {
                self.visit_expr(target);
                self.visit_expr(annotation);
                self.visit_opt(value);
            }
            ast::Stmt::For(ast::StmtFor {
                target,
                iter,
                body,
                orelse,
                ..
            }) => {
                self.visit_expr(target);
                self.visit_expr(iter);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            ast::Stmt::While(ast::StmtWhile {
                test, body, orelse, ..
            })
            | ast::Stmt::If(ast::StmtIf {
                test, body, orelse, ..
            }) => {
                self.visit_expr(test);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            ast::Stmt::With(ast::StmtWith { items, body, .. }) => {
                for item in items {
                    self.visit_expr(&item.context_expr);
                    self.visit_opt(&item.optional_vars);
                }
                self.visit_body(body);
            }
            ast::Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
                self.visit_opt(exc);
                self.visit_opt(cause);
            }
            ast::Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                self.visit_body(body);
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    self.visit_opt(&handler.type_);
                    self.visit_body(&handler.body);
                }
                self.visit_body(orelse);
                self.visit_body(finalbody);
            }
            ast::Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
                self.visit_expr(test);
                self.visit_opt(msg);
            }
            ast::Stmt::Import(ast::StmtImport { names, .. }) => self.check_import(offset, names),
            ast::Stmt::ImportFrom(import) => self.check_import_from(offset, import),
            ast::Stmt::Expr(ast::StmtExpr { value, .. }) => self.visit_expr(value),
            ast::Stmt::Global(_)
            | ast::Stmt::Nonlocal(_)
            | ast::Stmt::Pass(_)
            | ast::Stmt::Break(_)
            | ast::Stmt::Continue(_) => {}
            ast::Stmt::AsyncFunctionDef(_) | ast::Stmt::AsyncFor(_) | ast::Stmt::AsyncWith(_) => {
                self.unsupported(offset, "async statements are")
            }
            ast::Stmt::Match(_) => self.unsupported(offset, "match statements are"),
            ast::Stmt::TryStar(_) => self.unsupported(offset, "try/except* is"),
            #[allow(unreachable_patterns)]
            _ => self.unsupported(offset, "this statement is"),
        }

        self.leave();
    }

    fn visit_expr(&mut self, expr: &ast::Expr) {
        let offset = start_of(expr);
        if !self.enter(offset) {
            return;
        }

        match expr {
            ast::Expr::BoolOp(ast::ExprBoolOp { values, .. }) => self.visit_exprs(values),
            ast::Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
                self.visit_expr(target);
                self.visit_expr(value);
            }
            ast::Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            ast::Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => self.visit_expr(operand),
            ast::Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
                self.visit_arguments(args);
                self.visit_expr(body);
            }
            ast::Expr::IfExp(ast::ExprIfExp {
                test, body, orelse, ..
            }) => {
                self.visit_expr(test);
                self.visit_expr(body);
                self.visit_expr(orelse);
            }
            ast::Expr::Dict(ast::ExprDict { keys, values, .. }) => {
                for key in keys.iter().flatten() {
                    self.visit_expr(key);
                }
                self.visit_exprs(values);
            }
            ast::Expr::Set(ast::ExprSet { elts, .. })
            | ast::Expr::List(ast::ExprList { elts, .. })
            | ast::Expr::Tuple(ast::ExprTuple { elts, .. }) => self.visit_exprs(elts),
            ast::Expr::ListComp(ast::ExprListComp {
                elt, generators, ..
            })
            | ast::Expr::SetComp(ast::ExprSetComp {
                elt, generators, ..
            })
            | ast::Expr::GeneratorExp(ast::ExprGeneratorExp {
                elt, generators, ..
            }) => {
                self.visit_comprehensions(generators);
                self.visit_expr(elt);
            }
            ast::Expr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                ..
            }) => {
                self.visit_comprehensions(generators);
                self.visit_expr(key);
                self.visit_expr(value);
            }
            ast::Expr::Await(_) => self.unsupported(offset, "await expressions are"),
            ast::Expr::Yield(ast::ExprYield { value, .. }) => self.visit_opt(value),
            ast::Expr::YieldFrom(ast::ExprYieldFrom { value, .. }) => self.visit_expr(value),
            ast::Expr::Compare(ast::ExprCompare {
                left, comparators, ..
            }) => {
                self.visit_expr(left);
                self.visit_exprs(comparators);
            }
            ast::Expr::Call(call) => self.check_call(call),
            ast::Expr::FormattedValue(ast::ExprFormattedValue {
                value, format_spec, ..
            }) => {
                self.visit_expr(value);
                self.visit_opt(format_spec);
            }
            ast::Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => self.visit_exprs(values),
            ast::Expr::Constant(_) => {}
            ast::Expr::Attribute(attribute) => self.check_attribute(attribute),
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                self.visit_expr(value);
                self.visit_expr(slice);
            }
            ast::Expr::Starred(ast::ExprStarred { value, .. }) => self.visit_expr(value),
            ast::Expr::Name(name) => self.check_name(offset, name),
            ast::Expr::Slice(ast::ExprSlice {
                lower, upper, step, ..
            }) => {
                self.visit_opt(lower);
                self.visit_opt(upper);
                self.visit_opt(step);
            }
            #[allow(unreachable_patterns)]
            _ => self.unsupported(offset, "this expression is"),
        }

        self.leave();
    }

    fn visit_arguments(&mut self, arguments: &ast::Arguments) {
        let with_defaults = arguments
            .posonlyargs
            .iter()
            .chain(&arguments.args)
            .chain(&arguments.kwonlyargs);
        for arg in with_defaults {
            self.visit_opt(&arg.def.annotation);
            self.visit_opt(&arg.default);
        }
        for arg in arguments.vararg.iter().chain(&arguments.kwarg) {
            self.visit_opt(&arg.annotation);
        }
    }

    fn visit_comprehensions(&mut self, generators: &[ast::Comprehension]) {
        for generator in generators {
            if generator.is_async {
                self.unsupported(start_of(&generator.target), "async comprehensions are");
            }
            self.visit_expr(&generator.target);
            self.visit_expr(&generator.iter);
            self.visit_exprs(&generator.ifs);
        }
    }

    /// Dotted name for a `Name`/`Attribute` chain, with import aliases resolved
    fn qualified_name(&self, expr: &ast::Expr) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = expr;
        loop {
            match current {
                ast::Expr::Attribute(attribute) => {
                    parts.push(attribute.attr.as_str());
                    current = &attribute.value;
                }
                ast::Expr::Name(name) => {
                    let id = name.id.as_str();
                    let base = self.aliases.get(id).map(String::as_str).unwrap_or(id);
                    parts.push(base);
                    break;
                }
                _ => return None,
            }
        }
        parts.reverse();
        Some(parts.join("."))
    }

    fn check_name(&mut self, offset: usize, name: &ast::ExprName) {
        if matches!(name.ctx, ast::ExprContext::Store) {
            return;
        }

        let policy = self.policy;
        let id = name.id.as_str();
        let qualified = self.aliases.get(id).cloned();

        if policy.is_denied(id) {
            self.report(offset, ViolationRule::DeniedName, format!("use of denied name '{}'", id));
        } else if let Some(qualified) = qualified.filter(|q| policy.is_denied(q)) {
            self.report(
                offset,
                ViolationRule::DeniedName,
                format!("use of denied name '{}' (bound to '{}')", id, qualified),
            );
        }
    }

    fn check_attribute(&mut self, attribute: &ast::ExprAttribute) {
        let policy = self.policy;
        let attr = attribute.attr.as_str();
        let offset = start_of(attribute);

        if policy.is_denied(attr) {
            self.report(
                offset,
                ViolationRule::DeniedAttributeAccess,
                format!("access to denied attribute '{}'", attr),
            );
        } else if let Some(chain) = self
            .qualified_name(&attribute.value)
            .map(|base| format!("{}.{}", base, attr))
            .filter(|chain| policy.is_denied(chain))
        {
            self.report(
                offset,
                ViolationRule::DeniedAttributeAccess,
                format!("access to denied attribute '{}'", chain),
            );
        }

        self.visit_expr(&attribute.value);
    }

    fn check_call(&mut self, call: &ast::ExprCall) {
        let lookup = self
            .qualified_name(&call.func)
            .and_then(|name| dynamic_lookup(&name).map(|lookup| (name, lookup)));

        if let Some((name, lookup)) = lookup {
            self.check_dynamic_lookup(&name, lookup, call);
        }

        self.visit_expr(&call.func);
        self.visit_exprs(&call.args);
        for keyword in &call.keywords {
            self.visit_expr(&keyword.value);
        }
    }

    fn check_dynamic_lookup(&mut self, name: &str, lookup: DynamicLookup, call: &ast::ExprCall) {
        if let Some(starred) = call
            .args
            .iter()
            .find(|arg| matches!(arg, ast::Expr::Starred(_)))
        {
            self.unsupported(start_of(starred), &format!("{}() with unpacked arguments is", name));
            return;
        }

        let attribute_args: Vec<&ast::Expr> = match lookup {
            DynamicLookup::Positional(index) => call.args.get(index).into_iter().collect(),
            DynamicLookup::AllArgs => call.args.iter().collect(),
        };

        for arg in attribute_args {
            match arg {
                ast::Expr::Constant(ast::ExprConstant {
                    value: ast::Constant::Str(attr),
                    ..
                }) => {
                    let policy = self.policy;
                    if let Some(denied) = attr.split('.').find(|part| policy.is_denied(part)) {
                        self.report(
                            start_of(arg),
                            ViolationRule::DeniedAttributeAccess,
                            format!("{}() of denied attribute '{}'", name, denied),
                        );
                    }
                }
                other => self.unsupported(
                    start_of(other),
                    &format!("{}() with a computed attribute name is", name),
                ),
            }
        }
    }

    fn check_module(&mut self, offset: usize, module: &str) {
        let policy = self.policy;
        if !policy.module_allowed(module) {
            self.report(
                offset,
                ViolationRule::DeniedImport,
                format!("import of module '{}' is not allowed", module),
            );
        } else if policy.is_denied(module) {
            self.report(
                offset,
                ViolationRule::DeniedImport,
                format!("module '{}' is denied", module),
            );
        }
    }

    fn check_import(&mut self, offset: usize, names: &[ast::Alias]) {
        for alias in names {
            let module = alias.name.as_str();
            self.check_module(offset, module);

            let (local, target) = match &alias.asname {
                Some(asname) => (asname.as_str().to_string(), module.to_string()),
                None => {
                    let head = module.split('.').next().unwrap_or(module);
                    (head.to_string(), head.to_string())
                }
            };
            self.aliases.insert(local, target);
        }
    }

    fn check_import_from(&mut self, offset: usize, import: &ast::StmtImportFrom) {
        let level = import.level.as_ref().map(|level| level.to_u32()).unwrap_or(0);
        if level > 0 {
            self.unsupported(offset, "relative imports are");
            return;
        }
        let module = match &import.module {
            Some(module) => module.as_str(),
            None => {
                self.unsupported(offset, "imports without a module are");
                return;
            }
        };

        self.check_module(offset, module);

        let policy = self.policy;
        for alias in &import.names {
            let name = alias.name.as_str();
            if name == "*" {
                self.unsupported(offset, &format!("star import from '{}' is", module));
                continue;
            }

            let qualified = format!("{}.{}", module, name);
            if policy.is_denied(name) || policy.is_denied(&qualified) {
                self.report(
                    offset,
                    ViolationRule::DeniedName,
                    format!("import of denied name '{}'", qualified),
                );
            }

            let local = alias.asname.as_ref().map(|a| a.as_str()).unwrap_or(name);
            self.aliases.insert(local.to_string(), qualified);
        }
    }

    /// `x = os` makes `x.system` resolve like `os.system`
    fn track_assignment(&mut self, targets: &[ast::Expr], value: &ast::Expr) {
        let [ast::Expr::Name(target)] = targets else {
            return;
        };
        match self.qualified_name(value) {
            Some(qualified) => {
                self.aliases.insert(target.id.as_str().to_string(), qualified);
            }
            None => {
                self.aliases.remove(target.id.as_str());
            }
        }
    }
}
