//! Owned Python syntax tree consumed by the tracer, the pruner and the graph
//! builder.
//!
//! The tree keeps only the structure the analysis reasons about: statements
//! with nested bodies, calls with their arguments, and the handful of
//! expression shapes the endpoint matcher inspects. Everything else is kept
//! as an [`Expr::Other`] node with its named sub-expressions so that calls
//! nested anywhere stay reachable. The tree serializes to JSON with a
//! `_type` tag on every node.

use crate::endpoint::RouteAnnotation;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "_type")]
pub enum Stmt {
    Expr {
        value: Expr,
        lineno: usize,
    },
    /// Plain, augmented and annotated assignments.
    Assign {
        targets: Vec<Expr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        op: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Expr>,
        lineno: usize,
    },
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        lineno: usize,
    },
    For {
        target: Expr,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        is_async: bool,
        lineno: usize,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        lineno: usize,
    },
    With {
        items: Vec<Expr>,
        body: Vec<Stmt>,
        is_async: bool,
        lineno: usize,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
        lineno: usize,
    },
    Match {
        subject: Vec<Expr>,
        cases: Vec<MatchCase>,
        lineno: usize,
    },
    FunctionDef(FunctionDef),
    ClassDef(ClassDef),
    Return {
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Expr>,
        lineno: usize,
    },
    Raise {
        exprs: Vec<Expr>,
        lineno: usize,
    },
    Delete {
        targets: Vec<Expr>,
        lineno: usize,
    },
    Pass {
        lineno: usize,
    },
    Break {
        lineno: usize,
    },
    Continue {
        lineno: usize,
    },
    Import {
        names: Vec<ImportName>,
        lineno: usize,
    },
    ImportFrom {
        /// Module text as written, leading dots included (`..pkg.mod`).
        module: String,
        names: Vec<ImportName>,
        wildcard: bool,
        lineno: usize,
    },
    /// `assert`, `global`, `nonlocal`, `print`, `exec` and anything newer.
    Other {
        kind: String,
        exprs: Vec<Expr>,
        lineno: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub decorators: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub is_async: bool,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassDef {
    pub name: String,
    pub bases: Vec<Expr>,
    pub decorators: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptHandler {
    pub types: Vec<Expr>,
    pub body: Vec<Stmt>,
    pub lineno: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCase {
    pub pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportName {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ImportName {
    /// The name the import binds in the importing scope.
    pub fn bound_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "_type")]
pub enum Expr {
    Name {
        id: String,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Call(Call),
    /// String literal, already unquoted.
    Str {
        value: String,
    },
    /// Non-string literal kept as its source text.
    Constant {
        value: String,
    },
    JoinedStr {
        values: Vec<Expr>,
    },
    FormattedValue {
        value: Box<Expr>,
    },
    BinOp {
        left: Box<Expr>,
        op: String,
        right: Box<Expr>,
    },
    Other {
        kind: String,
        children: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Call {
    pub func: Box<Expr>,
    pub args: Vec<Expr>,
    pub keywords: Vec<Keyword>,
    pub lineno: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteAnnotation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Keyword {
    /// `None` for `**kwargs` unpacking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arg: Option<String>,
    pub value: Expr,
}

impl Call {
    pub fn keyword(&self, name: &str) -> Option<&Expr> {
        self.keywords
            .iter()
            .find(|keyword| keyword.arg.as_deref() == Some(name))
            .map(|keyword| &keyword.value)
    }
}

impl Expr {
    /// `a.b.c` for chains made only of names and attributes.
    pub fn dotted_name(&self) -> Option<String> {
        match self {
            Expr::Name { id } => Some(id.clone()),
            Expr::Attribute { value, attr } => {
                let base = value.dotted_name()?;
                Some(format!("{base}.{attr}"))
            }
            _ => None,
        }
    }

    /// Name a call target is tracked under: the identifier of a plain name,
    /// or the final attribute of an attribute chain.
    pub fn target_name(&self) -> Option<&str> {
        match self {
            Expr::Name { id } => Some(id),
            Expr::Attribute { attr, .. } => Some(attr),
            _ => None,
        }
    }

    /// Short source-like rendering used for labels and log fields.
    pub fn render(&self) -> String {
        match self {
            Expr::Name { id } => id.clone(),
            Expr::Attribute { value, attr } => format!("{}.{attr}", value.render()),
            Expr::Call(call) => format!("{}()", call.func.render()),
            Expr::Str { value } => format!("{value:?}"),
            Expr::Constant { value } => value.clone(),
            Expr::JoinedStr { .. } => "f\"...\"".to_string(),
            Expr::FormattedValue { value } => format!("{{{}}}", value.render()),
            Expr::BinOp { left, op, right } => {
                format!("{} {op} {}", left.render(), right.render())
            }
            Expr::Other { kind, .. } => format!("<{kind}>"),
        }
    }
}

/// One parsed module as handed out by a [`SyntaxProvider`].
#[derive(Debug, Clone)]
pub struct ModuleSyntax {
    pub name: String,
    pub path: PathBuf,
    pub body: Vec<Stmt>,
}

impl ModuleSyntax {
    /// Import statements at module level, in declaration order.
    pub fn imports(&self) -> impl Iterator<Item = &Stmt> {
        self.body
            .iter()
            .filter(|stmt| matches!(stmt, Stmt::Import { .. } | Stmt::ImportFrom { .. }))
    }

    /// Function declarations visible by name in this module: methods of
    /// top-level classes first, then top-level functions, which shadow
    /// methods of the same name.
    pub fn functions(&self) -> Vec<&FunctionDef> {
        let mut out: Vec<&FunctionDef> = Vec::new();
        for stmt in &self.body {
            if let Stmt::ClassDef(class) = stmt {
                for inner in &class.body {
                    if let Stmt::FunctionDef(def) = inner {
                        if !out.iter().any(|seen| seen.name == def.name) {
                            out.push(def);
                        }
                    }
                }
            }
        }
        for stmt in &self.body {
            if let Stmt::FunctionDef(def) = stmt {
                out.retain(|seen| seen.name != def.name);
                out.push(def);
            }
        }
        out
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions().into_iter().find(|def| def.name == name)
    }
}

/// Source of parsed modules.
pub trait SyntaxProvider {
    fn parse_module(&mut self, name: &str, path: &std::path::Path) -> anyhow::Result<ModuleSyntax>;
}

/// Import statements found anywhere in `body`, nested blocks included but
/// not nested function or class bodies.
pub fn nested_imports(body: &[Stmt]) -> Vec<&Stmt> {
    let mut out = Vec::new();
    for stmt in body {
        match stmt {
            Stmt::Import { .. } | Stmt::ImportFrom { .. } => out.push(stmt),
            Stmt::FunctionDef(_) | Stmt::ClassDef(_) => {}
            _ => {
                for block in child_blocks(stmt) {
                    out.extend(nested_imports(block));
                }
            }
        }
    }
    out
}

/// Statement lists directly nested in `stmt`, in source order.
pub fn child_blocks(stmt: &Stmt) -> Vec<&[Stmt]> {
    match stmt {
        Stmt::If { body, orelse, .. }
        | Stmt::For { body, orelse, .. }
        | Stmt::While { body, orelse, .. } => vec![body.as_slice(), orelse.as_slice()],
        Stmt::With { body, .. } => vec![body.as_slice()],
        Stmt::Try {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        } => {
            let mut blocks = vec![body.as_slice()];
            blocks.extend(handlers.iter().map(|handler| handler.body.as_slice()));
            blocks.push(orelse.as_slice());
            blocks.push(finalbody.as_slice());
            blocks
        }
        Stmt::Match { cases, .. } => cases.iter().map(|case| case.body.as_slice()).collect(),
        _ => Vec::new(),
    }
}

/// Expressions evaluated by `stmt` itself, excluding nested statement bodies.
pub fn header_exprs(stmt: &Stmt) -> Vec<&Expr> {
    match stmt {
        Stmt::Expr { value, .. } => vec![value],
        Stmt::Assign { targets, value, .. } => {
            let mut out: Vec<&Expr> = value.iter().collect();
            out.extend(targets.iter());
            out
        }
        Stmt::If { test, .. } | Stmt::While { test, .. } => vec![test],
        Stmt::For { target, iter, .. } => vec![iter, target],
        Stmt::With { items, .. } => items.iter().collect(),
        Stmt::Try { handlers, .. } => handlers
            .iter()
            .flat_map(|handler| handler.types.iter())
            .collect(),
        Stmt::Match { subject, cases, .. } => {
            let mut out: Vec<&Expr> = subject.iter().collect();
            out.extend(cases.iter().filter_map(|case| case.guard.as_ref()));
            out
        }
        Stmt::Return { value, .. } => value.iter().collect(),
        Stmt::Raise { exprs, .. } | Stmt::Other { exprs, .. } => exprs.iter().collect(),
        Stmt::Delete { targets, .. } => targets.iter().collect(),
        _ => Vec::new(),
    }
}

/// Every call in `body` in visiting order: an outer call comes before the
/// calls in its arguments, a statement's header before its nested blocks.
/// Bodies of nested functions and classes are not part of the sequence.
pub fn collect_calls(body: &[Stmt]) -> Vec<&Call> {
    let mut out = Vec::new();
    for stmt in body {
        collect_stmt_calls(stmt, &mut out);
    }
    out
}

fn collect_stmt_calls<'a>(stmt: &'a Stmt, out: &mut Vec<&'a Call>) {
    if let Stmt::Match { subject, cases, .. } = stmt {
        for expr in subject {
            collect_expr_calls(expr, out);
        }
        for case in cases {
            if let Some(guard) = &case.guard {
                collect_expr_calls(guard, out);
            }
            for inner in &case.body {
                collect_stmt_calls(inner, out);
            }
        }
        return;
    }
    if let Stmt::Try { body, handlers, orelse, finalbody, .. } = stmt {
        for inner in body {
            collect_stmt_calls(inner, out);
        }
        for handler in handlers {
            for expr in &handler.types {
                collect_expr_calls(expr, out);
            }
            for inner in &handler.body {
                collect_stmt_calls(inner, out);
            }
        }
        for inner in orelse.iter().chain(finalbody.iter()) {
            collect_stmt_calls(inner, out);
        }
        return;
    }
    for expr in header_exprs(stmt) {
        collect_expr_calls(expr, out);
    }
    for block in child_blocks(stmt) {
        for inner in block {
            collect_stmt_calls(inner, out);
        }
    }
}

fn collect_expr_calls<'a>(expr: &'a Expr, out: &mut Vec<&'a Call>) {
    match expr {
        Expr::Call(call) => {
            out.push(call);
            collect_expr_calls(&call.func, out);
            for arg in &call.args {
                collect_expr_calls(arg, out);
            }
            for keyword in &call.keywords {
                collect_expr_calls(&keyword.value, out);
            }
        }
        Expr::Attribute { value, .. } | Expr::FormattedValue { value } => {
            collect_expr_calls(value, out)
        }
        Expr::JoinedStr { values } => {
            for value in values {
                collect_expr_calls(value, out);
            }
        }
        Expr::BinOp { left, right, .. } => {
            collect_expr_calls(left, out);
            collect_expr_calls(right, out);
        }
        Expr::Other { children, .. } => {
            for child in children {
                collect_expr_calls(child, out);
            }
        }
        Expr::Name { .. } | Expr::Str { .. } | Expr::Constant { .. } => {}
    }
}

/// Mutable counterpart of [`collect_calls`], visiting calls in the same order.
pub fn visit_calls_mut(body: &mut [Stmt], visit: &mut dyn FnMut(&mut Call)) {
    for stmt in body {
        visit_stmt_calls_mut(stmt, visit);
    }
}

fn visit_stmt_calls_mut(stmt: &mut Stmt, visit: &mut dyn FnMut(&mut Call)) {
    match stmt {
        Stmt::Expr { value, .. } => visit_expr_calls_mut(value, visit),
        Stmt::Assign { targets, value, .. } => {
            if let Some(value) = value {
                visit_expr_calls_mut(value, visit);
            }
            for target in targets {
                visit_expr_calls_mut(target, visit);
            }
        }
        Stmt::If { test, body, orelse, .. } | Stmt::While { test, body, orelse, .. } => {
            visit_expr_calls_mut(test, visit);
            visit_calls_mut(body, visit);
            visit_calls_mut(orelse, visit);
        }
        Stmt::For { target, iter, body, orelse, .. } => {
            visit_expr_calls_mut(iter, visit);
            visit_expr_calls_mut(target, visit);
            visit_calls_mut(body, visit);
            visit_calls_mut(orelse, visit);
        }
        Stmt::With { items, body, .. } => {
            for item in items {
                visit_expr_calls_mut(item, visit);
            }
            visit_calls_mut(body, visit);
        }
        Stmt::Try { body, handlers, orelse, finalbody, .. } => {
            visit_calls_mut(body, visit);
            for handler in handlers {
                for expr in &mut handler.types {
                    visit_expr_calls_mut(expr, visit);
                }
                visit_calls_mut(&mut handler.body, visit);
            }
            visit_calls_mut(orelse, visit);
            visit_calls_mut(finalbody, visit);
        }
        Stmt::Match { subject, cases, .. } => {
            for expr in subject {
                visit_expr_calls_mut(expr, visit);
            }
            for case in cases {
                if let Some(guard) = &mut case.guard {
                    visit_expr_calls_mut(guard, visit);
                }
                visit_calls_mut(&mut case.body, visit);
            }
        }
        Stmt::Return { value, .. } => {
            if let Some(value) = value {
                visit_expr_calls_mut(value, visit);
            }
        }
        Stmt::Raise { exprs, .. } | Stmt::Other { exprs, .. } => {
            for expr in exprs {
                visit_expr_calls_mut(expr, visit);
            }
        }
        Stmt::Delete { targets, .. } => {
            for target in targets {
                visit_expr_calls_mut(target, visit);
            }
        }
        Stmt::FunctionDef(_)
        | Stmt::ClassDef(_)
        | Stmt::Pass { .. }
        | Stmt::Break { .. }
        | Stmt::Continue { .. }
        | Stmt::Import { .. }
        | Stmt::ImportFrom { .. } => {}
    }
}

fn visit_expr_calls_mut(expr: &mut Expr, visit: &mut dyn FnMut(&mut Call)) {
    match expr {
        Expr::Call(call) => {
            visit(call);
            visit_expr_calls_mut(&mut call.func, visit);
            for arg in &mut call.args {
                visit_expr_calls_mut(arg, visit);
            }
            for keyword in &mut call.keywords {
                visit_expr_calls_mut(&mut keyword.value, visit);
            }
        }
        Expr::Attribute { value, .. } | Expr::FormattedValue { value } => {
            visit_expr_calls_mut(value, visit)
        }
        Expr::JoinedStr { values } => {
            for value in values {
                visit_expr_calls_mut(value, visit);
            }
        }
        Expr::BinOp { left, right, .. } => {
            visit_expr_calls_mut(left, visit);
            visit_expr_calls_mut(right, visit);
        }
        Expr::Other { children, .. } => {
            for child in children {
                visit_expr_calls_mut(child, visit);
            }
        }
        Expr::Name { .. } | Expr::Str { .. } | Expr::Constant { .. } => {}
    }
}

/// True when some call in `expr` satisfies `pred`.
pub fn expr_has_call(expr: &Expr, pred: &dyn Fn(&Call) -> bool) -> bool {
    let mut calls = Vec::new();
    collect_expr_calls(expr, &mut calls);
    calls.into_iter().any(pred)
}

/// True when some call anywhere under `stmt` satisfies `pred`, nested
/// function and class bodies included.
pub fn stmt_has_call(stmt: &Stmt, pred: &dyn Fn(&Call) -> bool) -> bool {
    match stmt {
        Stmt::FunctionDef(def) => {
            def.decorators.iter().any(|expr| expr_has_call(expr, pred))
                || def.body.iter().any(|inner| stmt_has_call(inner, pred))
        }
        Stmt::ClassDef(class) => {
            class
                .decorators
                .iter()
                .chain(class.bases.iter())
                .any(|expr| expr_has_call(expr, pred))
                || class.body.iter().any(|inner| stmt_has_call(inner, pred))
        }
        _ => {
            header_exprs(stmt)
                .into_iter()
                .any(|expr| expr_has_call(expr, pred))
                || child_blocks(stmt)
                    .into_iter()
                    .flatten()
                    .any(|inner| stmt_has_call(inner, pred))
        }
    }
}
