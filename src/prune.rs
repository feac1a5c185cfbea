//! Reduction of a traced body to the statements that carry tracked calls.
//!
//! A reduced block is non-empty exactly when it still holds a tracked call,
//! and branch decisions are taken on reduced blocks. That keeps pruning
//! idempotent: a pruned body prunes to itself.

use crate::syntax::{Call, Expr, ExceptHandler, Stmt, expr_has_call, stmt_has_call};
use std::collections::BTreeSet;

pub struct Pruner<'a> {
    tracked: &'a BTreeSet<String>,
}

impl<'a> Pruner<'a> {
    pub fn new(tracked: &'a BTreeSet<String>) -> Self {
        Self { tracked }
    }

    fn is_tracked(&self, call: &Call) -> bool {
        call.func
            .target_name()
            .is_some_and(|name| self.tracked.contains(name))
    }

    fn expr_tracked(&self, expr: &Expr) -> bool {
        expr_has_call(expr, &|call| self.is_tracked(call))
    }

    fn stmt_tracked(&self, stmt: &Stmt) -> bool {
        stmt_has_call(stmt, &|call| self.is_tracked(call))
    }

    pub fn prune(&self, body: &[Stmt]) -> Vec<Stmt> {
        let mut out = Vec::new();
        for stmt in body {
            self.prune_stmt(stmt, &mut out);
        }
        out
    }

    fn prune_stmt(&self, stmt: &Stmt, out: &mut Vec<Stmt>) {
        match stmt {
            Stmt::FunctionDef(_)
            | Stmt::ClassDef(_)
            | Stmt::Return { .. }
            | Stmt::Break { .. }
            | Stmt::Continue { .. }
            | Stmt::Pass { .. }
            | Stmt::Delete { .. }
            | Stmt::Import { .. }
            | Stmt::ImportFrom { .. } => {}
            Stmt::If {
                test,
                body,
                orelse,
                lineno,
            } => {
                let body = self.prune(body);
                let orelse = self.prune(orelse);
                if self.expr_tracked(test) {
                    out.push(Stmt::If {
                        test: test.clone(),
                        body,
                        orelse,
                        lineno: *lineno,
                    });
                    return;
                }
                match (body.is_empty(), orelse.is_empty()) {
                    (false, false) => out.push(Stmt::If {
                        test: test.clone(),
                        body,
                        orelse,
                        lineno: *lineno,
                    }),
                    (false, true) => out.extend(body),
                    (true, false) => out.extend(orelse),
                    (true, true) => {}
                }
            }
            Stmt::For { body, .. } | Stmt::While { body, .. } => out.extend(self.prune(body)),
            Stmt::With {
                items,
                body,
                is_async,
                lineno,
            } => {
                let body = self.prune(body);
                if !body.is_empty() || items.iter().any(|item| self.expr_tracked(item)) {
                    out.push(Stmt::With {
                        items: items.clone(),
                        body,
                        is_async: *is_async,
                        lineno: *lineno,
                    });
                }
            }
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
                lineno,
            } => {
                let body = self.prune(body);
                let handlers: Vec<ExceptHandler> = handlers
                    .iter()
                    .map(|handler| ExceptHandler {
                        types: handler.types.clone(),
                        body: self.prune(&handler.body),
                        lineno: handler.lineno,
                    })
                    .collect();
                let orelse = self.prune(orelse);
                let finalbody = self.prune(finalbody);
                let keep = !body.is_empty()
                    || !orelse.is_empty()
                    || !finalbody.is_empty()
                    || handlers.iter().any(|handler| {
                        !handler.body.is_empty()
                            || handler.types.iter().any(|expr| self.expr_tracked(expr))
                    });
                if keep {
                    out.push(Stmt::Try {
                        body,
                        handlers,
                        orelse,
                        finalbody,
                        lineno: *lineno,
                    });
                }
            }
            Stmt::Expr { .. }
            | Stmt::Assign { .. }
            | Stmt::Match { .. }
            | Stmt::Raise { .. }
            | Stmt::Other { .. } => {
                if self.stmt_tracked(stmt) {
                    out.push(stmt.clone());
                }
            }
        }
    }
}

/// Prune `body` against the tracked call names of its module.
pub fn prune(body: &[Stmt], tracked: &BTreeSet<String>) -> Vec<Stmt> {
    Pruner::new(tracked).prune(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::python::PythonSyntax;
    use std::path::Path;

    fn body_of(source: &str) -> Vec<Stmt> {
        let mut syntax = PythonSyntax::new().unwrap();
        let module = syntax
            .parse_source("m", Path::new("m.py"), source)
            .unwrap();
        module.function("f").unwrap().body.clone()
    }

    fn tracked(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn drops_untracked_statements_and_control_transfer() {
        let body = body_of(
            r#"
def f():
    import os
    x = 1
    log("start")
    total = cart.get_total(x)
    helper()
    del x
    return total
"#,
        );
        let pruned = prune(&body, &tracked(&["get_total", "helper"]));
        assert_eq!(pruned.len(), 2);
        assert!(matches!(pruned[0], Stmt::Assign { .. }));
        assert!(matches!(pruned[1], Stmt::Expr { .. }));
    }

    #[test]
    fn single_tracked_branch_replaces_conditional() {
        let body = body_of(
            r#"
def f(flag):
    if flag:
        helper()
    else:
        log("no")
"#,
        );
        let pruned = prune(&body, &tracked(&["helper"]));
        assert_eq!(pruned.len(), 1);
        assert!(matches!(pruned[0], Stmt::Expr { lineno: 4, .. }));
    }

    #[test]
    fn both_tracked_branches_keep_conditional() {
        let body = body_of(
            r#"
def f(flag):
    if flag:
        helper()
        log("a")
    else:
        other()
"#,
        );
        let pruned = prune(&body, &tracked(&["helper", "other"]));
        let [Stmt::If { body, orelse, .. }] = pruned.as_slice() else {
            panic!("expected conditional, got {pruned:?}");
        };
        assert_eq!(body.len(), 1);
        assert_eq!(orelse.len(), 1);
    }

    #[test]
    fn tracked_test_keeps_conditional_with_empty_branches() {
        let body = body_of(
            r#"
def f():
    if check():
        log("a")
    else:
        log("b")
"#,
        );
        let pruned = prune(&body, &tracked(&["check"]));
        let [Stmt::If { body, orelse, .. }] = pruned.as_slice() else {
            panic!("expected conditional, got {pruned:?}");
        };
        assert!(body.is_empty());
        assert!(orelse.is_empty());
    }

    #[test]
    fn loops_are_flattened_into_their_body() {
        let body = body_of(
            r#"
def f(items):
    for item in items:
        if item:
            requests.post("/orders/place")
    while waiting():
        helper()
"#,
        );
        let pruned = prune(&body, &tracked(&["post", "helper"]));
        assert_eq!(pruned.len(), 2);
        assert!(pruned.iter().all(|stmt| matches!(stmt, Stmt::Expr { .. })));
    }

    #[test]
    fn pruning_is_idempotent() {
        let body = body_of(
            r#"
def f(flag):
    with session() as s:
        if check():
            helper()
        for x in range(3):
            if flag:
                helper()
            else:
                other()
    try:
        helper()
    except ValueError:
        return None
    finally:
        log("done")
    match flag:
        case 1:
            other()
"#,
        );
        let names = tracked(&["helper", "other", "check"]);
        let once = prune(&body, &names);
        let twice = prune(&once, &names);
        assert_eq!(once, twice);
        assert!(!once.is_empty());
    }
}
