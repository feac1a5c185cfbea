use crate::error::AnalysisError;
use crate::syntax::{
    Call, ClassDef, ExceptHandler, Expr, FunctionDef, ImportName, Keyword, MatchCase,
    ModuleSyntax, Stmt, SyntaxProvider,
};
use crate::util;
use anyhow::Result;
use std::path::Path;
use tracing::debug;
use tree_sitter::{Node, Parser};

/// tree-sitter backed [`SyntaxProvider`] for Python sources.
pub struct PythonSyntax {
    parser: Parser,
    max_file_size: u64,
}

impl PythonSyntax {
    pub fn new() -> Result<Self> {
        let mut parser = Parser::new();
        let language = tree_sitter_python::LANGUAGE;
        parser.set_language(&language.into())?;
        Ok(Self {
            parser,
            max_file_size: u64::MAX,
        })
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn parse_source(&mut self, name: &str, path: &Path, source: &str) -> Result<ModuleSyntax> {
        let tree = self
            .parser
            .parse(source, None)
            .ok_or_else(|| AnalysisError::Parse {
                path: path.display().to_string(),
            })?;
        let root = tree.root_node();
        if root.has_error() {
            debug!(module = %name, path = %path.display(), "syntax errors, lowering best effort");
        }
        Ok(ModuleSyntax {
            name: name.to_string(),
            path: path.to_path_buf(),
            body: lower_block(root, source),
        })
    }
}

impl SyntaxProvider for PythonSyntax {
    fn parse_module(&mut self, name: &str, path: &Path) -> Result<ModuleSyntax> {
        let size = std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        if size > self.max_file_size {
            return Err(AnalysisError::TooLarge {
                path: path.display().to_string(),
                size,
            }
            .into());
        }
        let source = util::read_to_string(path)?;
        self.parse_source(name, path, &source)
    }
}

fn lower_block(node: Node<'_>, source: &str) -> Vec<Stmt> {
    let mut out = Vec::new();
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if let Some(stmt) = lower_stmt(child, source) {
            out.push(stmt);
        }
    }
    out
}

fn lower_field_block(node: Node<'_>, field: &str, source: &str) -> Vec<Stmt> {
    node.child_by_field_name(field)
        .map(|block| lower_block(block, source))
        .unwrap_or_default()
}

fn lower_stmt(node: Node<'_>, source: &str) -> Option<Stmt> {
    let lineno = line(node);
    let stmt = match node.kind() {
        "comment" => return None,
        "expression_statement" => lower_expression_statement(node, source),
        "if_statement" => lower_if(node, source),
        "for_statement" => Stmt::For {
            target: lower_field(node, "left", source),
            iter: lower_field(node, "right", source),
            body: lower_field_block(node, "body", source),
            orelse: node
                .child_by_field_name("alternative")
                .map(|alt| lower_field_block(alt, "body", source))
                .unwrap_or_default(),
            is_async: has_async_keyword(node),
            lineno,
        },
        "while_statement" => Stmt::While {
            test: lower_field(node, "condition", source),
            body: lower_field_block(node, "body", source),
            orelse: node
                .child_by_field_name("alternative")
                .map(|alt| lower_field_block(alt, "body", source))
                .unwrap_or_default(),
            lineno,
        },
        "with_statement" => lower_with(node, source),
        "try_statement" => lower_try(node, source),
        "match_statement" => lower_match(node, source),
        "function_definition" => Stmt::FunctionDef(lower_function(node, Vec::new(), source)),
        "class_definition" => Stmt::ClassDef(lower_class(node, Vec::new(), source)),
        "decorated_definition" => lower_decorated(node, source)?,
        "return_statement" => Stmt::Return {
            value: first_expression(node).map(|child| lower_expr(child, source)),
            lineno,
        },
        "raise_statement" => Stmt::Raise {
            exprs: lower_named_children(node, source),
            lineno,
        },
        "delete_statement" => Stmt::Delete {
            targets: lower_named_children(node, source),
            lineno,
        },
        "pass_statement" => Stmt::Pass { lineno },
        "break_statement" => Stmt::Break { lineno },
        "continue_statement" => Stmt::Continue { lineno },
        "import_statement" => Stmt::Import {
            names: lower_import_names(node, None, source),
            lineno,
        },
        "import_from_statement" => lower_import_from(node, source),
        kind => Stmt::Other {
            kind: kind.to_string(),
            exprs: lower_named_children(node, source),
            lineno,
        },
    };
    Some(stmt)
}

fn lower_expression_statement(node: Node<'_>, source: &str) -> Stmt {
    let lineno = line(node);
    let children = named_children(node);
    if children.len() == 1 {
        let child = children[0];
        match child.kind() {
            "assignment" => return lower_assignment(child, source),
            "augmented_assignment" => {
                return Stmt::Assign {
                    targets: vec![lower_field(child, "left", source)],
                    op: child
                        .child_by_field_name("operator")
                        .map(|op| node_text(op, source)),
                    value: child
                        .child_by_field_name("right")
                        .map(|right| lower_expr(right, source)),
                    lineno,
                };
            }
            _ => {
                return Stmt::Expr {
                    value: lower_expr(child, source),
                    lineno,
                };
            }
        }
    }
    Stmt::Expr {
        value: Expr::Other {
            kind: "tuple".to_string(),
            children: children
                .into_iter()
                .map(|child| lower_expr(child, source))
                .collect(),
        },
        lineno,
    }
}

fn lower_assignment(node: Node<'_>, source: &str) -> Stmt {
    let lineno = line(node);
    let mut targets = Vec::new();
    let mut current = node;
    loop {
        if let Some(left) = current.child_by_field_name("left") {
            targets.push(lower_expr(left, source));
        }
        match current.child_by_field_name("right") {
            Some(right) if right.kind() == "assignment" => current = right,
            Some(right) => {
                return Stmt::Assign {
                    targets,
                    op: None,
                    value: Some(lower_expr(right, source)),
                    lineno,
                };
            }
            None => {
                return Stmt::Assign {
                    targets,
                    op: None,
                    value: None,
                    lineno,
                };
            }
        }
    }
}

fn lower_if(node: Node<'_>, source: &str) -> Stmt {
    let mut cursor = node.walk();
    let alternatives: Vec<Node<'_>> = node
        .children_by_field_name("alternative", &mut cursor)
        .collect();
    let mut orelse = Vec::new();
    for alt in alternatives.iter().rev() {
        match alt.kind() {
            "else_clause" => orelse = lower_field_block(*alt, "body", source),
            "elif_clause" => {
                orelse = vec![Stmt::If {
                    test: lower_field(*alt, "condition", source),
                    body: lower_field_block(*alt, "consequence", source),
                    orelse,
                    lineno: line(*alt),
                }];
            }
            _ => {}
        }
    }
    Stmt::If {
        test: lower_field(node, "condition", source),
        body: lower_field_block(node, "consequence", source),
        orelse,
        lineno: line(node),
    }
}

fn lower_with(node: Node<'_>, source: &str) -> Stmt {
    let mut items = Vec::new();
    for child in named_children(node) {
        if child.kind() != "with_clause" {
            continue;
        }
        for item in named_children(child) {
            let value = item.child_by_field_name("value").unwrap_or(item);
            items.push(lower_expr(value, source));
        }
    }
    Stmt::With {
        items,
        body: lower_field_block(node, "body", source),
        is_async: has_async_keyword(node),
        lineno: line(node),
    }
}

fn lower_try(node: Node<'_>, source: &str) -> Stmt {
    let mut handlers = Vec::new();
    let mut orelse = Vec::new();
    let mut finalbody = Vec::new();
    for child in named_children(node) {
        match child.kind() {
            "except_clause" | "except_group_clause" => {
                let mut types = Vec::new();
                let mut body = Vec::new();
                for part in named_children(child) {
                    match part.kind() {
                        "block" => body = lower_block(part, source),
                        "comment" => {}
                        _ => types.push(lower_expr(part, source)),
                    }
                }
                handlers.push(ExceptHandler {
                    types,
                    body,
                    lineno: line(child),
                });
            }
            "else_clause" => orelse = lower_field_block(child, "body", source),
            "finally_clause" => {
                if let Some(block) = named_children(child)
                    .into_iter()
                    .find(|part| part.kind() == "block")
                {
                    finalbody = lower_block(block, source);
                }
            }
            _ => {}
        }
    }
    Stmt::Try {
        body: lower_field_block(node, "body", source),
        handlers,
        orelse,
        finalbody,
        lineno: line(node),
    }
}

fn lower_match(node: Node<'_>, source: &str) -> Stmt {
    let mut cursor = node.walk();
    let subject = node
        .children_by_field_name("subject", &mut cursor)
        .map(|child| lower_expr(child, source))
        .collect();
    let mut cases = Vec::new();
    if let Some(body) = node.child_by_field_name("body") {
        for clause in named_children(body) {
            if clause.kind() != "case_clause" {
                continue;
            }
            let pattern = named_children(clause)
                .into_iter()
                .filter(|part| part.kind() == "case_pattern")
                .map(|part| node_text(part, source))
                .collect::<Vec<_>>()
                .join(", ");
            let guard = clause.child_by_field_name("guard").map(|guard| {
                let inner = if guard.kind() == "if_clause" {
                    first_expression(guard).unwrap_or(guard)
                } else {
                    guard
                };
                lower_expr(inner, source)
            });
            cases.push(MatchCase {
                pattern,
                guard,
                body: lower_field_block(clause, "consequence", source),
            });
        }
    }
    Stmt::Match {
        subject,
        cases,
        lineno: line(node),
    }
}

fn lower_decorated(node: Node<'_>, source: &str) -> Option<Stmt> {
    let mut decorators = Vec::new();
    for child in named_children(node) {
        if child.kind() == "decorator" {
            if let Some(expr) = first_expression(child) {
                decorators.push(lower_expr(expr, source));
            }
        }
    }
    let definition = node.child_by_field_name("definition")?;
    match definition.kind() {
        "function_definition" => Some(Stmt::FunctionDef(lower_function(
            definition, decorators, source,
        ))),
        "class_definition" => Some(Stmt::ClassDef(lower_class(definition, decorators, source))),
        _ => lower_stmt(definition, source),
    }
}

fn lower_function(node: Node<'_>, decorators: Vec<Expr>, source: &str) -> FunctionDef {
    let name = node
        .child_by_field_name("name")
        .map(|name| node_text(name, source))
        .unwrap_or_default();
    let params = node
        .child_by_field_name("parameters")
        .map(|params| {
            named_children(params)
                .into_iter()
                .filter(|param| param.kind() != "comment")
                .map(|param| parameter_name(param, source))
                .collect()
        })
        .unwrap_or_default();
    FunctionDef {
        name,
        params,
        decorators,
        body: lower_field_block(node, "body", source),
        is_async: has_async_keyword(node),
        lineno: line(node),
    }
}

fn parameter_name(node: Node<'_>, source: &str) -> String {
    if node.kind() == "identifier" {
        return node_text(node, source);
    }
    if let Some(name) = node.child_by_field_name("name") {
        return node_text(name, source);
    }
    match first_expression(node) {
        Some(inner) if inner.kind() == "identifier" && !node.kind().ends_with("splat_pattern") => {
            node_text(inner, source)
        }
        _ => node_text(node, source),
    }
}

fn lower_class(node: Node<'_>, decorators: Vec<Expr>, source: &str) -> ClassDef {
    ClassDef {
        name: node
            .child_by_field_name("name")
            .map(|name| node_text(name, source))
            .unwrap_or_default(),
        bases: node
            .child_by_field_name("superclasses")
            .map(|bases| lower_named_children(bases, source))
            .unwrap_or_default(),
        decorators,
        body: lower_field_block(node, "body", source),
        lineno: line(node),
    }
}

fn lower_import_names(node: Node<'_>, skip: Option<usize>, source: &str) -> Vec<ImportName> {
    let mut names = Vec::new();
    for child in named_children(node) {
        if Some(child.id()) == skip {
            continue;
        }
        match child.kind() {
            "dotted_name" => names.push(ImportName {
                name: node_text(child, source),
                alias: None,
            }),
            "aliased_import" => {
                let name = child
                    .child_by_field_name("name")
                    .map(|name| node_text(name, source))
                    .unwrap_or_default();
                let alias = child
                    .child_by_field_name("alias")
                    .map(|alias| node_text(alias, source));
                names.push(ImportName { name, alias });
            }
            _ => {}
        }
    }
    names
}

fn lower_import_from(node: Node<'_>, source: &str) -> Stmt {
    let module_node = node.child_by_field_name("module_name");
    let module = module_node
        .map(|module| node_text(module, source))
        .unwrap_or_default();
    let wildcard = named_children(node)
        .iter()
        .any(|child| child.kind() == "wildcard_import");
    Stmt::ImportFrom {
        module,
        names: lower_import_names(node, module_node.map(|module| module.id()), source),
        wildcard,
        lineno: line(node),
    }
}

fn lower_field(node: Node<'_>, field: &str, source: &str) -> Expr {
    match node.child_by_field_name(field) {
        Some(child) => lower_expr(child, source),
        None => Expr::Other {
            kind: "missing".to_string(),
            children: Vec::new(),
        },
    }
}

fn lower_named_children(node: Node<'_>, source: &str) -> Vec<Expr> {
    named_children(node)
        .into_iter()
        .filter(|child| child.kind() != "comment")
        .map(|child| lower_expr(child, source))
        .collect()
}

fn lower_expr(node: Node<'_>, source: &str) -> Expr {
    match node.kind() {
        "identifier" => Expr::Name {
            id: node_text(node, source),
        },
        "attribute" => Expr::Attribute {
            value: Box::new(lower_field(node, "object", source)),
            attr: node
                .child_by_field_name("attribute")
                .map(|attr| node_text(attr, source))
                .unwrap_or_default(),
        },
        "call" => Expr::Call(lower_call(node, source)),
        "string" => lower_string(node, source),
        "concatenated_string" => lower_concatenated(node, source),
        "integer" | "float" | "true" | "false" | "none" | "ellipsis" => Expr::Constant {
            value: node_text(node, source),
        },
        "binary_operator" => Expr::BinOp {
            left: Box::new(lower_field(node, "left", source)),
            op: node
                .child_by_field_name("operator")
                .map(|op| node_text(op, source))
                .unwrap_or_default(),
            right: Box::new(lower_field(node, "right", source)),
        },
        "parenthesized_expression" => match first_expression(node) {
            Some(inner) => lower_expr(inner, source),
            None => Expr::Other {
                kind: "tuple".to_string(),
                children: Vec::new(),
            },
        },
        kind => Expr::Other {
            kind: kind.to_string(),
            children: lower_named_children(node, source),
        },
    }
}

fn lower_call(node: Node<'_>, source: &str) -> Call {
    let mut args = Vec::new();
    let mut keywords = Vec::new();
    if let Some(arguments) = node.child_by_field_name("arguments") {
        if arguments.kind() == "argument_list" {
            for child in named_children(arguments) {
                match child.kind() {
                    "comment" => {}
                    "keyword_argument" => {
                        if let (Some(name), Some(value)) = (
                            child.child_by_field_name("name"),
                            child.child_by_field_name("value"),
                        ) {
                            keywords.push(Keyword {
                                arg: Some(node_text(name, source)),
                                value: lower_expr(value, source),
                            });
                        }
                    }
                    "dictionary_splat" => {
                        if let Some(value) = first_expression(child) {
                            keywords.push(Keyword {
                                arg: None,
                                value: lower_expr(value, source),
                            });
                        }
                    }
                    _ => args.push(lower_expr(child, source)),
                }
            }
        } else {
            args.push(lower_expr(arguments, source));
        }
    }
    Call {
        func: Box::new(lower_field(node, "function", source)),
        args,
        keywords,
        lineno: line(node),
        route: None,
    }
}

fn lower_string(node: Node<'_>, source: &str) -> Expr {
    let mut values = Vec::new();
    let mut text = String::new();
    let mut interpolated = false;
    let raw = is_raw_string(node, source);
    for child in named_children(node) {
        match child.kind() {
            "string_content" | "escape_sequence" if raw => text.push_str(raw_text(child, source)),
            "string_content" | "escape_sequence" => unescape_into(raw_text(child, source), &mut text),
            "interpolation" => {
                interpolated = true;
                if !text.is_empty() {
                    values.push(Expr::Str {
                        value: std::mem::take(&mut text),
                    });
                }
                let inner = child
                    .child_by_field_name("expression")
                    .or_else(|| first_expression(child));
                if let Some(inner) = inner {
                    values.push(Expr::FormattedValue {
                        value: Box::new(lower_expr(inner, source)),
                    });
                }
            }
            _ => {}
        }
    }
    if !interpolated {
        return Expr::Str { value: text };
    }
    if !text.is_empty() {
        values.push(Expr::Str { value: text });
    }
    Expr::JoinedStr { values }
}

fn is_raw_string(node: Node<'_>, source: &str) -> bool {
    named_children(node)
        .into_iter()
        .find(|child| child.kind() == "string_start")
        .is_some_and(|start| raw_text(start, source).contains(['r', 'R']))
}

/// Append `raw` with the escapes that matter for URL text decoded. Unknown
/// escapes keep their backslash.
fn unescape_into(raw: &str, out: &mut String) {
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('/') => out.push('/'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\n') => {}
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
}

fn lower_concatenated(node: Node<'_>, source: &str) -> Expr {
    let mut values = Vec::new();
    for child in named_children(node) {
        match lower_expr(child, source) {
            Expr::JoinedStr { values: inner } => values.extend(inner),
            other => values.push(other),
        }
    }
    if values.iter().all(|value| matches!(value, Expr::Str { .. })) {
        let mut joined = String::new();
        for value in &values {
            if let Expr::Str { value } = value {
                joined.push_str(value);
            }
        }
        return Expr::Str { value: joined };
    }
    Expr::JoinedStr { values }
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

fn first_expression(node: Node<'_>) -> Option<Node<'_>> {
    named_children(node)
        .into_iter()
        .find(|child| child.kind() != "comment")
}

fn has_async_keyword(node: Node<'_>) -> bool {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).any(|child| child.kind() == "async");
    found
}

fn line(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

fn node_text(node: Node<'_>, source: &str) -> String {
    raw_text(node, source).trim().to_string()
}

fn raw_text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    let start = node.start_byte();
    let end = node.end_byte();
    source.get(start..end).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::PythonSyntax;
    use crate::syntax::{Expr, Stmt, collect_calls};
    use std::path::Path;

    fn parse(source: &str) -> Vec<Stmt> {
        let mut syntax = PythonSyntax::new().unwrap();
        syntax
            .parse_source("sample", Path::new("sample.py"), source)
            .unwrap()
            .body
    }

    #[test]
    fn lowers_functions_calls_and_lines() {
        let body = parse(
            r#"
import requests

def buy_cart(user_id):
    items = cart.get_cart_items(user_id)
    helper()
    return requests.get("/cart/total_price/42")
"#,
        );
        let Some(Stmt::FunctionDef(def)) = body.get(1) else {
            panic!("expected function, got {body:?}");
        };
        assert_eq!(def.name, "buy_cart");
        assert_eq!(def.params, vec!["user_id"]);
        let calls = collect_calls(&def.body);
        let names: Vec<String> = calls
            .iter()
            .filter_map(|call| call.func.dotted_name())
            .collect();
        assert_eq!(names, vec!["cart.get_cart_items", "helper", "requests.get"]);
        assert_eq!(calls[0].lineno, 5);
        assert_eq!(calls[2].lineno, 7);
        assert_eq!(
            calls[2].args[0],
            Expr::Str {
                value: "/cart/total_price/42".to_string()
            }
        );
    }

    #[test]
    fn lowers_fstrings_into_joined_values() {
        let body = parse("requests.get(f\"/cart/items/{uid}\")\n");
        let calls = collect_calls(&body);
        let Expr::JoinedStr { values } = &calls[0].args[0] else {
            panic!("expected f-string, got {:?}", calls[0].args[0]);
        };
        assert_eq!(values.len(), 2);
        assert!(matches!(&values[1], Expr::FormattedValue { .. }));
    }

    #[test]
    fn lowers_elif_chain_as_nested_if() {
        let body = parse(
            r#"
if a():
    b()
elif c():
    d()
else:
    e()
"#,
        );
        let Some(Stmt::If { orelse, .. }) = body.first() else {
            panic!("expected if, got {body:?}");
        };
        let Some(Stmt::If { orelse: inner, .. }) = orelse.first() else {
            panic!("expected elif, got {orelse:?}");
        };
        assert_eq!(inner.len(), 1);
    }

    #[test]
    fn lowers_imports_with_aliases() {
        let body = parse("import a.b as c, d\nfrom ..pkg import mod as m, other\n");
        match &body[0] {
            Stmt::Import { names, .. } => {
                assert_eq!(names[0].name, "a.b");
                assert_eq!(names[0].bound_name(), "c");
                assert_eq!(names[1].bound_name(), "d");
            }
            other => panic!("expected import, got {other:?}"),
        }
        match &body[1] {
            Stmt::ImportFrom { module, names, wildcard, .. } => {
                assert_eq!(module, "..pkg");
                assert!(!wildcard);
                assert_eq!(names.len(), 2);
                assert_eq!(names[0].bound_name(), "m");
            }
            other => panic!("expected from-import, got {other:?}"),
        }
    }

    #[test]
    fn decorated_methods_are_visible_as_functions() {
        let mut syntax = PythonSyntax::new().unwrap();
        let module = syntax
            .parse_source(
                "svc",
                Path::new("svc.py"),
                r#"
class Service:
    @staticmethod
    def run():
        pass

@app.route("/orders/<int:order_id>", methods=["GET"])
def get_order(order_id):
    pass
"#,
            )
            .unwrap();
        assert!(module.function("run").is_some());
        let def = module.function("get_order").unwrap();
        assert_eq!(def.decorators.len(), 1);
    }

    #[test]
    fn string_escapes_are_decoded_except_in_raw_strings() {
        let body = parse(
            "requests.post(\"\\\\orders\\\\place\")\nrequests.post(r\"\\\\orders\")\nrequests.get(f\"\\\\cart\\/{uid}\")\n",
        );
        let calls = collect_calls(&body);
        assert_eq!(
            calls[0].args[0],
            Expr::Str {
                value: "\\orders\\place".to_string()
            }
        );
        assert_eq!(
            calls[1].args[0],
            Expr::Str {
                value: "\\\\orders".to_string()
            }
        );
        let Expr::JoinedStr { values } = &calls[2].args[0] else {
            panic!("expected f-string, got {:?}", calls[2].args[0]);
        };
        assert_eq!(
            values[0],
            Expr::Str {
                value: "\\cart/".to_string()
            }
        );
    }
}
