use flowtrace::analysis::{AnalysisOptions, analyze};
use flowtrace::catalog::RouteCatalog;
use flowtrace::config::UnresolvedCallPolicy;
use flowtrace::error::AnalysisError;
use flowtrace::graph::GraphExport;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write(root: &Path, rel: &str, source: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, source).unwrap();
    path
}

fn catalog(value: serde_json::Value) -> RouteCatalog {
    RouteCatalog::from_json_str(&value.to_string()).unwrap()
}

fn lines(export: &GraphExport, start: &str, end: &str) -> Vec<usize> {
    export
        .edges
        .iter()
        .find(|edge| edge.start_node == start && edge.end_node == end)
        .map(|edge| edge.call_lines.clone())
        .unwrap_or_else(|| panic!("missing edge {start} -> {end}"))
}

fn assert_no_dangling(export: &GraphExport) {
    for edge in &export.edges {
        assert!(export.nodes.contains_key(&edge.start_node), "{}", edge.start_node);
        assert!(export.nodes.contains_key(&edge.end_node), "{}", edge.end_node);
        assert!(!edge.call_lines.is_empty());
    }
    for edge in &export.dotted_edges {
        assert!(export.nodes.contains_key(&edge.start_node));
        assert!(export.nodes.contains_key(&edge.end_node));
    }
}

const WEBSITE: &str = r#"import requests
from cart import get_cart


def buy_cart(user_id):
    cart = get_cart(user_id)
    total = requests.get(f"http://order:5000/cart/total_price/{user_id}")
    requests.post("http://order:5000/orders/place", json=cart)
    return total
"#;

const CART: &str = r#"def get_cart(user_id):
    items = load(user_id)
    return items


def load(user_id):
    if user_id:
        return load(user_id - 1)
    return []
"#;

fn order_catalog() -> RouteCatalog {
    catalog(json!([
        {
            "module": "order",
            "name": "/cart/total_price/<int:user_id>",
            "methods": ["GET"],
            "func_name": "get_total_price",
            "file": "/srv/order/order.py",
            "lineno": 12
        },
        {
            "module": "order",
            "name": "/orders/place",
            "methods": ["POST"],
            "func_name": "place_order",
            "file": "/srv/order/order.py"
        }
    ]))
}

fn website_project() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let entry = write(temp.path(), "website/website.py", WEBSITE);
    write(temp.path(), "website/cart.py", CART);
    (temp, entry)
}

#[test]
fn cross_service_calls_link_to_catalog_routes() {
    let (_temp, entry) = website_project();
    let analysis = analyze(&entry, "buy_cart", &order_catalog(), &AnalysisOptions::default()).unwrap();
    assert_eq!(analysis.entry_module, "website");

    let export = analysis.graph.export();
    assert_no_dangling(&export);
    assert_eq!(export.nodes.len(), 5);
    assert_eq!(lines(&export, "website.buy_cart", "cart.get_cart"), vec![6]);
    assert_eq!(lines(&export, "website.buy_cart", "order.get_total_price"), vec![7]);
    assert_eq!(lines(&export, "website.buy_cart", "order.place_order"), vec![8]);
    assert_eq!(lines(&export, "cart.get_cart", "cart.load"), vec![2]);

    let route = &export.nodes["order.get_total_price"];
    assert!(route.is_route);
    assert!(!route.external);
    assert_eq!(route.lineno, Some(12));
    assert_eq!(
        route.route.as_ref().unwrap().name,
        "/cart/total_price/<int:user_id>/"
    );
    assert!(!export.nodes["cart.load"].is_route);
    assert_eq!(export.nodes["website.buy_cart"].id, 0);

    assert_eq!(export.dotted_edges.len(), 1);
    assert_eq!(export.dotted_edges[0].start_node, "order.get_total_price");
    assert_eq!(export.dotted_edges[0].end_node, "order.place_order");
}

#[test]
fn recursion_records_a_single_self_edge() {
    let (_temp, entry) = website_project();
    let analysis = analyze(&entry, "buy_cart", &order_catalog(), &AnalysisOptions::default()).unwrap();
    let export = analysis.graph.export();
    let self_edges: Vec<_> = export
        .edges
        .iter()
        .filter(|edge| edge.start_node == edge.end_node)
        .collect();
    assert_eq!(self_edges.len(), 1);
    assert_eq!(self_edges[0].start_node, "cart.load");
    assert_eq!(self_edges[0].call_lines, vec![8]);
}

#[test]
fn repeated_calls_accumulate_lines_on_one_edge() {
    let temp = TempDir::new().unwrap();
    let entry = write(
        temp.path(),
        "app.py",
        r#"def main():
    helper()
    x = 1
    helper()


def helper():
    pass
"#,
    );
    let analysis = analyze(&entry, "main", &RouteCatalog::default(), &AnalysisOptions::default()).unwrap();
    let export = analysis.graph.export();
    assert_eq!(export.edges.len(), 1);
    assert_eq!(lines(&export, "app.main", "app.helper"), vec![2, 4]);
}

#[test]
fn consecutive_routing_calls_form_dotted_chain() {
    let temp = TempDir::new().unwrap();
    let entry = write(
        temp.path(),
        "checkout.py",
        r#"import requests


def checkout(order_id):
    requests.get(f"/orders/{order_id}")
    requests.get(f"/cart/{order_id}/{order_id}")
    requests.post("/orders/place")
"#,
    );
    let routes = catalog(json!([
        {"module": "order", "name": "/orders/<int:order_id>", "methods": ["GET"], "func_name": "get_order"},
        {"module": "order", "name": "/cart/total_price/<int:user_id>", "methods": ["GET"], "func_name": "get_total_price"},
        {"module": "order", "name": "/orders/place", "methods": ["POST"], "func_name": "place_order"}
    ]));
    let analysis = analyze(&entry, "checkout", &routes, &AnalysisOptions::default()).unwrap();
    let export = analysis.graph.export();
    assert_no_dangling(&export);

    // `/cart/{}/{}` is cvv and must not match the ccv total_price route.
    assert!(!export.nodes.contains_key("order.get_total_price"));
    let unmatched = &export.nodes["unknown.requests.get"];
    assert!(unmatched.is_route);
    assert!(unmatched.external);
    assert_eq!(unmatched.file, "unknown");
    assert_eq!(unmatched.route.as_ref().unwrap().pattern, "cvv");

    let dotted: Vec<(&str, &str)> = export
        .dotted_edges
        .iter()
        .map(|edge| (edge.start_node.as_str(), edge.end_node.as_str()))
        .collect();
    assert_eq!(
        dotted,
        vec![
            ("order.get_order", "unknown.requests.get"),
            ("unknown.requests.get", "order.place_order"),
        ]
    );
}

#[test]
fn route_owned_by_traced_function_reuses_its_node() {
    let temp = TempDir::new().unwrap();
    let entry = write(
        temp.path(),
        "app.py",
        r#"import requests


def home():
    return render()


def render():
    pass


def main():
    home()
    requests.get("http://localhost/home")
"#,
    );
    let routes = catalog(json!([
        {"module": "app", "name": "/home", "methods": ["GET"], "func_name": "home", "file": entry.display().to_string()}
    ]));
    let analysis = analyze(&entry, "main", &routes, &AnalysisOptions::default()).unwrap();
    let export = analysis.graph.export();
    assert_no_dangling(&export);
    assert_eq!(export.nodes.len(), 3);
    assert!(export.nodes["app.home"].is_route);
    assert_eq!(lines(&export, "app.main", "app.home"), vec![13, 14]);
    assert_eq!(lines(&export, "app.home", "app.render"), vec![5]);
}

#[test]
fn package_and_relative_imports_resolve() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let entry = write(
        root,
        "main.py",
        r#"from pkg.service import run
from pkg import db


def entry():
    run()
    db.query()
"#,
    );
    write(root, "pkg/__init__.py", "");
    write(
        root,
        "pkg/service.py",
        r#"from .db import query


def run():
    query()
"#,
    );
    write(root, "pkg/db.py", "def query():\n    pass\n");

    let analysis = analyze(&entry, "entry", &RouteCatalog::default(), &AnalysisOptions::default()).unwrap();
    let export = analysis.graph.export();
    assert_no_dangling(&export);
    assert_eq!(lines(&export, "main.entry", "pkg.service.run"), vec![6]);
    assert_eq!(lines(&export, "main.entry", "pkg.db.query"), vec![7]);
    assert_eq!(lines(&export, "pkg.service.run", "pkg.db.query"), vec![5]);
    assert_eq!(export.nodes.len(), 3);
}

#[test]
fn unrecognized_calls_fail_only_under_strict_policy() {
    let temp = TempDir::new().unwrap();
    let entry = write(
        temp.path(),
        "dispatch.py",
        r#"HANDLERS = {}


def dispatch(kind):
    HANDLERS[kind]()
"#,
    );
    let lenient = analyze(&entry, "dispatch", &RouteCatalog::default(), &AnalysisOptions::default()).unwrap();
    assert_eq!(lenient.graph.nodes.len(), 1);
    assert!(lenient.graph.edges.is_empty());

    let options = AnalysisOptions {
        unresolved_calls: UnresolvedCallPolicy::Error,
        ..AnalysisOptions::default()
    };
    let err = analyze(&entry, "dispatch", &RouteCatalog::default(), &options).unwrap_err();
    match err.downcast_ref::<AnalysisError>() {
        Some(AnalysisError::UnrecognizedCall { function, line, .. }) => {
            assert_eq!(function, "dispatch");
            assert_eq!(*line, 5);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn missing_entry_function_is_reported() {
    let (_temp, entry) = website_project();
    let err = analyze(&entry, "checkout", &order_catalog(), &AnalysisOptions::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AnalysisError>(),
        Some(AnalysisError::EntryNotFound { function, .. }) if function == "checkout"
    ));
}

#[test]
fn missing_entry_module_is_reported() {
    let temp = TempDir::new().unwrap();
    let entry = temp.path().join("missing.py");
    let err = analyze(&entry, "main", &RouteCatalog::default(), &AnalysisOptions::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AnalysisError>(),
        Some(AnalysisError::ModuleNotFound { .. })
    ));
}

#[test]
fn third_party_calls_become_terminal_nodes_on_request() {
    let temp = TempDir::new().unwrap();
    let entry = write(
        temp.path(),
        "app.py",
        "import json\n\n\ndef main():\n    return json.dumps({})\n",
    );
    let plain = analyze(&entry, "main", &RouteCatalog::default(), &AnalysisOptions::default()).unwrap();
    assert_eq!(plain.graph.nodes.len(), 1);

    let options = AnalysisOptions {
        include_external: true,
        ..AnalysisOptions::default()
    };
    let analysis = analyze(&entry, "main", &RouteCatalog::default(), &options).unwrap();
    let export = analysis.graph.export();
    assert_no_dangling(&export);
    let node = &export.nodes["json.dumps"];
    assert!(node.external);
    assert!(!node.is_route);
    assert_eq!(lines(&export, "app.main", "json.dumps"), vec![5]);
}

#[test]
fn pruned_bodies_are_emitted_next_to_the_graph() {
    let (_temp, entry) = website_project();
    let options = AnalysisOptions {
        prune: true,
        ..AnalysisOptions::default()
    };
    let analysis = analyze(&entry, "buy_cart", &order_catalog(), &options).unwrap();

    let without = serde_json::to_value(analysis.output(false)).unwrap();
    assert!(without.get("bodies").is_none());
    assert!(without["graph"]["nodes"].get("website.buy_cart").is_some());

    let output = serde_json::to_value(analysis.output(true)).unwrap();
    let bodies = output["bodies"].as_array().unwrap();
    let buy_cart = bodies
        .iter()
        .find(|body| body["func_name"] == "buy_cart")
        .unwrap();
    let statements = buy_cart["body"].as_array().unwrap();
    assert_eq!(statements.len(), 3);
    assert_eq!(statements[0]["_type"], "Assign");
    assert_eq!(statements[2]["_type"], "Expr");

    let load = bodies.iter().find(|body| body["func_name"] == "load").unwrap();
    assert!(load["body"].as_array().unwrap().is_empty());

    // Pruning only affects emitted bodies, never the graph.
    let export = analysis.graph.export();
    assert_eq!(lines(&export, "cart.load", "cart.load"), vec![8]);
}

#[test]
fn literal_value_segments_match_typed_route_placeholders() {
    let temp = TempDir::new().unwrap();
    let entry = write(
        temp.path(),
        "website.py",
        r#"import cart
import requests


def buy_cart(user_id):
    items = cart.get_cart_items(user_id)
    return requests.get("/cart/total_price/42")
"#,
    );
    write(
        temp.path(),
        "cart.py",
        "def get_cart_items(user_id):\n    return []\n",
    );
    let routes = catalog(json!([
        {"module": "order", "name": "/cart/total_price/<int:user_id>/", "methods": ["GET"], "func_name": "get_total_price"}
    ]));
    let analysis = analyze(&entry, "buy_cart", &routes, &AnalysisOptions::default()).unwrap();
    let export = analysis.graph.export();
    assert_no_dangling(&export);
    assert_eq!(lines(&export, "website.buy_cart", "cart.get_cart_items"), vec![6]);
    assert_eq!(lines(&export, "website.buy_cart", "order.get_total_price"), vec![7]);
    assert!(export.nodes["order.get_total_price"].is_route);
    assert!(export.dotted_edges.is_empty());
}

#[test]
fn opaque_url_stays_unresolved_beside_root_route() {
    let temp = TempDir::new().unwrap();
    let entry = write(
        temp.path(),
        "app.py",
        "import requests\n\n\ndef main(url):\n    requests.get(url)\n",
    );
    let routes = catalog(json!([
        {"name": "/", "methods": ["GET"], "module": "home", "func_name": "index"}
    ]));
    let analysis = analyze(&entry, "main", &routes, &AnalysisOptions::default()).unwrap();
    let export = analysis.graph.export();
    assert_no_dangling(&export);
    assert!(!export.nodes.contains_key("home.index"));
    let opaque = &export.nodes["unknown.requests.get"];
    assert!(opaque.is_route);
    assert!(opaque.external);
    assert_eq!(lines(&export, "app.main", "unknown.requests.get"), vec![5]);
}

#[test]
fn function_local_import_is_invisible_to_sibling_functions() {
    let temp = TempDir::new().unwrap();
    let entry = write(
        temp.path(),
        "app.py",
        r#"def with_import():
    import cart
    return cart.get_items()


def without_import():
    return cart.get_items()


def main():
    without_import()
    with_import()
"#,
    );
    write(temp.path(), "cart.py", "def get_items():\n    return []\n");
    let analysis = analyze(&entry, "main", &catalog(json!([])), &AnalysisOptions::default()).unwrap();
    let export = analysis.graph.export();
    assert_no_dangling(&export);
    assert_eq!(lines(&export, "app.with_import", "cart.get_items"), vec![3]);
    assert!(
        !export
            .edges
            .iter()
            .any(|edge| edge.start_node == "app.without_import" && edge.end_node == "cart.get_items")
    );
    assert!(analysis.trace.modules["app"].imports.is_empty());
}
