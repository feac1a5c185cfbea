// Changes the process working directory, so it lives in its own test binary.

use flowtrace::analysis::{AnalysisOptions, analyze};
use flowtrace::catalog::RouteCatalog;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

#[test]
fn bare_entry_file_name_resolves_from_working_directory() {
    let temp = TempDir::new().unwrap();
    fs::write(
        temp.path().join("website.py"),
        "import requests\nfrom cart import get_cart\n\n\ndef buy_cart(user_id):\n    get_cart(user_id)\n    requests.post(\"/orders/place\")\n",
    )
    .unwrap();
    fs::write(temp.path().join("cart.py"), "def get_cart(user_id):\n    return []\n").unwrap();
    let routes = RouteCatalog::from_json_str(
        r#"[{"module": "order", "name": "/orders/place", "methods": ["POST"], "func_name": "place_order"}]"#,
    )
    .unwrap();

    std::env::set_current_dir(temp.path()).unwrap();
    let analysis = analyze(
        Path::new("website.py"),
        "buy_cart",
        &routes,
        &AnalysisOptions::default(),
    )
    .unwrap();

    assert_eq!(analysis.entry_module, "website");
    let export = analysis.graph.export();
    assert!(export.nodes.contains_key("website.buy_cart"));
    assert!(export.nodes.contains_key("cart.get_cart"));
    assert!(export.nodes.contains_key("order.place_order"));
}
