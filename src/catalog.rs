//! Route catalog: the known service endpoints calls are matched against.

use crate::error::AnalysisError;
use crate::python::PythonSyntax;
use crate::scan::{ScanOptions, scan_python_files};
use crate::syntax::{Expr, FunctionDef, Stmt};
use crate::util;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const FRAMEWORK_VERBS: &[&str] = &["get", "post", "put", "delete", "patch", "head"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    /// URL template, normalized to begin and end with `/`.
    pub name: String,
    #[serde(default)]
    pub methods: Vec<String>,
    /// One `c` (literal) or `v` (variable) per path segment.
    #[serde(default)]
    pub route_pattern: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub func_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<PathBuf>,
}

impl RouteDescriptor {
    fn normalize(mut self) -> Self {
        self.name = normalize_route_name(&self.name);
        self.methods = self
            .methods
            .iter()
            .map(|method| method.trim().to_ascii_uppercase())
            .filter(|method| !method.is_empty())
            .collect();
        if self.methods.is_empty() {
            self.methods.push("GET".to_string());
        }
        if self.route_pattern.trim().is_empty() {
            self.route_pattern = route_pattern_for(&self.name);
        }
        self
    }

    pub fn accepts(&self, method: &str) -> bool {
        self.methods
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(method))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteCatalog {
    routes: Vec<RouteDescriptor>,
}

impl RouteCatalog {
    pub fn new(routes: Vec<RouteDescriptor>) -> Self {
        Self {
            routes: routes.into_iter().map(RouteDescriptor::normalize).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = util::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Parse a JSON array of route records. Records without a `name` are
    /// skipped; unknown fields are ignored.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| AnalysisError::InvalidCatalog(err.to_string()))?;
        let Value::Array(items) = value else {
            return Err(AnalysisError::InvalidCatalog("expected a JSON array".to_string()).into());
        };
        let mut routes = Vec::new();
        for (idx, item) in items.into_iter().enumerate() {
            if item.get("name").is_none() {
                debug!(index = idx, "route record without name, skipping");
                continue;
            }
            let route: RouteDescriptor = serde_json::from_value(item)
                .map_err(|err| AnalysisError::InvalidCatalog(format!("record {idx}: {err}")))?;
            routes.push(route);
        }
        Ok(Self::new(routes))
    }

    pub fn routes(&self) -> &[RouteDescriptor] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Strip surrounding spaces and separators, then wrap in single slashes.
pub fn normalize_route_name(raw: &str) -> String {
    let stripped = raw.trim_matches(|ch: char| ch == ' ' || ch == '/' || ch == '\\');
    if stripped.is_empty() {
        "/".to_string()
    } else {
        format!("/{stripped}/")
    }
}

/// Pattern code of a route template: `<int:id>`, `{id}` and `:id` segments
/// are variables, everything else is literal.
pub fn route_pattern_for(name: &str) -> String {
    name.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if segment.starts_with('<') || segment.starts_with('{') || segment.starts_with(':') {
                'v'
            } else {
                'c'
            }
        })
        .collect()
}

/// Find Flask `@x.route(...)` and FastAPI-style `@x.get(...)` handlers in
/// every Python file under `repo`. The first directory level below `repo`
/// is taken as the owning service.
pub fn discover(repo: &Path, options: ScanOptions) -> Result<Vec<RouteDescriptor>> {
    let repo = util::canonical(repo);
    let mut syntax = PythonSyntax::new()?;
    let mut routes = Vec::new();
    for file in scan_python_files(&repo, options)? {
        let source = match util::read_to_string(&file.abs_path) {
            Ok(source) => source,
            Err(err) => {
                warn!(path = %file.rel_path, error = %err, "skipping unreadable file");
                continue;
            }
        };
        let module = Path::new(&file.rel_path)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        let parsed = match syntax.parse_source(&module, &file.abs_path, &source) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %file.rel_path, error = %err, "skipping unparsable file");
                continue;
            }
        };
        let project_path = match file.rel_path.split_once('/') {
            Some((service, _)) => repo.join(service),
            None => repo.clone(),
        };
        for def in handler_candidates(&parsed.body) {
            for (name, methods, lineno) in route_decorators(def) {
                routes.push(
                    RouteDescriptor {
                        name,
                        methods,
                        route_pattern: String::new(),
                        module: module.clone(),
                        func_name: def.name.clone(),
                        file: Some(file.abs_path.clone()),
                        lineno: Some(lineno),
                        project_path: Some(project_path.clone()),
                    }
                    .normalize(),
                );
            }
        }
    }
    info!(repo = %repo.display(), routes = routes.len(), "discovered routes");
    Ok(routes)
}

fn handler_candidates(body: &[Stmt]) -> Vec<&FunctionDef> {
    let mut out = Vec::new();
    for stmt in body {
        match stmt {
            Stmt::FunctionDef(def) => out.push(def),
            Stmt::ClassDef(class) => out.extend(handler_candidates(&class.body)),
            _ => {}
        }
    }
    out
}

fn route_decorators(def: &FunctionDef) -> Vec<(String, Vec<String>, usize)> {
    let mut out = Vec::new();
    for decorator in &def.decorators {
        let Expr::Call(call) = decorator else {
            continue;
        };
        let Expr::Attribute { attr, .. } = call.func.as_ref() else {
            continue;
        };
        let attr = attr.to_ascii_lowercase();
        let path = call
            .args
            .first()
            .or_else(|| call.keyword("rule"))
            .or_else(|| call.keyword("path"))
            .and_then(string_value);
        let Some(path) = path else {
            continue;
        };
        if attr == "route" || attr == "api_route" {
            let methods = call.keyword("methods").map(string_list).unwrap_or_default();
            out.push((path, methods, call.lineno));
        } else if FRAMEWORK_VERBS.contains(&attr.as_str()) && path.starts_with('/') {
            out.push((path, vec![attr.to_ascii_uppercase()], call.lineno));
        }
    }
    out
}

fn string_value(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Str { value } => Some(value.clone()),
        _ => None,
    }
}

fn string_list(expr: &Expr) -> Vec<String> {
    match expr {
        Expr::Other { children, .. } => children.iter().filter_map(string_value).collect(),
        other => string_value(other).into_iter().collect(),
    }
}
