//! One analysis run: resolve the entry module, trace, optionally prune, and
//! build the call graph.

use crate::catalog::RouteCatalog;
use crate::config::{Config, UnresolvedCallPolicy};
use crate::endpoint::EndpointMatcher;
use crate::graph::{CallGraph, GraphBuilder, GraphExport};
use crate::prune::Pruner;
use crate::python::PythonSyntax;
use crate::resolver::{FsModuleResolver, module_name_from_rel_path};
use crate::syntax::Stmt;
use crate::tracer::{TraceResult, Tracer};
use crate::util;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Directory module names are relative to. Defaults to the entry file's
    /// parent directory.
    pub root: Option<PathBuf>,
    pub search_paths: Vec<PathBuf>,
    pub prune: bool,
    pub unresolved_calls: UnresolvedCallPolicy,
    pub include_external: bool,
    pub http_clients: Vec<String>,
    pub external_dirs: Vec<String>,
    pub max_file_size: u64,
}

impl AnalysisOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root: None,
            search_paths: Vec::new(),
            prune: false,
            unresolved_calls: config.unresolved_calls,
            include_external: false,
            http_clients: config.http_clients.clone(),
            external_dirs: config.external_dirs.clone(),
            max_file_size: config.max_file_size,
        }
    }
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Statement body of a retained unit, as emitted next to the graph.
#[derive(Debug, Clone, Serialize)]
pub struct UnitBody {
    pub id: usize,
    pub module: String,
    pub file: String,
    pub func_name: String,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutput {
    pub graph: GraphExport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bodies: Option<Vec<UnitBody>>,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub entry_module: String,
    pub trace: TraceResult,
    pub graph: CallGraph,
    /// Pruned bodies by unit id; empty unless pruning was requested.
    pub pruned: BTreeMap<usize, Vec<Stmt>>,
}

impl Analysis {
    /// Bodies of the units in the graph, pruned when available.
    pub fn bodies(&self) -> Vec<UnitBody> {
        self.graph
            .nodes
            .keys()
            .filter_map(|id| self.trace.unit(*id))
            .filter_map(|unit| {
                let body = match self.pruned.get(&unit.id) {
                    Some(pruned) => pruned.clone(),
                    None => unit.body.clone()?,
                };
                Some(UnitBody {
                    id: unit.id,
                    module: unit.module.clone(),
                    file: unit.file.display().to_string(),
                    func_name: unit.name.clone(),
                    body,
                })
            })
            .collect()
    }

    pub fn output(&self, emit_bodies: bool) -> AnalysisOutput {
        AnalysisOutput {
            graph: self.graph.export(),
            bodies: emit_bodies.then(|| self.bodies()),
        }
    }
}

/// Dotted module name of `file` relative to `root`.
pub fn entry_module_name(root: &Path, file: &Path) -> Result<String> {
    let root = util::canonical(root);
    let file = util::canonical(file);
    let rel = util::normalize_rel_path(&root, &file)
        .with_context(|| format!("entry file {} is outside {}", file.display(), root.display()))?;
    Ok(module_name_from_rel_path(&rel))
}

/// Directory containing `entry_file`. A bare file name resolves against the
/// working directory.
pub fn default_root(entry_file: &Path) -> PathBuf {
    let entry = util::canonical(entry_file);
    match entry.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub fn analyze(
    entry_file: &Path,
    function: &str,
    catalog: &RouteCatalog,
    options: &AnalysisOptions,
) -> Result<Analysis> {
    let root = match &options.root {
        Some(root) => root.clone(),
        None => default_root(entry_file),
    };
    let entry_module = entry_module_name(&root, entry_file)?;
    info!(
        root = %root.display(),
        module = %entry_module,
        function,
        routes = catalog.len(),
        "analysis started"
    );

    let resolver = FsModuleResolver::new(&root)
        .with_search_paths(&options.search_paths)
        .with_external_dirs(&options.external_dirs);
    let mut syntax = PythonSyntax::new()?.with_max_file_size(options.max_file_size);
    let matcher = EndpointMatcher::new(catalog, &options.http_clients);
    let trace = Tracer::new(&resolver, &mut syntax, &matcher).trace(&entry_module, function)?;

    let graph = GraphBuilder::new(&trace)
        .with_policy(options.unresolved_calls)
        .with_external_calls(options.include_external)
        .build()?;

    let mut pruned = BTreeMap::new();
    if options.prune {
        for unit in &trace.units {
            let Some(body) = &unit.body else {
                continue;
            };
            let tracked = trace.tracked_for(&unit.module);
            pruned.insert(unit.id, Pruner::new(&tracked).prune(body));
        }
    }

    Ok(Analysis {
        entry_module,
        trace,
        graph,
        pruned,
    })
}
