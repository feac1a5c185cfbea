//! Depth-first construction of the call graph from traced bodies.
//!
//! The visited set only gates expansion into a body; edges are recorded for
//! every call that resolves, so recursion and repeated calls still show up.

use crate::config::UnresolvedCallPolicy;
use crate::endpoint::RouteAnnotation;
use crate::error::AnalysisError;
use crate::tracer::{CallTarget, FunctionUnit, TraceResult, classify};
use crate::syntax::collect_calls;
use crate::util;
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    pub name: String,
    pub methods: Vec<String>,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub id: usize,
    pub module: String,
    pub file: String,
    pub func_name: String,
    pub is_route: bool,
    /// Synthesized terminal node with no traceable body.
    pub external: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEdge {
    pub start: usize,
    pub end: usize,
    pub call_lines: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    pub nodes: BTreeMap<usize, GraphNode>,
    pub edges: Vec<CallEdge>,
    pub dotted_edges: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeExport {
    pub start_node: String,
    pub end_node: String,
    pub call_lines: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DottedEdgeExport {
    pub start_node: String,
    pub end_node: String,
}

/// Serialized graph: nodes keyed by qualified name, edges referencing those
/// keys.
#[derive(Debug, Clone, Serialize)]
pub struct GraphExport {
    pub nodes: BTreeMap<String, GraphNode>,
    pub edges: Vec<EdgeExport>,
    pub dotted_edges: Vec<DottedEdgeExport>,
}

impl CallGraph {
    pub fn edge(&self, start: usize, end: usize) -> Option<&CallEdge> {
        self.edges
            .iter()
            .find(|edge| edge.start == start && edge.end == end)
    }

    pub fn node_by_name(&self, module: &str, func_name: &str) -> Option<&GraphNode> {
        self.nodes
            .values()
            .find(|node| node.module == module && node.func_name == func_name)
    }

    /// Qualified `module.function` keys; a clash gets the node id appended.
    pub fn node_keys(&self) -> BTreeMap<usize, String> {
        let mut keys = BTreeMap::new();
        let mut taken = HashSet::new();
        for (id, node) in &self.nodes {
            let mut key = format!("{}.{}", node.module, node.func_name);
            if !taken.insert(key.clone()) {
                key = format!("{key}#{id}");
                taken.insert(key.clone());
            }
            keys.insert(*id, key);
        }
        keys
    }

    pub fn export(&self) -> GraphExport {
        let keys = self.node_keys();
        let key = |id: &usize| keys.get(id).cloned().unwrap_or_else(|| id.to_string());
        GraphExport {
            nodes: self
                .nodes
                .iter()
                .map(|(id, node)| (key(id), node.clone()))
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|edge| EdgeExport {
                    start_node: key(&edge.start),
                    end_node: key(&edge.end),
                    call_lines: edge.call_lines.clone(),
                })
                .collect(),
            dotted_edges: self
                .dotted_edges
                .iter()
                .map(|(start, end)| DottedEdgeExport {
                    start_node: key(start),
                    end_node: key(end),
                })
                .collect(),
        }
    }
}

pub struct GraphBuilder<'t> {
    trace: &'t TraceResult,
    policy: UnresolvedCallPolicy,
    include_external: bool,
    visited: HashSet<usize>,
    last_route: Option<usize>,
    next_id: usize,
    nodes: BTreeMap<usize, GraphNode>,
    edges: Vec<CallEdge>,
    edge_index: HashMap<(usize, usize), usize>,
    dotted_edges: Vec<(usize, usize)>,
    route_nodes: HashMap<(String, String, String), usize>,
    external_nodes: HashMap<(String, String), usize>,
}

impl<'t> GraphBuilder<'t> {
    pub fn new(trace: &'t TraceResult) -> Self {
        Self {
            trace,
            policy: UnresolvedCallPolicy::Ignore,
            include_external: false,
            visited: HashSet::new(),
            last_route: None,
            next_id: trace.units.len(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            edge_index: HashMap::new(),
            dotted_edges: Vec::new(),
            route_nodes: HashMap::new(),
            external_nodes: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: UnresolvedCallPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Also emit terminal nodes for calls into modules outside the project.
    pub fn with_external_calls(mut self, include: bool) -> Self {
        self.include_external = include;
        self
    }

    pub fn build(mut self) -> Result<CallGraph> {
        let entry = self.trace.entry;
        self.add_unit_node(entry);
        self.visited.insert(entry);
        self.walk(entry)?;
        info!(
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            dotted_edges = self.dotted_edges.len(),
            "graph built"
        );
        Ok(CallGraph {
            nodes: self.nodes,
            edges: self.edges,
            dotted_edges: self.dotted_edges,
        })
    }

    fn walk(&mut self, current: usize) -> Result<()> {
        let trace = self.trace;
        let Some(unit) = trace.unit(current) else {
            return Ok(());
        };
        let (Some(body), Some(info)) = (unit.body.as_ref(), trace.modules.get(&unit.module)) else {
            return Ok(());
        };
        let scope = info.scoped(&unit.local_imports);
        for call in collect_calls(body) {
            match classify(call, &scope) {
                CallTarget::Route => {
                    if let Some(route) = &call.route {
                        let target = self.route_target(route);
                        self.add_edge(current, target, call.lineno);
                        if let Some(previous) = self.last_route {
                            self.dotted_edges.push((previous, target));
                        }
                        self.last_route = Some(target);
                    }
                }
                CallTarget::Local(name) => {
                    if let Some(callee) = trace.unit_id(&unit.module, &name) {
                        self.follow(current, callee, call.lineno)?;
                    }
                }
                CallTarget::Imported(hit) => match trace.unit_id(&hit.module, &hit.name) {
                    Some(callee) => self.follow(current, callee, call.lineno)?,
                    None if self.include_external && !trace.modules.contains_key(&hit.module) => {
                        let target = self.external_target(&hit.module, &hit.name);
                        self.add_edge(current, target, call.lineno);
                    }
                    None => {}
                },
                CallTarget::Unknown => {}
                CallTarget::Unrecognized => match self.policy {
                    UnresolvedCallPolicy::Error => {
                        return Err(AnalysisError::UnrecognizedCall {
                            module: unit.module.clone(),
                            function: unit.name.clone(),
                            line: call.lineno,
                        }
                        .into());
                    }
                    UnresolvedCallPolicy::Ignore => {
                        debug!(
                            module = %unit.module,
                            function = %unit.name,
                            line = call.lineno,
                            callee = %call.func.render(),
                            "unrecognized call shape ignored"
                        );
                    }
                },
            }
        }
        Ok(())
    }

    fn follow(&mut self, current: usize, callee: usize, line: usize) -> Result<()> {
        self.add_unit_node(callee);
        self.add_edge(current, callee, line);
        if self.visited.insert(callee) {
            self.walk(callee)?;
        }
        Ok(())
    }

    fn add_unit_node(&mut self, id: usize) {
        if self.nodes.contains_key(&id) {
            return;
        }
        let Some(unit) = self.trace.unit(id) else {
            return;
        };
        self.nodes.insert(id, unit_node(unit));
    }

    fn add_edge(&mut self, start: usize, end: usize, line: usize) {
        match self.edge_index.get(&(start, end)) {
            Some(idx) => self.edges[*idx].call_lines.push(line),
            None => {
                self.edge_index.insert((start, end), self.edges.len());
                self.edges.push(CallEdge {
                    start,
                    end,
                    call_lines: vec![line],
                });
            }
        }
    }

    fn allocate(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn route_target(&mut self, route: &RouteAnnotation) -> usize {
        let Some(descriptor) = &route.matched else {
            let id = self.allocate();
            self.nodes.insert(
                id,
                GraphNode {
                    id,
                    module: UNKNOWN.to_string(),
                    file: UNKNOWN.to_string(),
                    func_name: route.chain.clone(),
                    is_route: true,
                    external: true,
                    route: Some(RouteInfo {
                        name: route.endpoint.clone(),
                        methods: vec![route.method.clone()],
                        pattern: route.pattern.clone(),
                    }),
                    lineno: None,
                    project_path: None,
                },
            );
            return id;
        };
        let info = RouteInfo {
            name: descriptor.name.clone(),
            methods: descriptor.methods.clone(),
            pattern: descriptor.route_pattern.clone(),
        };

        let owner = self.trace.units.iter().find(|unit| {
            unit.name == descriptor.func_name
                && match &descriptor.file {
                    Some(file) => util::paths_equal(file, &unit.file),
                    None => unit.module == descriptor.module,
                }
        });
        if let Some(unit) = owner {
            if let Some(node) = self.nodes.get_mut(&unit.id) {
                node.is_route = true;
                node.route = Some(info);
                return unit.id;
            }
        }

        let file = descriptor
            .file
            .as_ref()
            .map(|file| file.display().to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let key = (
            descriptor.module.clone(),
            descriptor.func_name.clone(),
            file.clone(),
        );
        if let Some(id) = self.route_nodes.get(&key) {
            return *id;
        }
        let id = self.allocate();
        self.route_nodes.insert(key, id);
        self.nodes.insert(
            id,
            GraphNode {
                id,
                module: descriptor.module.clone(),
                file,
                func_name: descriptor.func_name.clone(),
                is_route: true,
                external: false,
                route: Some(info),
                lineno: descriptor.lineno,
                project_path: descriptor
                    .project_path
                    .as_ref()
                    .map(|path| path.display().to_string()),
            },
        );
        id
    }

    fn external_target(&mut self, module: &str, name: &str) -> usize {
        let key = (module.to_string(), name.to_string());
        if let Some(id) = self.external_nodes.get(&key) {
            return *id;
        }
        let id = self.allocate();
        self.external_nodes.insert(key, id);
        self.nodes.insert(
            id,
            GraphNode {
                id,
                module: module.to_string(),
                file: UNKNOWN.to_string(),
                func_name: name.to_string(),
                is_route: false,
                external: true,
                route: None,
                lineno: None,
                project_path: None,
            },
        );
        id
    }
}

fn unit_node(unit: &FunctionUnit) -> GraphNode {
    GraphNode {
        id: unit.id,
        module: unit.module.clone(),
        file: unit.file.display().to_string(),
        func_name: unit.name.clone(),
        is_route: false,
        external: false,
        route: None,
        lineno: Some(unit.lineno),
        project_path: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: usize, module: &str, func_name: &str) -> GraphNode {
        GraphNode {
            id,
            module: module.to_string(),
            file: format!("{module}.py"),
            func_name: func_name.to_string(),
            is_route: false,
            external: false,
            route: None,
            lineno: None,
            project_path: None,
        }
    }

    #[test]
    fn export_uses_qualified_names_and_disambiguates_clashes() {
        let mut graph = CallGraph::default();
        graph.nodes.insert(0, node(0, "website", "buy_cart"));
        graph.nodes.insert(1, node(1, "cart", "total"));
        graph.nodes.insert(2, node(2, "cart", "total"));
        graph.edges.push(CallEdge {
            start: 0,
            end: 1,
            call_lines: vec![10, 14],
        });
        graph.edges.push(CallEdge {
            start: 0,
            end: 2,
            call_lines: vec![12],
        });
        graph.dotted_edges.push((1, 2));

        let export = graph.export();
        assert!(export.nodes.contains_key("website.buy_cart"));
        assert!(export.nodes.contains_key("cart.total"));
        assert!(export.nodes.contains_key("cart.total#2"));
        assert_eq!(export.edges[0].start_node, "website.buy_cart");
        assert_eq!(export.edges[0].call_lines, vec![10, 14]);
        assert_eq!(export.edges[1].end_node, "cart.total#2");
        assert_eq!(export.dotted_edges[0].start_node, "cart.total");

        let json = serde_json::to_value(&export).unwrap();
        assert!(json["edges"][0].get("start_node").is_some());
        assert!(json["dotted_edges"][0].get("call_lines").is_none());
    }
}
