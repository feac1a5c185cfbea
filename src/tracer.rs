//! Discovery of every project function reachable from an entry function.

use crate::endpoint::EndpointMatcher;
use crate::error::AnalysisError;
use crate::imports::{ImportTable, ImportedName};
use crate::resolver::{ModuleRef, ModuleResolver};
use crate::syntax::{
    Call, Expr, ModuleSyntax, Stmt, SyntaxProvider, collect_calls, nested_imports, visit_calls_mut,
};
use anyhow::Result;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// One function known to the analysis. Synthesized route targets are not
/// units; they only exist as graph nodes.
#[derive(Debug, Clone)]
pub struct FunctionUnit {
    pub id: usize,
    pub module: String,
    pub name: String,
    pub file: PathBuf,
    pub lineno: usize,
    /// Traced body with routing calls annotated.
    pub body: Option<Vec<Stmt>>,
    /// Imports written inside the function body. Visible to this unit only.
    pub local_imports: ImportTable,
}

/// Resolution context of a traced module.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub module: ModuleRef,
    pub declared: BTreeSet<String>,
    pub imports: ImportTable,
}

impl ModuleInfo {
    /// Resolution context inside a function that has its own imports.
    pub fn scoped(&self, local_imports: &ImportTable) -> Cow<'_, ModuleInfo> {
        if local_imports.is_empty() {
            return Cow::Borrowed(self);
        }
        Cow::Owned(ModuleInfo {
            module: self.module.clone(),
            declared: self.declared.clone(),
            imports: local_imports.layered_over(&self.imports),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TraceResult {
    pub entry: usize,
    pub units: Vec<FunctionUnit>,
    pub modules: BTreeMap<String, ModuleInfo>,
    /// Per module: declared function names plus names called into it.
    pub references: BTreeMap<String, BTreeSet<String>>,
    /// Per module: names of calls in its kept bodies that lead to a traced
    /// unit or a route.
    pub tracked: BTreeMap<String, BTreeSet<String>>,
    index: HashMap<(String, String), usize>,
}

impl TraceResult {
    pub fn unit_id(&self, module: &str, name: &str) -> Option<usize> {
        self.index
            .get(&(module.to_string(), name.to_string()))
            .copied()
    }

    pub fn unit(&self, id: usize) -> Option<&FunctionUnit> {
        self.units.get(id)
    }

    pub fn tracked_for(&self, module: &str) -> BTreeSet<String> {
        self.tracked.get(module).cloned().unwrap_or_default()
    }
}

/// How a call site is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Route,
    /// Function declared in the calling module.
    Local(String),
    /// Qualified through the calling module's import table.
    Imported(ImportedName),
    /// Name or attribute chain with no known binding.
    Unknown,
    /// Callee is neither a name nor an attribute access.
    Unrecognized,
}

pub fn classify(call: &Call, info: &ModuleInfo) -> CallTarget {
    if call.route.is_some() {
        return CallTarget::Route;
    }
    match call.func.as_ref() {
        Expr::Name { id } => {
            if info.declared.contains(id) {
                return CallTarget::Local(id.clone());
            }
            match info.imports.resolve_name(id) {
                Some(hit) => CallTarget::Imported(hit),
                None => CallTarget::Unknown,
            }
        }
        Expr::Attribute { .. } => {
            let Some(chain) = call.func.dotted_name() else {
                return CallTarget::Unknown;
            };
            let own = chain
                .strip_prefix("self.")
                .or_else(|| chain.strip_prefix("cls."));
            if let Some(method) = own {
                if info.declared.contains(method) {
                    return CallTarget::Local(method.to_string());
                }
            }
            match info.imports.resolve_attribute(&chain) {
                Some(hit) => CallTarget::Imported(hit),
                None => CallTarget::Unknown,
            }
        }
        _ => CallTarget::Unrecognized,
    }
}

pub struct Tracer<'r> {
    resolver: &'r dyn ModuleResolver,
    syntax: &'r mut dyn SyntaxProvider,
    matcher: &'r EndpointMatcher<'r>,
    modules: BTreeMap<String, ModuleInfo>,
    parsed: HashMap<String, ModuleSyntax>,
    unavailable: BTreeSet<String>,
    units: Vec<FunctionUnit>,
    index: HashMap<(String, String), usize>,
    queue: VecDeque<usize>,
    references: BTreeMap<String, BTreeSet<String>>,
    tracked: BTreeMap<String, BTreeSet<String>>,
}

impl<'r> Tracer<'r> {
    pub fn new(
        resolver: &'r dyn ModuleResolver,
        syntax: &'r mut dyn SyntaxProvider,
        matcher: &'r EndpointMatcher<'r>,
    ) -> Self {
        Self {
            resolver,
            syntax,
            matcher,
            modules: BTreeMap::new(),
            parsed: HashMap::new(),
            unavailable: BTreeSet::new(),
            units: Vec::new(),
            index: HashMap::new(),
            queue: VecDeque::new(),
            references: BTreeMap::new(),
            tracked: BTreeMap::new(),
        }
    }

    /// Trace everything reachable from `entry_function` in `entry_module`.
    pub fn trace(mut self, entry_module: &str, entry_function: &str) -> Result<TraceResult> {
        let module = self
            .resolver
            .resolve(entry_module)
            .ok_or_else(|| AnalysisError::ModuleNotFound {
                module: entry_module.to_string(),
            })?;
        let parsed = self.syntax.parse_module(entry_module, &module.path)?;
        self.register_module(module, parsed);
        let entry = self
            .unit_for(entry_module, entry_function)
            .ok_or_else(|| AnalysisError::EntryNotFound {
                module: entry_module.to_string(),
                function: entry_function.to_string(),
            })?;
        info!(module = %entry_module, function = %entry_function, "tracing");

        while let Some(id) = self.queue.pop_front() {
            self.trace_unit(id)?;
        }

        info!(
            units = self.units.len(),
            modules = self.modules.len(),
            "trace complete"
        );
        Ok(TraceResult {
            entry,
            units: self.units,
            modules: self.modules,
            references: self.references,
            tracked: self.tracked,
            index: self.index,
        })
    }

    fn register_module(&mut self, module: ModuleRef, parsed: ModuleSyntax) {
        let declared: BTreeSet<String> = parsed
            .functions()
            .into_iter()
            .map(|def| def.name.clone())
            .collect();
        let package = module.package_parts();
        let mut imports = ImportTable::new();
        for stmt in parsed.imports() {
            imports.register(stmt, &package, self.resolver);
        }
        self.references
            .entry(parsed.name.clone())
            .or_default()
            .extend(declared.iter().cloned());
        self.modules.insert(
            parsed.name.clone(),
            ModuleInfo {
                module,
                declared,
                imports,
            },
        );
        self.parsed.insert(parsed.name.clone(), parsed);
    }

    /// Parse and register a project-owned module on first touch. Returns
    /// whether a body is available for it.
    fn load_module(&mut self, name: &str) -> bool {
        if self.parsed.contains_key(name) {
            return true;
        }
        if self.unavailable.contains(name) {
            return false;
        }
        let Some(module) = self.resolver.resolve(name) else {
            debug!(module = %name, "unresolved module, not expanding");
            self.unavailable.insert(name.to_string());
            return false;
        };
        if !module.project_owned {
            debug!(module = %name, path = %module.path.display(), "external module, not expanding");
            self.unavailable.insert(name.to_string());
            return false;
        }
        match self.syntax.parse_module(name, &module.path) {
            Ok(parsed) => {
                self.register_module(module, parsed);
                true
            }
            Err(err) => {
                warn!(module = %name, error = %err, "module skipped");
                self.unavailable.insert(name.to_string());
                false
            }
        }
    }

    /// Unit for `module.name`, created and queued for tracing on first
    /// request. `None` when the module has no such function.
    fn unit_for(&mut self, module: &str, name: &str) -> Option<usize> {
        let key = (module.to_string(), name.to_string());
        if let Some(id) = self.index.get(&key) {
            return Some(*id);
        }
        if !self.load_module(module) {
            return None;
        }
        let parsed = self.parsed.get(module)?;
        let def = parsed.function(name)?;
        let id = self.units.len();
        let unit = FunctionUnit {
            id,
            module: module.to_string(),
            name: name.to_string(),
            file: parsed.path.clone(),
            lineno: def.lineno,
            body: Some(def.body.clone()),
            local_imports: ImportTable::new(),
        };
        self.units.push(unit);
        self.index.insert(key, id);
        self.queue.push_back(id);
        debug!(module = %module, function = %name, id, "kept");
        Some(id)
    }

    fn trace_unit(&mut self, id: usize) -> Result<()> {
        let module = self.units[id].module.clone();
        let Some(mut body) = self.units[id].body.take() else {
            return Ok(());
        };
        let Some(package) = self.modules.get(&module).map(|info| info.module.package_parts()) else {
            return Ok(());
        };

        let mut local_imports = ImportTable::new();
        for stmt in nested_imports(&body) {
            local_imports.register(stmt, &package, self.resolver);
        }

        let matcher = self.matcher;
        visit_calls_mut(&mut body, &mut |call| {
            matcher.annotate(call);
        });

        let targets: Vec<(Option<String>, CallTarget)> = match self.modules.get(&module) {
            Some(info) => {
                let scope = info.scoped(&local_imports);
                collect_calls(&body)
                    .into_iter()
                    .map(|call| {
                        (
                            call.func.target_name().map(|name| name.to_string()),
                            classify(call, &scope),
                        )
                    })
                    .collect()
            }
            None => Vec::new(),
        };
        self.units[id].body = Some(body);
        self.units[id].local_imports = local_imports;

        for (called, target) in targets {
            let relevant = match target {
                CallTarget::Route => true,
                CallTarget::Local(name) => {
                    self.references
                        .entry(module.clone())
                        .or_default()
                        .insert(name.clone());
                    self.unit_for(&module, &name).is_some()
                }
                CallTarget::Imported(hit) => {
                    if let Some(info) = self.modules.get_mut(&module) {
                        info.imports.mark_referenced(&hit.alias, &hit.name);
                    }
                    let found = self.unit_for(&hit.module, &hit.name).is_some();
                    if found {
                        self.references
                            .entry(hit.module.clone())
                            .or_default()
                            .insert(hit.name.clone());
                    }
                    found
                }
                CallTarget::Unknown | CallTarget::Unrecognized => false,
            };
            if relevant {
                if let Some(called) = called {
                    self.tracked.entry(module.clone()).or_default().insert(called);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::ImportTarget;
    use std::path::PathBuf;

    fn info(declared: &[&str]) -> ModuleInfo {
        let mut imports = ImportTable::new();
        imports.add(
            "cart",
            ImportTarget::Module {
                module: "cart".to_string(),
            },
        );
        imports.add(
            "total",
            ImportTarget::Symbol {
                module: "order".to_string(),
                name: "get_total".to_string(),
            },
        );
        ModuleInfo {
            module: ModuleRef {
                name: "website".to_string(),
                path: PathBuf::from("website.py"),
                project_owned: true,
            },
            declared: declared.iter().map(|name| name.to_string()).collect(),
            imports,
        }
    }

    fn call(func: Expr) -> Call {
        Call {
            func: Box::new(func),
            args: Vec::new(),
            keywords: Vec::new(),
            lineno: 1,
            route: None,
        }
    }

    fn name(id: &str) -> Expr {
        Expr::Name { id: id.to_string() }
    }

    fn attr(value: Expr, attr: &str) -> Expr {
        Expr::Attribute {
            value: Box::new(value),
            attr: attr.to_string(),
        }
    }

    #[test]
    fn classifies_call_shapes() {
        let info = info(&["helper", "render"]);
        assert_eq!(
            classify(&call(name("helper")), &info),
            CallTarget::Local("helper".to_string())
        );
        assert_eq!(
            classify(&call(attr(name("self"), "render")), &info),
            CallTarget::Local("render".to_string())
        );
        match classify(&call(attr(name("cart"), "get_items")), &info) {
            CallTarget::Imported(hit) => {
                assert_eq!((hit.module.as_str(), hit.name.as_str()), ("cart", "get_items"))
            }
            other => panic!("unexpected {other:?}"),
        }
        match classify(&call(name("total")), &info) {
            CallTarget::Imported(hit) => assert_eq!(hit.name, "get_total"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(classify(&call(name("print")), &info), CallTarget::Unknown);
        let subscript = Expr::Other {
            kind: "subscript".to_string(),
            children: vec![name("handlers"), name("kind")],
        };
        assert_eq!(classify(&call(subscript), &info), CallTarget::Unrecognized);
    }
}
