//! Per-module alias tables used to qualify calls into `(module, function)`.

use crate::resolver::{ModuleResolver, absolutize_module, join_module};
use crate::syntax::Stmt;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportTarget {
    /// `import a.b`, `import a.b as c`, `from a import b` when `a.b` is a module.
    Module { module: String },
    /// `from a import f [as g]`.
    Symbol { module: String, name: String },
    /// `from a import *`.
    Wildcard { module: String },
}

impl ImportTarget {
    pub fn module(&self) -> &str {
        match self {
            ImportTarget::Module { module }
            | ImportTarget::Symbol { module, .. }
            | ImportTarget::Wildcard { module } => module,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub alias: String,
    pub target: ImportTarget,
    /// Function names called through this alias so far.
    pub referenced: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedName {
    pub alias: String,
    pub module: String,
    pub name: String,
}

/// Ordered association list from locally bound names to what they denote.
/// Registration order is the tie-break for equally long matches.
#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    entries: Vec<ImportEntry>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ImportEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, alias: &str, target: ImportTarget) {
        if self
            .entries
            .iter()
            .any(|entry| entry.alias == alias && entry.target == target)
        {
            return;
        }
        self.entries.push(ImportEntry {
            alias: alias.to_string(),
            target,
            referenced: BTreeSet::new(),
        });
    }

    /// Register the bindings introduced by an import statement. `package` is
    /// the importing module's package, used for relative imports; `resolver`
    /// tells `from pkg import mod` (a module) apart from `from mod import f`.
    pub fn register(&mut self, stmt: &Stmt, package: &[String], resolver: &dyn ModuleResolver) {
        match stmt {
            Stmt::Import { names, .. } => {
                for name in names {
                    self.add(
                        name.bound_name(),
                        ImportTarget::Module {
                            module: name.name.clone(),
                        },
                    );
                }
            }
            Stmt::ImportFrom {
                module,
                names,
                wildcard,
                ..
            } => {
                let Some(base) = absolutize_module(module, package) else {
                    debug!(module = %module, "relative import escapes the analysis root");
                    return;
                };
                if *wildcard {
                    self.add("*", ImportTarget::Wildcard { module: base });
                    return;
                }
                for name in names {
                    let full = join_module(&base, &name.name);
                    let target = if resolver.resolve(&full).is_some() {
                        ImportTarget::Module { module: full }
                    } else {
                        ImportTarget::Symbol {
                            module: base.clone(),
                            name: name.name.clone(),
                        }
                    };
                    self.add(name.bound_name(), target);
                }
            }
            _ => {}
        }
    }

    /// Qualify an attribute chain such as `cart.api.get_items` by the longest
    /// registered alias that is a prefix of it on a `.` boundary.
    pub fn resolve_attribute(&self, chain: &str) -> Option<ImportedName> {
        let mut best: Option<(&ImportEntry, &str)> = None;
        for entry in &self.entries {
            if matches!(entry.target, ImportTarget::Wildcard { .. }) {
                continue;
            }
            let Some(rest) = chain
                .strip_prefix(entry.alias.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
            else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let longer = best.is_none_or(|(current, _)| entry.alias.len() > current.alias.len());
            if longer {
                best = Some((entry, rest));
            }
        }
        let (entry, rest) = best?;
        let (middle, name) = match rest.rsplit_once('.') {
            Some((middle, name)) => (Some(middle), name),
            None => (None, rest),
        };
        let module = match (&entry.target, middle) {
            (ImportTarget::Module { module }, None) => module.clone(),
            (ImportTarget::Module { module }, Some(middle)) => format!("{module}.{middle}"),
            (ImportTarget::Symbol { module, .. }, None) => module.clone(),
            _ => return None,
        };
        Some(ImportedName {
            alias: entry.alias.clone(),
            module,
            name: name.to_string(),
        })
    }

    /// Qualify a plain-name call through `from` imports: explicit symbols
    /// first, then the first wildcard import.
    pub fn resolve_name(&self, name: &str) -> Option<ImportedName> {
        let symbol = self.entries.iter().find_map(|entry| match &entry.target {
            ImportTarget::Symbol {
                module,
                name: imported,
            } if entry.alias == name => Some(ImportedName {
                alias: entry.alias.clone(),
                module: module.clone(),
                name: imported.clone(),
            }),
            _ => None,
        });
        symbol.or_else(|| {
            self.entries.iter().find_map(|entry| match &entry.target {
                ImportTarget::Wildcard { module } => Some(ImportedName {
                    alias: entry.alias.clone(),
                    module: module.clone(),
                    name: name.to_string(),
                }),
                _ => None,
            })
        })
    }

    /// Table seen from an inner scope: these bindings first, then `outer`'s.
    /// An inner alias wins ties against an outer one of the same length.
    pub fn layered_over(&self, outer: &ImportTable) -> ImportTable {
        let mut scoped = self.clone();
        for entry in &outer.entries {
            scoped.add(&entry.alias, entry.target.clone());
        }
        scoped
    }

    /// Record that `name` was called through `alias`.
    pub fn mark_referenced(&mut self, alias: &str, name: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.alias == alias) {
            entry.referenced.insert(name.to_string());
        }
    }
}
