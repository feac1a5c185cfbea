//! Module name to source file resolution.

use crate::util;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub name: String,
    pub path: PathBuf,
    /// Lives under the analysis root and outside any third-party directory.
    pub project_owned: bool,
}

impl ModuleRef {
    pub fn is_package(&self) -> bool {
        self.path.file_name().and_then(|name| name.to_str()) == Some("__init__.py")
    }

    /// Package relative imports inside this module are anchored at.
    pub fn package_parts(&self) -> Vec<String> {
        let parts: Vec<&str> = self
            .name
            .split('.')
            .filter(|part| !part.is_empty())
            .collect();
        let keep = if self.is_package() {
            parts.len()
        } else {
            parts.len().saturating_sub(1)
        };
        parts[..keep].iter().map(|part| part.to_string()).collect()
    }
}

pub trait ModuleResolver {
    /// Resolve a dotted module name; `None` for builtins and missing modules.
    fn resolve(&self, module: &str) -> Option<ModuleRef>;
}

/// Resolves modules against the analysis root, then extra search paths.
/// Lookups are memoized for the lifetime of the resolver.
pub struct FsModuleResolver {
    root: PathBuf,
    search_paths: Vec<PathBuf>,
    external_dirs: Vec<String>,
    cache: RefCell<HashMap<String, Option<ModuleRef>>>,
}

impl FsModuleResolver {
    pub fn new(root: &Path) -> Self {
        Self {
            root: util::canonical(root),
            search_paths: Vec::new(),
            external_dirs: Vec::new(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn with_search_paths(mut self, paths: &[PathBuf]) -> Self {
        self.search_paths = paths.iter().map(|path| util::canonical(path)).collect();
        self
    }

    pub fn with_external_dirs(mut self, dirs: &[String]) -> Self {
        self.external_dirs = dirs.to_vec();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lookup(&self, module: &str) -> Option<ModuleRef> {
        let bases = std::iter::once(&self.root).chain(self.search_paths.iter());
        for base in bases {
            if let Some(path) = resolve_module_to_file(base, module) {
                let path = util::canonical(&path);
                let project_owned = self.is_project_path(&path);
                return Some(ModuleRef {
                    name: module.to_string(),
                    path,
                    project_owned,
                });
            }
        }
        None
    }

    fn is_project_path(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        !rel.components().any(|comp| match comp {
            Component::Normal(os) => self
                .external_dirs
                .iter()
                .any(|dir| os.to_str() == Some(dir.as_str())),
            _ => false,
        })
    }
}

impl ModuleResolver for FsModuleResolver {
    fn resolve(&self, module: &str) -> Option<ModuleRef> {
        if let Some(hit) = self.cache.borrow().get(module) {
            return hit.clone();
        }
        let resolved = self.lookup(module);
        debug!(
            module,
            path = ?resolved.as_ref().map(|found| found.path.display().to_string()),
            project_owned = resolved.as_ref().map(|found| found.project_owned),
            "resolved module"
        );
        self.cache
            .borrow_mut()
            .insert(module.to_string(), resolved.clone());
        resolved
    }
}

/// Dotted module name for a path relative to the analysis root.
pub fn module_name_from_rel_path(rel_path: &str) -> String {
    let path = Path::new(rel_path);
    let mut parts: Vec<String> = path
        .components()
        .filter_map(|comp| comp.as_os_str().to_str().map(|s| s.to_string()))
        .collect();
    if parts.is_empty() {
        return "__init__".to_string();
    }
    let file = parts.pop().unwrap_or_default();
    let stem = Path::new(&file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&file)
        .to_string();
    if stem != "__init__" {
        parts.push(stem);
    }
    if parts.is_empty() {
        "__init__".to_string()
    } else {
        parts.join(".")
    }
}

/// Turn a possibly relative module reference (`..pkg.mod`) into an absolute
/// dotted name. `Some("")` denotes the top-level namespace.
pub fn absolutize_module(candidate: &str, base_package: &[String]) -> Option<String> {
    let trimmed = candidate.trim();
    if !trimmed.starts_with('.') {
        return if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }
    let dot_count = trimmed.chars().take_while(|ch| *ch == '.').count();
    let rest = &trimmed[dot_count..];
    let up = dot_count.saturating_sub(1);
    if up > base_package.len() {
        return None;
    }
    let mut parts: Vec<String> = base_package.to_vec();
    let keep = parts.len().saturating_sub(up);
    parts.truncate(keep);
    for segment in rest.split('.').filter(|part| !part.is_empty()) {
        parts.push(segment.to_string());
    }
    Some(parts.join("."))
}

/// Join a package and a member name, tolerating the top-level namespace.
pub fn join_module(package: &str, name: &str) -> String {
    if package.is_empty() {
        name.to_string()
    } else {
        format!("{package}.{name}")
    }
}

fn resolve_module_to_file(base: &Path, module: &str) -> Option<PathBuf> {
    let parts: Vec<&str> = module.split('.').filter(|part| !part.is_empty()).collect();
    if parts.is_empty() {
        return None;
    }
    let mut rel = PathBuf::new();
    for part in &parts {
        rel.push(part);
    }
    if let Some(parent) = rel.parent() {
        if !parent.as_os_str().is_empty() && !base.join(parent).is_dir() {
            return None;
        }
    }
    let module_file = rel.with_extension("py");
    if base.join(&module_file).is_file() {
        return Some(base.join(module_file));
    }
    let package_init = rel.join("__init__.py");
    if base.join(&package_init).is_file() {
        return Some(base.join(package_init));
    }
    None
}
