//! Flow markers: `# flow-start(name)` and `# flow-end(name)` comments that
//! tag the function defined right after them as the start or end of a named
//! cross-service flow.

use crate::error::AnalysisError;
use crate::scan::{ScanOptions, scan_python_files};
use crate::util;
use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowPoint {
    /// File stem of the defining module.
    pub module: String,
    pub file: PathBuf,
    pub function: String,
    /// Line of the marker comment.
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flow {
    pub name: String,
    pub start: FlowPoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<FlowPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMarker {
    pub kind: MarkerKind,
    pub name: String,
    pub point: FlowPoint,
}

pub struct FlowScanner {
    start_regex: Regex,
    end_regex: Regex,
    def_regex: Regex,
}

impl FlowScanner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            start_regex: Regex::new(r"#+\s*flow-start\((.+)\)")?,
            end_regex: Regex::new(r"#+\s*flow-end\((.+)\)")?,
            def_regex: Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(")?,
        })
    }

    /// Markers in one source file. A marker with no `def` below it is
    /// ignored.
    pub fn markers(&self, source: &str, module: &str, file: &Path) -> Vec<FlowMarker> {
        let lines: Vec<&str> = source.lines().collect();
        let mut markers = Vec::new();
        for (idx, text) in lines.iter().enumerate() {
            let (kind, captures) = match self.start_regex.captures(text) {
                Some(captures) => (MarkerKind::Start, captures),
                None => match self.end_regex.captures(text) {
                    Some(captures) => (MarkerKind::End, captures),
                    None => continue,
                },
            };
            let name = captures[1].trim().to_string();
            let function = lines[idx + 1..]
                .iter()
                .find_map(|next| self.def_regex.captures(next))
                .map(|def| def[1].to_string());
            let Some(function) = function else {
                warn!(file = %file.display(), line = idx + 1, flow = %name, "flow marker without a function");
                continue;
            };
            markers.push(FlowMarker {
                kind,
                name,
                point: FlowPoint {
                    module: module.to_string(),
                    file: file.to_path_buf(),
                    function,
                    line: idx + 1,
                },
            });
        }
        markers
    }
}

/// Pair start and end markers by name. The first start marker of a name
/// wins; later duplicates are reported and dropped.
pub fn collect_flows(markers: Vec<FlowMarker>) -> Vec<Flow> {
    let mut flows: BTreeMap<String, Flow> = BTreeMap::new();
    let mut ends: Vec<FlowMarker> = Vec::new();
    for marker in markers {
        match marker.kind {
            MarkerKind::Start => {
                if let Some(existing) = flows.get(&marker.name) {
                    warn!(
                        flow = %marker.name,
                        kept = %existing.start.file.display(),
                        duplicate = %marker.point.file.display(),
                        line = marker.point.line,
                        "duplicate flow-start"
                    );
                    continue;
                }
                flows.insert(
                    marker.name.clone(),
                    Flow {
                        name: marker.name,
                        start: marker.point,
                        end: None,
                    },
                );
            }
            MarkerKind::End => ends.push(marker),
        }
    }
    for marker in ends {
        match flows.get_mut(&marker.name) {
            Some(flow) if flow.end.is_none() => flow.end = Some(marker.point),
            Some(_) => warn!(flow = %marker.name, line = marker.point.line, "duplicate flow-end"),
            None => warn!(flow = %marker.name, line = marker.point.line, "flow-end without flow-start"),
        }
    }
    flows.into_values().collect()
}

/// Every flow marked in the Python files under `repo`.
pub fn discover(repo: &Path, options: ScanOptions) -> Result<Vec<Flow>> {
    let repo = util::canonical(repo);
    let scanner = FlowScanner::new()?;
    let mut markers = Vec::new();
    for file in scan_python_files(&repo, options)? {
        let source = match util::read_to_string(&file.abs_path) {
            Ok(source) => source,
            Err(err) => {
                warn!(path = %file.rel_path, error = %err, "skipping unreadable file");
                continue;
            }
        };
        let module = file
            .abs_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        markers.extend(scanner.markers(&source, &module, &file.abs_path));
    }
    let flows = collect_flows(markers);
    info!(repo = %repo.display(), flows = flows.len(), "discovered flows");
    Ok(flows)
}

pub fn find<'a>(flows: &'a [Flow], name: &str) -> Result<&'a Flow> {
    flows
        .iter()
        .find(|flow| flow.name == name)
        .ok_or_else(|| {
            AnalysisError::FlowNotFound {
                name: name.to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn marker_names_the_next_function() {
        let scanner = FlowScanner::new().unwrap();
        let source = r#"
import requests

# flow-start(checkout)
@app.route("/buy")
def buy_cart():
    pass

## flow-end( checkout )
async def finish():
    pass
"#;
        let markers = scanner.markers(source, "website", Path::new("website.py"));
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].kind, MarkerKind::Start);
        assert_eq!(markers[0].name, "checkout");
        assert_eq!(markers[0].point.function, "buy_cart");
        assert_eq!(markers[0].point.line, 4);
        assert_eq!(markers[1].kind, MarkerKind::End);
        assert_eq!(markers[1].name, "checkout");
        assert_eq!(markers[1].point.function, "finish");
    }

    #[test]
    fn dangling_marker_is_ignored() {
        let scanner = FlowScanner::new().unwrap();
        let markers = scanner.markers("x = 1\n# flow-start(orphan)\n", "m", Path::new("m.py"));
        assert!(markers.is_empty());
    }

    #[test]
    fn discovers_flows_and_keeps_first_duplicate() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(
            root.join("a/website.py"),
            "# flow-start(checkout)\ndef buy_cart():\n    pass\n",
        )
        .unwrap();
        fs::write(
            root.join("b/order.py"),
            "# flow-start(checkout)\ndef other():\n    pass\n\n# flow-end(checkout)\ndef place():\n    pass\n",
        )
        .unwrap();

        let flows = discover(root, ScanOptions::default()).unwrap();
        assert_eq!(flows.len(), 1);
        let flow = find(&flows, "checkout").unwrap();
        assert_eq!(flow.start.function, "buy_cart");
        assert_eq!(flow.start.module, "website");
        assert_eq!(flow.end.as_ref().unwrap().function, "place");

        let err = find(&flows, "refund").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnalysisError>(),
            Some(AnalysisError::FlowNotFound { .. })
        ));
    }
}
