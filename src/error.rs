use thiserror::Error;

/// Failures that abort an analysis run, or that callers may want to match on.
///
/// Everything else (unresolvable imports, files that fail to parse outside
/// the entry module, routes with no catalog match) is logged and treated as
/// "no body available".
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("function `{function}` not found in module `{module}`")]
    EntryNotFound { module: String, function: String },

    #[error("module `{module}` could not be resolved under the analysis root")]
    ModuleNotFound { module: String },

    #[error("failed to parse {path}")]
    Parse { path: String },

    #[error("{path} is {size} bytes, above the configured limit")]
    TooLarge { path: String, size: u64 },

    #[error("unrecognized call shape in {module}.{function} at line {line}")]
    UnrecognizedCall {
        module: String,
        function: String,
        line: usize,
    },

    #[error("flow `{name}` has no flow-start marker")]
    FlowNotFound { name: String },

    #[error("invalid route catalog: {0}")]
    InvalidCatalog(String),
}
