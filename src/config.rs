// Configuration module for flowtrace
// Reads from environment variables with sensible defaults

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::warn;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// What the graph builder does with a call whose callee is neither a name
/// nor an attribute chain (`handlers[kind](...)`, `make()()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedCallPolicy {
    Ignore,
    Error,
}

impl FromStr for UnresolvedCallPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown policy `{other}` (expected ignore|error)")),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Receiver names treated as HTTP clients (FLOWTRACE_HTTP_CLIENTS)
    pub http_clients: Vec<String>,

    /// Path components marking third-party code (FLOWTRACE_EXTERNAL_DIRS)
    pub external_dirs: Vec<String>,

    /// Handling of unclassifiable call shapes (FLOWTRACE_UNRESOLVED_CALLS)
    pub unresolved_calls: UnresolvedCallPolicy,

    /// Modules larger than this many bytes are not parsed (FLOWTRACE_MAX_FILE_SIZE)
    pub max_file_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_clients: vec!["requests".to_string(), "httpx".to_string()],
            external_dirs: [
                "site-packages",
                "dist-packages",
                ".venv",
                "venv",
                "__pypackages__",
            ]
            .iter()
            .map(|dir| dir.to_string())
            .collect(),
            unresolved_calls: UnresolvedCallPolicy::Ignore,
            max_file_size: 2 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(val) = env::var("FLOWTRACE_HTTP_CLIENTS") {
            let clients = split_list(&val);
            if clients.is_empty() {
                warn!(value = %val, "empty FLOWTRACE_HTTP_CLIENTS, using defaults");
            } else {
                config.http_clients = clients;
            }
        }

        if let Ok(val) = env::var("FLOWTRACE_EXTERNAL_DIRS") {
            config.external_dirs = split_list(&val);
        }

        if let Ok(val) = env::var("FLOWTRACE_UNRESOLVED_CALLS") {
            match val.parse() {
                Ok(parsed) => config.unresolved_calls = parsed,
                Err(err) => warn!(
                    value = %val,
                    error = %err,
                    "invalid FLOWTRACE_UNRESOLVED_CALLS, using default"
                ),
            }
        }

        if let Ok(val) = env::var("FLOWTRACE_MAX_FILE_SIZE") {
            if let Ok(parsed) = val.parse() {
                config.max_file_size = parsed;
            } else {
                warn!(
                    value = %val,
                    default = config.max_file_size,
                    "invalid FLOWTRACE_MAX_FILE_SIZE, using default"
                );
            }
        }

        config
    }

    /// Get the global configuration instance
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_string())
        .collect()
}
