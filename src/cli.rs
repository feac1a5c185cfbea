use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "flowtrace",
    version,
    about = "Cross-service call graphs for Python source trees",
    after_help = r#"Examples:
  flowtrace routes --repo ./services > routes.json
  flowtrace trace services/website/website.py buy_cart --routes routes.json --pretty
  flowtrace trace services/website/website.py buy_cart --routes-json '[{"name":"/cart/total_price/<int:user_id>","methods":["GET"],"module":"order","func_name":"get_total_price"}]'
  flowtrace trace --flow checkout --repo ./services --routes routes.json --prune --emit-bodies
  flowtrace flows --repo ./services
"#
)]
pub struct Args {
    /// Log resolution decisions to stderr.
    #[arg(long, short, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Trace one entry function and print its call graph as JSON.
    Trace {
        /// Python file defining the entry function.
        #[arg(required_unless_present = "flow", conflicts_with = "flow")]
        file: Option<PathBuf>,
        /// Entry function name.
        #[arg(required_unless_present = "flow", conflicts_with = "flow")]
        function: Option<String>,
        /// Take the entry point from a `# flow-start(NAME)` marker.
        #[arg(long)]
        flow: Option<String>,
        /// Repository searched for flow markers (default: current directory).
        #[arg(long)]
        repo: Option<PathBuf>,
        /// Route catalog file (JSON array of route records).
        #[arg(long, value_name = "PATH", conflicts_with = "routes_json")]
        routes: Option<PathBuf>,
        /// Route catalog given inline.
        #[arg(long, value_name = "JSON")]
        routes_json: Option<String>,
        /// Directory module names are relative to (default: the entry file's directory).
        #[arg(long)]
        root: Option<PathBuf>,
        /// Extra directories searched for modules after the root.
        #[arg(long = "search-path", value_name = "DIR")]
        search_paths: Vec<PathBuf>,
        /// Reduce emitted bodies to statements carrying tracked calls.
        #[arg(long)]
        prune: bool,
        /// Include function bodies in the output.
        #[arg(long)]
        emit_bodies: bool,
        /// Fail on call shapes that cannot be classified.
        #[arg(long)]
        strict: bool,
        /// Add terminal nodes for calls into third-party modules.
        #[arg(long)]
        external: bool,
        /// Pretty-print the JSON output.
        #[arg(long)]
        pretty: bool,
    },
    /// Discover Flask/FastAPI routes and print them as a route catalog.
    Routes {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Include files ignored by .gitignore.
        #[arg(long)]
        no_ignore: bool,
    },
    /// List flow markers.
    Flows {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Include files ignored by .gitignore.
        #[arg(long)]
        no_ignore: bool,
    },
}
