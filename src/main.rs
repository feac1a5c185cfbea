use anyhow::{Result, bail};
use clap::Parser;
use flowtrace::analysis::{AnalysisOptions, analyze};
use flowtrace::catalog::{self, RouteCatalog};
use flowtrace::config::{Config, UnresolvedCallPolicy};
use flowtrace::scan::ScanOptions;
use flowtrace::{cli, flows};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    init_tracing(args.verbose);

    match args.command {
        cli::Command::Trace {
            file,
            function,
            flow,
            repo,
            routes,
            routes_json,
            root,
            search_paths,
            prune,
            emit_bodies,
            strict,
            external,
            pretty,
        } => {
            let (file, function): (PathBuf, String) = match (flow, file, function) {
                (Some(name), _, _) => {
                    let repo = repo.unwrap_or_else(|| PathBuf::from("."));
                    let found = flows::discover(&repo, ScanOptions::default())?;
                    let flow = flows::find(&found, &name)?;
                    (flow.start.file.clone(), flow.start.function.clone())
                }
                (None, Some(file), Some(function)) => (file, function),
                _ => bail!("either FILE and FUNCTION or --flow is required"),
            };
            let catalog = match (routes, routes_json) {
                (Some(path), _) => RouteCatalog::load(&path)?,
                (None, Some(raw)) => RouteCatalog::from_json_str(&raw)?,
                (None, None) => RouteCatalog::default(),
            };

            let mut options = AnalysisOptions::from_config(Config::get());
            options.root = root;
            options.search_paths = search_paths;
            options.prune = prune;
            options.include_external = external;
            if strict {
                options.unresolved_calls = UnresolvedCallPolicy::Error;
            }

            let analysis = analyze(&file, &function, &catalog, &options)?;
            print_json(&analysis.output(emit_bodies), pretty)
        }
        cli::Command::Routes { repo, no_ignore } => {
            let routes = catalog::discover(&repo, ScanOptions::new(no_ignore))?;
            print_json(&routes, true)
        }
        cli::Command::Flows { repo, no_ignore } => {
            let found = flows::discover(&repo, ScanOptions::new(no_ignore))?;
            print_json(&found, true)
        }
    }
}
