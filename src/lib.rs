pub mod analysis;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod flows;
pub mod graph;
pub mod imports;
pub mod prune;
pub mod python;
pub mod resolver;
pub mod scan;
pub mod syntax;
pub mod tracer;
pub mod util;
