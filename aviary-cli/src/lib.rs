#![cfg_attr(not(doctest), doc = include_str!("../README.md"))]

pub mod launcher;
pub mod logging;

use std::path::PathBuf;

use clap::Parser;

/// Launches and supervises an aviary service cage.
#[derive(Parser, Debug)]
#[command(name = "aviary", version, about)]
pub struct Cli {
    /// The cage to run, as `[node.]cage`; the node name defaults to the
    /// host's short name.
    pub target: String,

    /// Root directory holding the `cages/` tree; defaults to the
    /// directory the executable lives in.
    #[arg(long)]
    pub root: Option<PathBuf>,
}
