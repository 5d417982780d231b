use anyhow::Result;
use clap::Parser;

use aviary_cli::{launcher, Cli};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // the dash sentinel marks the internal reinvocation of the secondary
    // process: `aviary - <node> <cage> NORMAL|FAILURE <root>`
    let code = if args.get(1).map(String::as_str) == Some("-") {
        launcher::secondary(&args[2..])?
    } else {
        launcher::primary(Cli::parse())?
    };
    std::process::exit(code);
}
