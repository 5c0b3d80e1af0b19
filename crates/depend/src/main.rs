//! depend - List the dependencies recorded in a vault secure archive
//!
//! Scans an archive's `depends` lines and prints the unique, sorted set.
//! No MAC verification: this is a plain line scan so it works on any
//! archive the current config cannot verify.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser)]
#[command(name = "depend")]
#[command(about = "List the dependencies recorded in a vault secure archive")]
#[command(version)]
struct Cli {
    /// Archive to inspect (.svau)
    file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cli.file.exists() {
        bail!("Missing file: {}", cli.file.display());
    }
    let content = std::fs::read_to_string(&cli.file)
        .with_context(|| format!("Unable to read: {}", cli.file.display()))?;

    let deps: BTreeSet<&str> = content
        .lines()
        .filter_map(|line| line.strip_prefix("depends "))
        .collect();

    let name = cli
        .file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.file.display().to_string());
    println!("dependencies for {}", name);

    if deps.is_empty() {
        println!("(none)");
        return Ok(());
    }
    for dep in deps {
        println!("- {}", dep);
    }
    Ok(())
}
