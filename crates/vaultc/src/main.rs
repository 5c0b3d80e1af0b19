//! vaultc - Compiler and runtime for the vault secret-archive language
//!
//! Modes, chosen by input extension:
//! - `.vau`: compile a source program into a sealed `.svau` archive
//! - `.svau`: verify an archive and print the decrypted view
//! - `.vsc`: run a query script against a `--load`ed archive
//!
//! Configuration (master key, token, security material) comes from
//! `./.vault/var.vc`; see the config module. Failures print
//! `Error: <message>` on stderr and exit 1.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser as ClapParser;
use colored::*;

use vaultc::archive;
use vaultc::config::VaultConfig;
use vaultc::interp::{Interpreter, InterpreterOptions};
use vaultc::lexer;
use vaultc::parser::Parser;
use vaultc::script;

#[derive(ClapParser)]
#[command(name = "vaultc")]
#[command(about = "Compile vault programs into sealed, MAC-protected secret archives")]
#[command(version)]
#[command(after_help = "\
MODES (by input extension):
    program.vau        Compile to an archive (stdout, or --out FILE)
    archive.svau       Verify the archive MAC and print the decrypted view
    query.vsc          Run a query script; requires --load ARCHIVE

EXAMPLES:
    vaultc deploy.vau --out deploy.svau
    vaultc deploy.vau --out next.svau --load deploy.svau
    vaultc deploy.svau --hide-mac
    vaultc report.vsc --load deploy.svau

CONFIG:
    Secrets come from ./.vault/var.vc (MASTER_KEY=<hex>, TOKEN=<string>).
    Neither the key nor the token is ever written into an archive.")]
struct Cli {
    /// Input file: .vau source, .svau archive, or .vsc query script
    input: PathBuf,

    /// Write the archive to this file instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,

    /// Force archive emission to stdout even with --out
    #[arg(long)]
    stdout: bool,

    /// Hide per-entry MACs in the decrypted view
    #[arg(long)]
    hide_mac: bool,

    /// Seed compilation from this archive (or the query's archive)
    #[arg(long)]
    load: Option<PathBuf>,

    /// Trace evaluation on stderr
    #[arg(long)]
    verbose: bool,

    /// Create optional vaults even when absent from the seed archive
    #[arg(long)]
    materialize_optionals: bool,

    /// Lost-mode recovery: require and check security answers
    #[arg(long)]
    lost: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = VaultConfig::load(cli.lost)?;

    match extension(&cli.input) {
        "svau" => cmd_view(&cli, &config),
        "vsc" => cmd_query(&cli, &config),
        _ => cmd_compile(&cli, &config),
    }
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|ext| ext.to_str()).unwrap_or("")
}

/// Verify an archive and print its decrypted view.
fn cmd_view(cli: &Cli, config: &VaultConfig) -> Result<()> {
    let archive = archive::load_verified(&cli.input, &config.token, &config.master_key)?;
    print!("{}", archive::decrypted_view(&archive, cli.hide_mac)?);
    Ok(())
}

/// Run a `.vsc` query script against a verified archive.
fn cmd_query(cli: &Cli, config: &VaultConfig) -> Result<()> {
    let Some(load) = &cli.load else {
        bail!("Script requires --load <archive.svau>");
    };
    let archive = archive::load_verified(load, &config.token, &config.master_key)?;
    let entries = script::decrypt_entries(&archive)?;
    for line in script::run_file(&cli.input, &entries)? {
        println!("{}", line);
    }
    Ok(())
}

/// Compile a `.vau` program, optionally seeded from a prior archive.
fn cmd_compile(cli: &Cli, config: &VaultConfig) -> Result<()> {
    let lines = lexer::lex_file(&cli.input)?;
    let program = Parser::new(lines).parse()?;

    let opts = InterpreterOptions {
        verbose: cli.verbose,
        materialize_optional: cli.materialize_optionals,
        forced_master_key: Some(config.master_key.clone()),
    };
    let mut interp = Interpreter::new(opts);

    let mut dependencies = Vec::new();
    if let Some(load) = &cli.load {
        let seed = archive::load_verified(load, &config.token, &config.master_key)?;
        dependencies = seed.dependencies.clone();
        dependencies.push(
            load.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| load.display().to_string()),
        );
        dependencies = archive::sorted_unique(dependencies);
        interp.seed(seed.vaults);
    }

    let sealed = interp.run(&program)?;
    let hmac = archive::archive_hmac(&sealed, &dependencies, &config.token, &config.master_key)?;
    let body = archive::disk_form(&sealed, &dependencies);

    match &cli.out {
        Some(out) if !cli.stdout => {
            // Body first (truncating), then the hmac line is appended.
            // Nothing is written if compilation failed earlier.
            std::fs::write(out, &body)
                .with_context(|| format!("Unable to write: {}", out.display()))?;
            let mut file = OpenOptions::new()
                .append(true)
                .open(out)
                .with_context(|| format!("Unable to write: {}", out.display()))?;
            writeln!(file, "hmac {}", hmac)?;
            if cli.verbose {
                eprintln!("{} {}", "wrote".green(), out.display());
            }
        }
        _ => {
            print!("{}", body);
            println!("hmac {}", hmac);
        }
    }
    Ok(())
}
