use std::path::Path;

use {anyhow::Result, clap::Subcommand};

use conveyor_config::{Severity, ValidationResult, validate};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors and warnings.
    Check {
        /// Show informational diagnostics as well.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the effective configuration after defaults and env substitution.
    Show,
}

pub fn handle_config(action: ConfigAction, path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check { verbose } => check(path, verbose),
        ConfigAction::Show => show(path),
    }
}

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(path: Option<&Path>, verbose: bool) -> Result<()> {
    let result = validate(path);

    match result.config_path {
        Some(ref path) => eprintln!("Checking {}\n", path.display()),
        None => eprintln!("No config file found; checking defaults.\n"),
    }

    let shown = print_diagnostics(&result, verbose);
    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }
    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_diagnostics(result: &ValidationResult, verbose: bool) -> usize {
    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }
        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };
        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }
    shown
}

fn show(path: Option<&Path>) -> Result<()> {
    let config = crate::load(path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
