//! Operator-facing output for the CLI.
//!
//! Primary data (tables) goes to stdout so it can be piped. Everything else
//! (informational lines, warnings, success and error messages) goes to
//! stderr with a level tag. Tags are colored only when stderr is a terminal;
//! `console` handles the detection.

use std::io::Write;

use anyhow::{Context, Result};
use console::style;

/// Print an informational line to stderr.
pub fn info(msg: &str) {
    eprintln!("{}: {}", style("INFO").cyan().for_stderr(), msg);
}

/// Print a success line to stderr.
pub fn success(msg: &str) {
    eprintln!("{}: {}", style("SUCCESS").green().for_stderr(), msg);
}

/// Print a warning line to stderr.
pub fn warning(msg: &str) {
    eprintln!("{}: {}", style("WARNING").yellow().for_stderr(), msg);
}

/// Print an error line to stderr.
pub fn error(msg: &str) {
    eprintln!("{}: {}", style("ERROR").red().for_stderr(), msg);
}

/// Print a plain line to stderr, no tag.
pub fn plain(msg: &str) {
    eprintln!("{msg}");
}

/// Ask a yes/no question on stdin. Only `y` or `yes` (case-insensitive,
/// whitespace-trimmed) count as confirmation.
pub fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} (y/N): ");
    std::io::stderr().flush().ok();

    let mut response = String::new();
    std::io::stdin()
        .read_line(&mut response)
        .context("failed to read confirmation")?;

    let response = response.trim().to_lowercase();
    Ok(response == "y" || response == "yes")
}

/// Create a borderless two-column-style table with the given headers.
pub fn new_table(headers: &[&str]) -> comfy_table::Table {
    let mut table = comfy_table::Table::new();
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    table.set_header(headers.to_vec());
    table
}
