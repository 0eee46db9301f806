// Terminal output helpers

use std::sync::atomic::{AtomicBool, Ordering};

use colored::Colorize;

static QUIET: AtomicBool = AtomicBool::new(false);

/// Suppress status and info lines for the rest of the process
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::Relaxed);
}

fn quiet() -> bool {
    QUIET.load(Ordering::Relaxed)
}

/// Print a dimmed status message (for progress steps)
pub fn status(msg: &str) {
    if !quiet() {
        eprintln!("  {}", msg.dimmed());
    }
}

/// Print a success message with checkmark
pub fn success(msg: &str) {
    if !quiet() {
        eprintln!("{} {}", "✓".green(), msg.green());
    }
}

/// Print an info line (normal text, indented)
pub fn info(msg: &str) {
    if !quiet() {
        eprintln!("  {}", msg);
    }
}

/// Print a command line about to run; shown even when quiet
pub fn command(line: &str) {
    eprintln!("{} {}", "$".dimmed(), line.cyan());
}

pub fn warning(msg: &str) {
    eprintln!("  {}: {}", "Warning".yellow(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{}: {}", "Error".red(), msg);
}
