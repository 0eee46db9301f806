// Entry point - CLI parsing and wiring

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod backend;
mod command;
mod config;
mod crypt;
mod error;
mod forward;
mod secret;
mod ui;

use crate::app::App;
use crate::command::Command;

#[derive(Parser)]
#[command(name = "helm-secrets")]
#[command(about = "Decrypt sops-encrypted values files around helm commands")]
#[command(version)]
#[command(after_help = r#"FILES:
    secrets.yaml        encrypted with sops, safe to commit
    secrets.dec.yaml    decrypted sibling, never commit

    Forwarded commands decrypt every -f/--values file named secrets*.yaml,
    pass the decrypted paths to helm, and remove the ones they created."#)]
struct Cli {
    /// Run forwarded helm commands without asking
    #[arg(long, short = 'y')]
    yes: bool,

    /// Only print warnings and errors
    #[arg(long, short = 'q')]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    ui::set_quiet(cli.quiet);

    match run(cli) {
        Ok(code) => u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from),
        Err(e) => {
            ui::error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<i32, error::Error> {
    let config = config::Config::load()?;
    let app = App::new(config, cli.yes);
    app.run(cli.command)
}
