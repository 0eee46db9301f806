// Forwarded helm commands - secret values files swapped for decrypted siblings

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::backend::EncryptionBackend;
use crate::crypt::{self, Crypt};
use crate::error::Error;
use crate::ui;

/// Exit status used when a signal interrupts a forwarded command
const SIGNAL_EXIT_CODE: i32 = 130;

/// helm subcommands that accept values files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Install,
    Upgrade,
    Template,
    Lint,
    Diff,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Install => "install",
            Mode::Upgrade => "upgrade",
            Mode::Template => "template",
            Mode::Lint => "lint",
            Mode::Diff => "diff",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Mode::Install),
            "upgrade" => Ok(Mode::Upgrade),
            "template" => Ok(Mode::Template),
            "lint" => Ok(Mode::Lint),
            "diff" => Ok(Mode::Diff),
            other => Err(Error::UnsupportedMode(other.to_string())),
        }
    }
}

// --- flag grammar ---

/// Which flags of a forwarded command name values files, and which consume
/// the following argument as their value
pub trait FlagGrammar {
    fn is_file_flag(&self, mode: Mode, flag: &str) -> bool;
    fn takes_value(&self, mode: Mode, flag: &str) -> bool;
}

const FILE_FLAGS: &[&str] = &["-f", "--values"];

const GLOBAL_FLAGS: &[&str] = &[
    "--burst-limit",
    "--kube-apiserver",
    "--kube-as-group",
    "--kube-as-user",
    "--kube-ca-file",
    "--kube-context",
    "--kube-token",
    "--kubeconfig",
    "-n",
    "--namespace",
    "--qps",
    "--registry-config",
    "--repository-cache",
    "--repository-config",
];

const SET_FLAGS: &[&str] = &[
    "--set",
    "--set-file",
    "--set-json",
    "--set-literal",
    "--set-string",
];

const CHART_SOURCE_FLAGS: &[&str] = &[
    "--ca-file",
    "--cert-file",
    "--key-file",
    "--keyring",
    "--password",
    "--post-renderer",
    "--post-renderer-args",
    "--repo",
    "--username",
    "--version",
];

const INSTALL_FLAGS: &[&str] = &[
    "--description",
    "--labels",
    "--name-template",
    "-o",
    "--output",
    "--timeout",
];

const UPGRADE_FLAGS: &[&str] = &[
    "--description",
    "--history-max",
    "--labels",
    "-o",
    "--output",
    "--timeout",
];

const TEMPLATE_FLAGS: &[&str] = &[
    "-a",
    "--api-versions",
    "--description",
    "--kube-version",
    "--labels",
    "--name-template",
    "--output-dir",
    "-s",
    "--show-only",
    "--timeout",
];

const LINT_FLAGS: &[&str] = &["--kube-version"];

const DIFF_FLAGS: &[&str] = &[
    "-a",
    "--api-versions",
    "-C",
    "--context",
    "--find-renames",
    "--kube-version",
    "--output",
    "--suppress",
    "--suppress-output-line-regex",
];

/// Hardcoded helm 3 flag tables
#[derive(Debug, Default, Clone, Copy)]
pub struct HelmGrammar;

impl HelmGrammar {
    fn value_flags(mode: Mode) -> [&'static [&'static str]; 4] {
        match mode {
            Mode::Install => [GLOBAL_FLAGS, SET_FLAGS, CHART_SOURCE_FLAGS, INSTALL_FLAGS],
            Mode::Upgrade => [GLOBAL_FLAGS, SET_FLAGS, CHART_SOURCE_FLAGS, UPGRADE_FLAGS],
            Mode::Template => [GLOBAL_FLAGS, SET_FLAGS, CHART_SOURCE_FLAGS, TEMPLATE_FLAGS],
            Mode::Lint => [GLOBAL_FLAGS, SET_FLAGS, &[], LINT_FLAGS],
            Mode::Diff => [GLOBAL_FLAGS, SET_FLAGS, CHART_SOURCE_FLAGS, DIFF_FLAGS],
        }
    }
}

impl FlagGrammar for HelmGrammar {
    fn is_file_flag(&self, _mode: Mode, flag: &str) -> bool {
        FILE_FLAGS.contains(&flag)
    }

    fn takes_value(&self, mode: Mode, flag: &str) -> bool {
        self.is_file_flag(mode, flag)
            || Self::value_flags(mode)
                .iter()
                .any(|table| table.contains(&flag))
    }
}

// --- confirmation ---

/// Decides whether a resolved command line may run
pub trait ConfirmPolicy {
    fn confirm(&self, command_line: &str) -> Result<bool, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

impl ConfirmPolicy for AutoConfirm {
    fn confirm(&self, _command_line: &str) -> Result<bool, Error> {
        Ok(true)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InteractiveConfirm;

impl ConfirmPolicy for InteractiveConfirm {
    fn confirm(&self, _command_line: &str) -> Result<bool, Error> {
        inquire::Confirm::new("Run this command?")
            .with_default(true)
            .prompt()
            .map_err(|e| match e {
                inquire::InquireError::NotTTY => {
                    Error::Prompt("not a terminal; pass --yes to run without asking".to_string())
                }
                other => Error::Prompt(other.to_string()),
            })
    }
}

// --- downstream tool ---

/// Runs the forwarded command and reports its exit code
pub trait Downstream {
    fn program(&self) -> &str;
    fn run(&self, mode: Mode, args: &[String]) -> Result<i32, Error>;
}

#[derive(Debug, Clone)]
pub struct HelmRunner {
    bin: String,
}

impl HelmRunner {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Downstream for HelmRunner {
    fn program(&self) -> &str {
        &self.bin
    }

    fn run(&self, mode: Mode, args: &[String]) -> Result<i32, Error> {
        use std::os::unix::process::ExitStatusExt;

        let status = Command::new(&self.bin)
            .arg(mode.as_str())
            .args(args)
            .status()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::ToolNotFound(self.bin.clone()),
                _ => Error::Io(e),
            })?;

        Ok(status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(1))
    }
}

// --- cleanup ---

/// Ephemeral decrypted files owed deletion.
///
/// Clones share one list. Every drain empties it, so a file is removed at
/// most once whichever of explicit cleanup, drop or the signal handler gets
/// there first. While a child runs, signals are left to the child and the
/// forwarder cleans up once it exits.
#[derive(Debug, Clone, Default)]
pub struct Cleanup {
    files: Arc<Mutex<Vec<PathBuf>>>,
    child_running: Arc<AtomicBool>,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, path: PathBuf) {
        debug!(path = %path.display(), "tracking ephemeral file");
        self.lock().push(path);
    }

    pub fn untrack(&self, path: &Path) {
        self.lock().retain(|p| p != path);
    }

    #[cfg(test)]
    pub fn pending(&self) -> Vec<PathBuf> {
        self.lock().clone()
    }

    /// Delete every tracked file, returning the ones that could not be removed
    pub fn run(&self) -> Vec<(PathBuf, io::Error)> {
        let files = std::mem::take(&mut *self.lock());
        let mut failed = Vec::new();
        for path in files {
            let leftovers = crypt::partial_writes(&path);
            for file in std::iter::once(path).chain(leftovers) {
                match std::fs::remove_file(&file) {
                    Ok(()) => debug!(path = %file.display(), "removed ephemeral file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => failed.push((file, e)),
                }
            }
        }
        failed
    }

    /// Mark a child process as running until the guard drops
    pub fn child_running(&self) -> ChildGuard {
        self.child_running.store(true, Ordering::SeqCst);
        ChildGuard {
            flag: Arc::clone(&self.child_running),
        }
    }

    /// React to SIGINT/SIGTERM. Returns true when the process should exit now.
    fn handle_signal(&self) -> bool {
        if self.child_running.load(Ordering::SeqCst) {
            debug!("signal received while child is running, waiting for it");
            return false;
        }
        report_failures(self.run());
        true
    }

    /// Install the SIGINT/SIGTERM handler. Call once per process.
    pub fn install_signal_handler(&self) -> Result<(), Error> {
        let cleanup = self.clone();
        ctrlc::set_handler(move || {
            if cleanup.handle_signal() {
                std::process::exit(SIGNAL_EXIT_CODE);
            }
        })
        .map_err(|e| Error::Io(io::Error::other(e)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PathBuf>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        // Only the last handle sweeps; the signal handler keeps one alive.
        if Arc::strong_count(&self.files) == 1 {
            report_failures(self.run());
        }
    }
}

pub struct ChildGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

fn report_failures(failed: Vec<(PathBuf, io::Error)>) {
    for (path, e) in failed {
        warn!(path = %path.display(), error = %e, "failed to remove decrypted file");
        ui::warning(&format!("could not remove {}: {}", path.display(), e));
    }
}

// --- forwarding ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed { exit_code: i32 },
    Declined,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Completed { exit_code } => *exit_code,
            Outcome::Declined => 0,
        }
    }
}

pub struct Forwarder<'a, B> {
    crypt: &'a Crypt<B>,
    grammar: &'a dyn FlagGrammar,
    confirm: &'a dyn ConfirmPolicy,
    downstream: &'a dyn Downstream,
    cleanup: Cleanup,
}

impl<'a, B: EncryptionBackend> Forwarder<'a, B> {
    pub fn new(
        crypt: &'a Crypt<B>,
        grammar: &'a dyn FlagGrammar,
        confirm: &'a dyn ConfirmPolicy,
        downstream: &'a dyn Downstream,
        cleanup: Cleanup,
    ) -> Self {
        Self {
            crypt,
            grammar,
            confirm,
            downstream,
            cleanup,
        }
    }

    /// Resolve secrets in `argv`, confirm, run helm, then remove every
    /// sibling decrypted along the way.
    pub fn forward(&self, mode: Mode, argv: &[String]) -> Result<Outcome, Error> {
        let result = self.resolve_and_run(mode, argv);
        report_failures(self.cleanup.run());
        result
    }

    fn resolve_and_run(&self, mode: Mode, argv: &[String]) -> Result<Outcome, Error> {
        let args = self.resolve_args(mode, argv)?;
        let line = command_line(self.downstream.program(), mode, &args);
        ui::command(&line);

        if !self.confirm.confirm(&line)? {
            ui::info("Skipped.");
            return Ok(Outcome::Declined);
        }

        let exit_code = {
            let _child = self.cleanup.child_running();
            self.downstream.run(mode, &args)?
        };
        debug!(mode = %mode, exit_code, "forwarded command finished");
        Ok(Outcome::Completed { exit_code })
    }

    /// Rewrite `argv`, replacing secret values files with decrypted paths
    pub fn resolve_args(&self, mode: Mode, argv: &[String]) -> Result<Vec<String>, Error> {
        let mut out = Vec::with_capacity(argv.len());
        let mut iter = argv.iter();

        while let Some(arg) = iter.next() {
            if arg == "--" {
                out.push(arg.clone());
                out.extend(iter.by_ref().cloned());
                break;
            }
            if !arg.starts_with('-') || arg == "-" {
                out.push(arg.clone());
                continue;
            }

            match self.classify(mode, arg) {
                FlagForm::FileSeparate => {
                    out.push(arg.clone());
                    if let Some(value) = iter.next() {
                        out.push(self.resolve_value(value)?);
                    }
                }
                FlagForm::FileInline { prefix, value } => {
                    out.push(format!("{}{}", prefix, self.resolve_value(value)?));
                }
                FlagForm::Other { consumes_next } => {
                    out.push(arg.clone());
                    if consumes_next {
                        out.extend(iter.next().cloned());
                    }
                }
            }
        }

        Ok(out)
    }

    fn classify<'s>(&self, mode: Mode, arg: &'s str) -> FlagForm<'s> {
        let file = |flag: &str| self.grammar.is_file_flag(mode, flag);

        if arg.starts_with("--") {
            return match arg.split_once('=') {
                Some((flag, value)) if file(flag) => FlagForm::FileInline {
                    prefix: &arg[..=flag.len()],
                    value,
                },
                Some(_) => FlagForm::Other {
                    consumes_next: false,
                },
                None if file(arg) => FlagForm::FileSeparate,
                None => FlagForm::Other {
                    consumes_next: self.grammar.takes_value(mode, arg),
                },
            };
        }

        // Short flag, possibly with its value attached: -fX or -f=X
        let Some((split, _)) = arg.char_indices().nth(2) else {
            return if file(arg) {
                FlagForm::FileSeparate
            } else {
                FlagForm::Other {
                    consumes_next: self.grammar.takes_value(mode, arg),
                }
            };
        };

        let flag = &arg[..split];
        if !file(flag) {
            return FlagForm::Other {
                consumes_next: false,
            };
        }
        let prefix_len = if arg[split..].starts_with('=') { split + 1 } else { split };
        FlagForm::FileInline {
            prefix: &arg[..prefix_len],
            value: &arg[prefix_len..],
        }
    }

    /// Resolve each comma-separated file in a values flag
    fn resolve_value(&self, value: &str) -> Result<String, Error> {
        let resolved = value
            .split(',')
            .map(|file| self.resolve_file(file))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(resolved.join(","))
    }

    fn resolve_file(&self, file: &str) -> Result<String, Error> {
        let path = Path::new(file);
        if file.is_empty() || !self.crypt.naming().is_secret_name(path) {
            return Ok(file.to_string());
        }

        // Tracked before the write so an interrupt mid-decrypt leaves nothing behind
        let target = self.crypt.naming().decrypted_path(path);
        let tracked = !target.exists();
        if tracked {
            self.cleanup.track(target.clone());
        }

        let decrypted = self.crypt.decrypt(path)?;
        if tracked && !decrypted.is_ephemeral() {
            self.cleanup.untrack(&target);
        }
        if decrypted.decrypted_now {
            ui::status(&format!("Decrypted {}", file));
        }
        Ok(decrypted.path.to_string_lossy().into_owned())
    }
}

enum FlagForm<'s> {
    /// `-f FILE` / `--values FILE`
    FileSeparate,
    /// `-fFILE`, `-f=FILE`, `--values=FILE`
    FileInline { prefix: &'s str, value: &'s str },
    Other { consumes_next: bool },
}

/// Render a command line for display, quoting arguments the shell would split
pub fn command_line(program: &str, mode: Mode, args: &[String]) -> String {
    std::iter::once(program)
        .chain(std::iter::once(mode.as_str()))
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
