use std::io::{self, Write};
use std::path::Path;
use std::process::Command as ProcessCommand;

use colored::Colorize;
use tracing::debug;

use crate::backend::{EncryptionBackend, SopsBackend};
use crate::command::Command;
use crate::config::Config;
use crate::crypt::{self, Crypt, EncryptOutcome};
use crate::error::Error;
use crate::forward::{
    AutoConfirm, Cleanup, ConfirmPolicy, Forwarder, HelmGrammar, HelmRunner, InteractiveConfirm,
    Mode,
};
use crate::ui::{info, status, success, warning};

pub struct App {
    config: Config,
    assume_yes: bool,
    cleanup: Cleanup,
}

impl App {
    pub fn new(config: Config, assume_yes: bool) -> Self {
        Self {
            config,
            assume_yes,
            cleanup: Cleanup::new(),
        }
    }

    /// Run one subcommand, returning the process exit code
    pub fn run(&self, cmd: Command) -> Result<i32, Error> {
        match cmd {
            Command::Enc { file } => self.encrypt(&file).map(|()| 0),
            Command::Dec { file } => self.decrypt(&file).map(|()| 0),
            Command::View { file } => self.view(&file).map(|()| 0),
            Command::Edit { file } => self.edit(&file).map(|()| 0),
            Command::Clean { dir } => self.clean(&dir).map(|()| 0),
            Command::Install { args } => self.forward(Mode::Install, &args),
            Command::Upgrade { args } => self.forward(Mode::Upgrade, &args),
            Command::Template { args } => self.forward(Mode::Template, &args),
            Command::Lint { args } => self.forward(Mode::Lint, &args),
            Command::Diff { args } => self.forward(Mode::Diff, &args),
            Command::External(args) => {
                let Some((name, rest)) = args.split_first() else {
                    return Err(Error::UnsupportedMode(String::new()));
                };
                let mode: Mode = name.parse()?;
                self.forward(mode, rest)
            }
        }
    }

    fn crypt(&self) -> Result<Crypt<SopsBackend>, Error> {
        let backend = SopsBackend::new(&self.config.sops_bin)?;
        Ok(Crypt::new(backend, self.config.naming()?))
    }

    fn encrypt(&self, file: &Path) -> Result<(), Error> {
        let crypt = self.crypt()?;
        status(&format!("Encrypting {}...", file.display()));

        match crypt.encrypt(file)? {
            EncryptOutcome::AlreadyEncrypted { source } => {
                info(&format!("Already encrypted: {}", source.display()));
            }
            EncryptOutcome::InPlace => {
                success(&format!("Encrypted {}", file.display()));
            }
            EncryptOutcome::FromSibling { source } => {
                success(&format!(
                    "Encrypted {} to {}",
                    source.display(),
                    file.display()
                ));
            }
        }
        Ok(())
    }

    fn decrypt(&self, file: &Path) -> Result<(), Error> {
        let crypt = self.crypt()?;
        status(&format!("Decrypting {}...", file.display()));

        let decrypted = crypt.decrypt(file)?;
        if decrypted.path == file {
            info(&format!("Not encrypted: {}", file.display()));
        } else if decrypted.decrypted_now {
            success(&format!("Decrypted to {}", decrypted.path.display()));
        } else {
            info(&format!("{} is up to date", decrypted.path.display()));
        }
        Ok(())
    }

    fn view(&self, file: &Path) -> Result<(), Error> {
        let plaintext = self.crypt()?.view(file)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&plaintext)?;
        stdout.flush()?;
        Ok(())
    }

    fn edit(&self, file: &Path) -> Result<(), Error> {
        self.edit_with(&self.crypt()?, file)
    }

    /// Decrypt `file` to its sibling and open the sibling in the editor
    fn edit_with<B: EncryptionBackend>(&self, crypt: &Crypt<B>, file: &Path) -> Result<(), Error> {
        let decrypted = crypt.decrypt(file)?;

        let editor = self.config.editor();
        let mut parts = editor.split_whitespace();
        let program = parts.next().unwrap_or("vi");
        debug!(editor, path = %decrypted.path.display(), "opening editor");

        let editor_status = ProcessCommand::new(program)
            .args(parts)
            .arg(&decrypted.path)
            .status()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::ToolNotFound(program.to_string()),
                _ => Error::Io(e),
            })?;

        if !editor_status.success() {
            warning(&format!("{} exited with {}", program, editor_status));
        }

        println!(
            "\n  {}: Run {} to re-encrypt your changes.",
            "Note".cyan(),
            format!("helm-secrets enc {}", file.display()).cyan()
        );
        Ok(())
    }

    fn clean(&self, dir: &Path) -> Result<(), Error> {
        let naming = self.config.naming()?;
        let report = crypt::clean(&naming, dir)?;

        for path in &report.removed {
            status(&format!("removed {}", path.display()));
        }
        for (path, e) in &report.failed {
            warning(&format!("could not remove {}: {}", path.display(), e));
        }

        if report.removed.is_empty() {
            info(&format!("No decrypted files under {}", dir.display()));
        } else {
            success(&format!("Removed {} decrypted file(s)", report.removed.len()));
        }
        Ok(())
    }

    fn forward(&self, mode: Mode, args: &[String]) -> Result<i32, Error> {
        let crypt = self.crypt()?;
        let runner = HelmRunner::new(self.config.helm_bin.clone());
        let confirm: &dyn ConfirmPolicy = if self.assume_yes || !self.config.confirm {
            &AutoConfirm
        } else {
            &InteractiveConfirm
        };

        self.cleanup.install_signal_handler()?;
        let forwarder = Forwarder::new(&crypt, &HelmGrammar, confirm, &runner, self.cleanup.clone());
        Ok(forwarder.forward(mode, args)?.exit_code())
    }
}
