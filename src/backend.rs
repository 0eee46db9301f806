// Encryption backend - trait + sops implementation

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::debug;

use crate::error::Error;

/// Turns a file into ciphertext or plaintext on stdout; never writes files itself
pub trait EncryptionBackend {
    fn decrypt(&self, path: &Path) -> Result<Vec<u8>, Error>;
    fn encrypt(&self, path: &Path) -> Result<Vec<u8>, Error>;
}

// --- sops ---

#[derive(Debug)]
pub struct SopsBackend {
    bin: PathBuf,
}

impl SopsBackend {
    /// Resolve the sops binary up front so a missing install is reported once
    pub fn new(bin: &str) -> Result<Self, Error> {
        let bin = which::which(bin).map_err(|_| Error::ToolNotFound(bin.to_string()))?;
        debug!(sops = %bin.display(), "resolved sops binary");
        Ok(Self { bin })
    }

    fn run(&self, action: &str, path: &Path) -> std::io::Result<Output> {
        debug!(action, path = %path.display(), "invoking sops");
        Command::new(&self.bin)
            .arg(action)
            .args(["--input-type", "yaml", "--output-type", "yaml"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
    }
}

/// Best description of a failed run: stderr if sops wrote any, else the status
fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("sops exited with {}", output.status)
    } else {
        stderr.to_string()
    }
}

impl EncryptionBackend for SopsBackend {
    fn decrypt(&self, path: &Path) -> Result<Vec<u8>, Error> {
        let output = self.run("--decrypt", path).map_err(|e| Error::DecryptionFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(Error::DecryptionFailed {
                path: path.to_path_buf(),
                message: failure_message(&output),
            });
        }
        Ok(output.stdout)
    }

    fn encrypt(&self, path: &Path) -> Result<Vec<u8>, Error> {
        let output = self.run("--encrypt", path).map_err(|e| Error::EncryptionFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(Error::EncryptionFailed {
                path: path.to_path_buf(),
                message: failure_message(&output),
            });
        }
        Ok(output.stdout)
    }
}
