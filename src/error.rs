// Error types

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Failed to decrypt {}: {message}", path.display())]
    DecryptionFailed { path: PathBuf, message: String },

    #[error("Failed to encrypt {}: {message}", path.display())]
    EncryptionFailed { path: PathBuf, message: String },

    #[error(
        "Refusing to encrypt decrypted file {}; run enc on {} instead",
        path.display(),
        canonical.display()
    )]
    InvalidTarget { path: PathBuf, canonical: PathBuf },

    #[error(
        "Refusing to encrypt {}: name does not match a secret file pattern",
        .0.display()
    )]
    NotASecret(PathBuf),

    #[error("Unsupported command '{0}'")]
    UnsupportedMode(String),

    #[error("'{0}' not found in PATH")]
    ToolNotFound(String),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Prompt failed: {0}")]
    Prompt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
