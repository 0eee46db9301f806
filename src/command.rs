use std::path::PathBuf;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Command {
    /// Encrypt a secrets file, from its decrypted sibling when that is newer
    Enc { file: PathBuf },
    /// Decrypt a secrets file into its decrypted sibling (secrets.yaml -> secrets.dec.yaml)
    Dec { file: PathBuf },
    /// Print a secrets file decrypted, without writing anything to disk
    View { file: PathBuf },
    /// Decrypt a secrets file and open the sibling in an editor; re-encrypt with enc
    Edit { file: PathBuf },
    /// Recursively remove decrypted siblings under a directory
    Clean {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// helm install with secrets values files decrypted
    Install {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// helm upgrade with secrets values files decrypted
    Upgrade {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// helm template with secrets values files decrypted
    Template {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// helm lint with secrets values files decrypted
    Lint {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// helm diff (plugin) with secrets values files decrypted
    Diff {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    #[command(external_subcommand)]
    External(Vec<String>),
}
