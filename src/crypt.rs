// Decrypt/encrypt orchestration around an EncryptionBackend

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use glob::Pattern;
use tempfile::Builder;
use tracing::debug;
use walkdir::WalkDir;

use crate::backend::EncryptionBackend;
use crate::error::Error;
use crate::secret::{self, Naming};

const TEMP_SUFFIX: &str = ".tmp";

/// A usable plaintext path for a secret file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub path: PathBuf,
    /// The backend ran and wrote `path` during this call
    pub decrypted_now: bool,
    /// `path` existed before this call
    pub preexisting: bool,
}

impl Decrypted {
    /// Only files this call brought into existence are owed cleanup
    pub fn is_ephemeral(&self) -> bool {
        self.decrypted_now && !self.preexisting
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptOutcome {
    AlreadyEncrypted { source: PathBuf },
    InPlace,
    FromSibling { source: PathBuf },
}

#[derive(Debug, Default)]
pub struct CleanReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, io::Error)>,
}

pub struct Crypt<B> {
    backend: B,
    naming: Naming,
}

impl<B: EncryptionBackend> Crypt<B> {
    pub fn new(backend: B, naming: Naming) -> Self {
        Self { backend, naming }
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Produce a plaintext path for `secure`, decrypting only when needed.
    pub fn decrypt(&self, secure: &Path) -> Result<Decrypted, Error> {
        if !secret::is_encrypted(secure)? {
            debug!(path = %secure.display(), "not encrypted, using as-is");
            return Ok(Decrypted {
                path: secure.to_path_buf(),
                decrypted_now: false,
                preexisting: true,
            });
        }

        let target = self.naming.decrypted_path(secure);
        let preexisting = target.exists();
        if preexisting && secret::is_fresh(&target, secure)? {
            debug!(path = %target.display(), "decrypted sibling is up to date");
            return Ok(Decrypted {
                path: target,
                decrypted_now: false,
                preexisting,
            });
        }

        let plaintext = self.backend.decrypt(secure)?;
        write_atomic(&target, &plaintext).map_err(|e| Error::DecryptionFailed {
            path: secure.to_path_buf(),
            message: format!("writing {}: {}", target.display(), e),
        })?;
        debug!(path = %target.display(), preexisting, "wrote decrypted sibling");

        Ok(Decrypted {
            path: target,
            decrypted_now: true,
            preexisting,
        })
    }

    /// Re-encrypt `target` from its decrypted sibling, or in place.
    pub fn encrypt(&self, target: &Path) -> Result<EncryptOutcome, Error> {
        if let Some(canonical) = self.naming.canonical_path(target) {
            return Err(Error::InvalidTarget {
                path: target.to_path_buf(),
                canonical,
            });
        }
        if !self.naming.is_secret_name(target) {
            return Err(Error::NotASecret(target.to_path_buf()));
        }

        let sibling = self.naming.decrypted_path(target);
        let target_exists = target.exists();
        let sibling_exists = sibling.exists();
        if !target_exists && !sibling_exists {
            return Err(Error::FileNotFound(target.to_path_buf()));
        }

        let source = if sibling_exists && (!target_exists || secret::is_fresh(&sibling, target)?) {
            sibling
        } else {
            target.to_path_buf()
        };

        if secret::is_encrypted(&source)? {
            debug!(path = %source.display(), "already encrypted");
            return Ok(EncryptOutcome::AlreadyEncrypted { source });
        }

        let ciphertext = self.backend.encrypt(&source)?;
        write_atomic(target, &ciphertext).map_err(|e| Error::EncryptionFailed {
            path: target.to_path_buf(),
            message: e.to_string(),
        })?;

        if source == target {
            Ok(EncryptOutcome::InPlace)
        } else {
            Ok(EncryptOutcome::FromSibling { source })
        }
    }

    /// Plaintext content of `path` without touching the filesystem
    pub fn view(&self, path: &Path) -> Result<Vec<u8>, Error> {
        if secret::is_encrypted(path)? {
            self.backend.decrypt(path)
        } else {
            fs::read(path).map_err(|e| secret::not_found(path, e))
        }
    }
}

/// Remove every decrypted secret sibling under `dir`
pub fn clean(naming: &Naming, dir: &Path) -> Result<CleanReport, Error> {
    if !dir.exists() {
        return Err(Error::FileNotFound(dir.to_path_buf()));
    }

    let mut report = CleanReport::default();
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !entry.file_type().is_file() || !naming.is_decrypted_secret_name(path) {
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => report.removed.push(path.to_path_buf()),
            Err(e) => report.failed.push((path.to_path_buf(), e)),
        }
    }
    Ok(report)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// `secrets.dec.yaml` -> `.secrets.dec.yaml.`
fn temp_prefix(path: &Path) -> OsString {
    let mut prefix = OsString::from(".");
    if let Some(name) = path.file_name() {
        prefix.push(name);
    }
    prefix.push(".");
    prefix
}

/// Temporary files an interrupted `write_atomic` to `path` left behind
pub fn partial_writes(path: &Path) -> Vec<PathBuf> {
    let pattern = format!(
        "{}/{}*{}",
        Pattern::escape(&parent_dir(path).to_string_lossy()),
        Pattern::escape(&temp_prefix(path).to_string_lossy()),
        TEMP_SUFFIX
    );
    match glob::glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(_) => Vec::new(),
    }
}

/// Write `data` to a temporary file beside `path`, then rename it over `path`.
///
/// An existing file keeps its permissions; a new one gets the temp file's 0600.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = Builder::new()
        .prefix(&temp_prefix(path))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent_dir(path))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions())?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{BrokenBackend, FakeBackend};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    const PLAIN: &str = "db:\n  password: hunter2\n";

    fn naming() -> Naming {
        Naming::new(&["secrets*.yaml".to_string()], ".dec").unwrap()
    }

    fn crypt() -> Crypt<FakeBackend> {
        Crypt::new(FakeBackend::default(), naming())
    }

    fn write_secret(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, FakeBackend::seal(PLAIN)).unwrap();
        path
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn decrypt_creates_sibling() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let secure = write_secret(tmp.path(), "secrets.prod.yaml");
        let crypt = crypt();

        let dec = crypt.decrypt(&secure)?;

        assert_eq!(dec.path, tmp.path().join("secrets.prod.dec.yaml"));
        assert!(dec.decrypted_now);
        assert!(!dec.preexisting);
        assert!(dec.is_ephemeral());
        assert_eq!(fs::read_to_string(&dec.path)?, PLAIN);
        assert_eq!(crypt.backend().decrypts.get(), 1);
        Ok(())
    }

    #[test]
    fn decrypt_twice_reuses_fresh_sibling() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let secure = write_secret(tmp.path(), "secrets.prod.yaml");
        let crypt = crypt();

        let first = crypt.decrypt(&secure)?;
        let second = crypt.decrypt(&secure)?;

        assert_eq!(first.path, second.path);
        assert!(!second.decrypted_now);
        assert!(second.preexisting);
        assert!(!second.is_ephemeral());
        assert_eq!(fs::read_to_string(&second.path)?, PLAIN);
        assert_eq!(crypt.backend().decrypts.get(), 1);
        Ok(())
    }

    #[test]
    fn decrypt_keeps_sibling_edited_in_place() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let secure = write_secret(tmp.path(), "secrets.yaml");
        let sibling = tmp.path().join("secrets.dec.yaml");
        fs::write(&sibling, "db:\n  password: edited\n")?;
        set_mtime(&secure, SystemTime::now() - Duration::from_secs(60));

        let dec = crypt().decrypt(&secure)?;

        assert!(!dec.decrypted_now);
        assert_eq!(fs::read_to_string(&sibling)?, "db:\n  password: edited\n");
        Ok(())
    }

    #[test]
    fn decrypt_refreshes_stale_sibling_without_claiming_it() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let secure = write_secret(tmp.path(), "secrets.yaml");
        let sibling = tmp.path().join("secrets.dec.yaml");
        fs::write(&sibling, "stale: true\n")?;
        set_mtime(&secure, SystemTime::now() + Duration::from_secs(60));

        let dec = crypt().decrypt(&secure)?;

        assert!(dec.decrypted_now);
        assert!(dec.preexisting);
        assert!(!dec.is_ephemeral());
        assert_eq!(fs::read_to_string(&sibling)?, PLAIN);
        Ok(())
    }

    #[test]
    fn decrypt_plain_file_returns_it_unchanged() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let plain = tmp.path().join("secrets.yaml");
        fs::write(&plain, PLAIN)?;
        let crypt = crypt();

        let dec = crypt.decrypt(&plain)?;

        assert_eq!(dec.path, plain);
        assert!(!dec.decrypted_now);
        assert!(!tmp.path().join("secrets.dec.yaml").exists());
        assert_eq!(crypt.backend().decrypts.get(), 0);
        Ok(())
    }

    #[test]
    fn decrypt_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = crypt().decrypt(&tmp.path().join("secrets.yaml")).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn decrypt_failure_leaves_no_output() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let secure = write_secret(tmp.path(), "secrets.yaml");
        let crypt = Crypt::new(BrokenBackend, naming());

        let err = crypt.decrypt(&secure).unwrap_err();

        assert!(matches!(err, Error::DecryptionFailed { .. }));
        let entries: Vec<_> = fs::read_dir(tmp.path())?.collect();
        assert_eq!(entries.len(), 1);
        Ok(())
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let target = tmp.path().join("secrets.yaml");
        let content = "api:\n  token: \"a:b #c\"\n  list: [1, 2]\n";
        fs::write(&target, content)?;
        let crypt = crypt();

        assert_eq!(crypt.encrypt(&target)?, EncryptOutcome::InPlace);
        assert!(secret::is_encrypted(&target)?);

        let dec = crypt.decrypt(&target)?;
        assert_eq!(fs::read_to_string(dec.path)?, content);
        Ok(())
    }

    #[test]
    fn encrypt_prefers_fresh_sibling() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let target = write_secret(tmp.path(), "secrets.yaml");
        let sibling = tmp.path().join("secrets.dec.yaml");
        fs::write(&sibling, "db:\n  password: rotated\n")?;
        set_mtime(&target, SystemTime::now() - Duration::from_secs(60));
        let crypt = crypt();

        let outcome = crypt.encrypt(&target)?;

        assert_eq!(outcome, EncryptOutcome::FromSibling { source: sibling.clone() });
        assert_eq!(fs::read_to_string(&sibling)?, "db:\n  password: rotated\n");
        assert_eq!(crypt.view(&target)?, b"db:\n  password: rotated\n");
        Ok(())
    }

    #[test]
    fn encrypt_from_sibling_when_target_missing() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let sibling = tmp.path().join("secrets.dec.yaml");
        fs::write(&sibling, PLAIN)?;
        let target = tmp.path().join("secrets.yaml");

        let outcome = crypt().encrypt(&target)?;

        assert!(matches!(outcome, EncryptOutcome::FromSibling { .. }));
        assert!(secret::is_encrypted(&target)?);
        Ok(())
    }

    #[test]
    fn encrypt_already_encrypted_is_noop() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let target = write_secret(tmp.path(), "secrets.yaml");
        let before = fs::read_to_string(&target)?;
        let crypt = crypt();

        let outcome = crypt.encrypt(&target)?;

        assert_eq!(outcome, EncryptOutcome::AlreadyEncrypted { source: target.clone() });
        assert_eq!(fs::read_to_string(&target)?, before);
        assert_eq!(crypt.backend().encrypts.get(), 0);
        Ok(())
    }

    #[test]
    fn encrypt_rejects_decrypted_name() {
        let tmp = TempDir::new().unwrap();
        let dec = tmp.path().join("secrets.prod.dec.yaml");
        fs::write(&dec, PLAIN).unwrap();

        let err = crypt().encrypt(&dec).unwrap_err();

        match err {
            Error::InvalidTarget { path, canonical } => {
                assert_eq!(path, dec);
                assert_eq!(canonical, tmp.path().join("secrets.prod.yaml"));
            }
            other => panic!("expected InvalidTarget, got {other:?}"),
        }
    }

    #[test]
    fn encrypt_refuses_non_secret_files() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let chart = tmp.path().join("Chart.yaml");
        fs::write(&chart, "apiVersion: v2\nname: app\n")?;
        let crypt = crypt();

        let err = crypt.encrypt(&chart).unwrap_err();

        assert!(matches!(err, Error::NotASecret(ref p) if *p == chart));
        assert_eq!(fs::read_to_string(&chart)?, "apiVersion: v2\nname: app\n");
        assert_eq!(crypt.backend().encrypts.get(), 0);
        Ok(())
    }

    #[test]
    fn encrypt_missing_target_and_sibling() {
        let tmp = TempDir::new().unwrap();
        let err = crypt().encrypt(&tmp.path().join("secrets.yaml")).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn encrypt_failure_keeps_target() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let target = tmp.path().join("secrets.yaml");
        fs::write(&target, PLAIN)?;

        let err = Crypt::new(BrokenBackend, naming()).encrypt(&target).unwrap_err();

        assert!(matches!(err, Error::EncryptionFailed { .. }));
        assert_eq!(fs::read_to_string(&target)?, PLAIN);
        Ok(())
    }

    #[test]
    fn encrypt_keeps_target_permissions() -> Result<(), Error> {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new()?;
        let target = tmp.path().join("secrets.yaml");
        fs::write(&target, PLAIN)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o644))?;

        crypt().encrypt(&target)?;

        let mode = fs::metadata(&target)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        Ok(())
    }

    #[test]
    fn view_does_not_write_sibling() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let secure = write_secret(tmp.path(), "secrets.yaml");

        assert_eq!(crypt().view(&secure)?, PLAIN.as_bytes());
        assert!(!tmp.path().join("secrets.dec.yaml").exists());
        Ok(())
    }

    #[test]
    fn view_plain_file_reads_it_as_is() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let plain = tmp.path().join("secrets.yaml");
        fs::write(&plain, PLAIN)?;
        let crypt = crypt();

        assert_eq!(crypt.view(&plain)?, PLAIN.as_bytes());
        assert_eq!(crypt.backend().decrypts.get(), 0);
        assert!(!tmp.path().join("secrets.dec.yaml").exists());
        Ok(())
    }

    #[test]
    fn partial_writes_match_only_temp_files_for_target() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let target = tmp.path().join("secrets.dec.yaml");
        let leftover = tmp.path().join(".secrets.dec.yaml.a1B2c3.tmp");
        fs::write(&leftover, PLAIN)?;
        fs::write(tmp.path().join(".secrets.prod.dec.yaml.x9Y8z7.tmp"), PLAIN)?;
        fs::write(tmp.path().join("secrets.yaml"), PLAIN)?;

        assert_eq!(partial_writes(&target), vec![leftover]);
        Ok(())
    }

    #[test]
    fn successful_write_leaves_no_partial_files() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let secure = write_secret(tmp.path(), "secrets.yaml");

        let dec = crypt().decrypt(&secure)?;

        assert!(partial_writes(&dec.path).is_empty());
        assert_eq!(fs::read_dir(tmp.path())?.count(), 2);
        Ok(())
    }

    #[test]
    fn clean_removes_only_decrypted_secrets() -> Result<(), Error> {
        let tmp = TempDir::new()?;
        let nested = tmp.path().join("charts/app");
        fs::create_dir_all(&nested)?;
        fs::write(tmp.path().join("secrets.dec.yaml"), PLAIN)?;
        fs::write(nested.join("secrets.prod.dec.yaml"), PLAIN)?;
        fs::write(nested.join("secrets.prod.yaml"), PLAIN)?;
        fs::write(nested.join("values.dec.yaml"), PLAIN)?;

        let mut report = clean(&naming(), tmp.path())?;
        report.removed.sort();

        assert_eq!(
            report.removed,
            vec![
                nested.join("secrets.prod.dec.yaml"),
                tmp.path().join("secrets.dec.yaml"),
            ]
        );
        assert!(report.failed.is_empty());
        assert!(nested.join("secrets.prod.yaml").exists());
        assert!(nested.join("values.dec.yaml").exists());
        Ok(())
    }

    #[test]
    fn clean_missing_dir() {
        let err = clean(&naming(), Path::new("/nonexistent/charts")).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }
}
