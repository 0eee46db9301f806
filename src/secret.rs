// Secret files - naming rules, encryption detection and freshness

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::Pattern;

use crate::error::Error;

/// Naming conventions for secret files and their decrypted siblings
#[derive(Debug, Clone)]
pub struct Naming {
    patterns: Vec<Pattern>,
    decrypted_patterns: Vec<Pattern>,
    suffix: String,
}

impl Naming {
    pub fn new(patterns: &[String], suffix: &str) -> Result<Self, Error> {
        if suffix.is_empty() {
            return Err(Error::ConfigParse(
                "decrypted suffix must not be empty".to_string(),
            ));
        }

        let compile = |p: &str| {
            Pattern::new(p).map_err(|e| Error::ConfigParse(format!("pattern '{}': {}", p, e)))
        };

        let mut compiled = Vec::with_capacity(patterns.len());
        let mut decrypted = Vec::with_capacity(patterns.len());
        for p in patterns {
            compiled.push(compile(p)?);
            let dec = insert_suffix(Path::new(p), &Pattern::escape(suffix));
            decrypted.push(compile(&dec.to_string_lossy())?);
        }

        Ok(Self {
            patterns: compiled,
            decrypted_patterns: decrypted,
            suffix: suffix.to_string(),
        })
    }

    /// True if the file name matches one of the secret patterns
    pub fn is_secret_name(&self, path: &Path) -> bool {
        file_name(path).is_some_and(|name| self.patterns.iter().any(|p| p.matches(&name)))
    }

    /// True if the file name matches a secret pattern with the decrypted suffix applied
    pub fn is_decrypted_secret_name(&self, path: &Path) -> bool {
        file_name(path)
            .is_some_and(|name| self.decrypted_patterns.iter().any(|p| p.matches(&name)))
    }

    /// `secrets.prod.yaml` -> `secrets.prod.dec.yaml`
    pub fn decrypted_path(&self, path: &Path) -> PathBuf {
        insert_suffix(path, &self.suffix)
    }

    /// `secrets.prod.dec.yaml` -> `secrets.prod.yaml`, None if the name has no decrypted suffix
    pub fn canonical_path(&self, path: &Path) -> Option<PathBuf> {
        let name = file_name(path)?;
        let with_ext = path.extension().zip(path.file_stem()).and_then(|(ext, stem)| {
            let stem = stem.to_string_lossy();
            let base = stem.strip_suffix(&self.suffix).filter(|b| !b.is_empty())?;
            Some(format!("{}.{}", base, ext.to_string_lossy()))
        });
        let canonical = match with_ext {
            Some(c) => c,
            None => name
                .strip_suffix(&self.suffix)
                .filter(|b| !b.is_empty())?
                .to_string(),
        };
        Some(path.with_file_name(canonical))
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

fn insert_suffix(path: &Path, suffix: &str) -> PathBuf {
    let (Some(stem), Some(ext)) = (path.file_stem(), path.extension()) else {
        let mut name = path.file_name().map(OsString::from).unwrap_or_default();
        name.push(suffix);
        return path.with_file_name(name);
    };

    let mut name = OsString::from(stem);
    name.push(suffix);
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

/// Check whether a file on disk carries sops metadata.
///
/// Fails with `FileNotFound` if the path does not exist. Reads only.
pub fn is_encrypted(path: &Path) -> Result<bool, Error> {
    let bytes = std::fs::read(path).map_err(|e| not_found(path, e))?;
    Ok(std::str::from_utf8(&bytes).is_ok_and(has_sops_metadata))
}

/// A document is encrypted when it is a mapping with a top-level `sops`
/// mapping holding a `version` key.
pub fn has_sops_metadata(content: &str) -> bool {
    if let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(content) {
        if doc.get("sops").and_then(|s| s.get("version")).is_some() {
            return true;
        }
    }

    if let Ok(doc) = serde_json::from_str::<serde_json::Value>(content) {
        if doc.get("sops").and_then(|s| s.get("version")).is_some() {
            return true;
        }
    }

    false
}

/// True if `candidate` exists and was modified no earlier than `source`
pub fn is_fresh(candidate: &Path, source: &Path) -> Result<bool, Error> {
    let candidate_time = match modified(candidate) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let source_time = modified(source).map_err(|e| not_found(source, e))?;
    Ok(candidate_time >= source_time)
}

fn modified(path: &Path) -> io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

/// Map a NotFound io error onto `Error::FileNotFound` for `path`
pub fn not_found(path: &Path, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::FileNotFound(path.to_path_buf())
    } else {
        Error::Io(e)
    }
}
