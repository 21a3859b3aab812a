//! Read-only access to a workflow's state files.
//!
//! A scope is either a plain directory or a zip archive (path ending in
//! `.zip`, case-insensitive). Zip archives must be *flat* (all files at
//! the root) or *single-folder* (exactly one top-level directory holding
//! every file); anything else is rejected at open time. A zip whose
//! filename embeds exactly one 64-character hex run is hash-anchored: the
//! run is the expected SHA-256 of the archive bytes.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use zip::ZipArchive;

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("scope not found: {}", .0.display())]
    ScopeNotFound(PathBuf),
    #[error("state file '{0}' not found in scope")]
    FileNotFound(String),
    #[error("invalid zip layout: {0}")]
    ZipLayout(String),
    #[error("archive hash mismatch: filename says {expected}, content is {actual}")]
    ZipHashMismatch { expected: String, actual: String },
    #[error("ambiguous hash in zip filename: {0}")]
    ZipFilenameAmbiguous(String),
    #[error("scope i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<zip::result::ZipError> for ScopeError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => ScopeError::Io(io),
            other => ScopeError::ZipLayout(format!("corrupt or unreadable zip archive: {other}")),
        }
    }
}

/// A state file resolved to a real filesystem path.
///
/// For zip scopes this is a temp extraction; the file is deleted when the
/// value is dropped. Directory scopes hand out the real path.
#[derive(Debug)]
pub struct Materialized {
    path: PathBuf,
    _temp: Option<NamedTempFile>,
}

impl Materialized {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A read-only content source holding a workflow's state files.
#[derive(Debug)]
pub enum Scope {
    Dir(PathBuf),
    Zip(ZipScope),
}

impl Scope {
    /// Open a scope, validating zip layout and hash anchor up front.
    pub fn open(path: &Path) -> Result<Self, ScopeError> {
        if is_zip_scope(path) {
            Ok(Scope::Zip(ZipScope::open(path)?))
        } else if path.is_dir() {
            Ok(Scope::Dir(path.to_path_buf()))
        } else {
            Err(ScopeError::ScopeNotFound(path.to_path_buf()))
        }
    }

    /// Whether the named state file exists in this scope.
    pub fn exists(&self, name: &str) -> bool {
        match self {
            Scope::Dir(root) => root.join(name).is_file(),
            Scope::Zip(zip) => zip.names.contains(name),
        }
    }

    /// Bare filenames of every state file in the scope.
    pub fn list(&self) -> Result<BTreeSet<String>, ScopeError> {
        match self {
            Scope::Dir(root) => {
                let mut names = BTreeSet::new();
                for entry in std::fs::read_dir(root)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file()
                        && let Some(name) = entry.file_name().to_str()
                    {
                        names.insert(name.to_string());
                    }
                }
                Ok(names)
            }
            Scope::Zip(zip) => Ok(zip.names.clone()),
        }
    }

    /// Read a state file as UTF-8 text.
    pub fn read(&self, name: &str) -> Result<String, ScopeError> {
        match self {
            Scope::Dir(root) => {
                let path = root.join(name);
                if !path.is_file() {
                    return Err(ScopeError::FileNotFound(name.to_string()));
                }
                Ok(std::fs::read_to_string(path)?)
            }
            Scope::Zip(zip) => {
                let bytes = zip.read_bytes(name)?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }

    /// Resolve a state file to a path on disk, for scripts that must
    /// actually live there.
    pub fn materialize(&self, name: &str) -> Result<Materialized, ScopeError> {
        match self {
            Scope::Dir(root) => {
                let path = root.join(name);
                if !path.is_file() {
                    return Err(ScopeError::FileNotFound(name.to_string()));
                }
                Ok(Materialized {
                    path,
                    _temp: None,
                })
            }
            Scope::Zip(zip) => {
                let bytes = zip.read_bytes(name)?;
                let suffix = Path::new(name)
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy()))
                    .unwrap_or_default();
                let mut temp = tempfile::Builder::new()
                    .prefix("waymark-")
                    .suffix(&suffix)
                    .tempfile()?;
                temp.write_all(&bytes)?;
                temp.flush()?;
                Ok(Materialized {
                    path: temp.path().to_path_buf(),
                    _temp: Some(temp),
                })
            }
        }
    }

    /// Display form of the scope location.
    pub fn location(&self) -> String {
        match self {
            Scope::Dir(root) => root.display().to_string(),
            Scope::Zip(zip) => zip.path.display().to_string(),
        }
    }
}

/// Whether the path refers to a zip archive. Suffix check only, no
/// filesystem access.
pub fn is_zip_scope(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

/// A validated zip-archive scope.
#[derive(Debug)]
pub struct ZipScope {
    path: PathBuf,
    /// `""` for flat archives, `"folder/"` for single-folder archives.
    prefix: String,
    names: BTreeSet<String>,
}

impl ZipScope {
    fn open(path: &Path) -> Result<Self, ScopeError> {
        if !path.is_file() {
            return Err(ScopeError::ScopeNotFound(path.to_path_buf()));
        }

        verify_hash_anchor(path)?;

        let file = File::open(path)?;
        let archive = ZipArchive::new(file)?;
        let entries: Vec<String> = archive
            .file_names()
            .filter(|n| !n.ends_with('/'))
            .map(str::to_string)
            .collect();

        let prefix = detect_layout(&entries, path)?;
        let names = entries
            .iter()
            .filter_map(|n| n.strip_prefix(&prefix))
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();

        Ok(ZipScope {
            path: path.to_path_buf(),
            prefix,
            names,
        })
    }

    fn read_bytes(&self, name: &str) -> Result<Vec<u8>, ScopeError> {
        if !self.names.contains(name) {
            return Err(ScopeError::FileNotFound(name.to_string()));
        }
        let file = File::open(&self.path)?;
        let mut archive = ZipArchive::new(file)?;
        let full_name = format!("{}{name}", self.prefix);
        let mut entry = match archive.by_name(&full_name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(ScopeError::FileNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Detect the archive layout, returning the effective entry prefix.
///
/// Flat (all files at root) returns `""`; single-folder returns
/// `"folder/"`. Every other shape is a layout error.
fn detect_layout(file_names: &[String], path: &Path) -> Result<String, ScopeError> {
    if file_names.is_empty() {
        return Err(ScopeError::ZipLayout(format!(
            "empty zip archive (no files): {}",
            path.display()
        )));
    }

    let root_files: Vec<&String> = file_names.iter().filter(|n| !n.contains('/')).collect();
    if root_files.len() == file_names.len() {
        return Ok(String::new());
    }

    if !root_files.is_empty() {
        return Err(ScopeError::ZipLayout(format!(
            "mix of top-level files and subdirectories at root of {}",
            path.display()
        )));
    }

    let top_level: BTreeSet<&str> = file_names
        .iter()
        .filter_map(|n| n.split('/').next())
        .collect();
    if top_level.len() > 1 {
        let folders: Vec<&str> = top_level.into_iter().collect();
        return Err(ScopeError::ZipLayout(format!(
            "multiple top-level folders in {}: {}",
            path.display(),
            folders.join(", ")
        )));
    }

    if let Some(deep) = file_names.iter().find(|n| n.split('/').count() > 2) {
        return Err(ScopeError::ZipLayout(format!(
            "files nested more than one level deep in {} (e.g. '{deep}')",
            path.display()
        )));
    }

    let folder = top_level.into_iter().next().unwrap_or_default();
    Ok(format!("{folder}/"))
}

/// Verify the archive against a hash anchor embedded in its filename, if any.
fn verify_hash_anchor(path: &Path) -> Result<(), ScopeError> {
    let basename = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let Some(expected) = extract_hash_from_filename(basename)? else {
        return Ok(());
    };

    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    let actual = format!("{:x}", hasher.finalize());

    if actual == expected {
        Ok(())
    } else {
        Err(ScopeError::ZipHashMismatch {
            expected,
            actual,
        })
    }
}

/// Extract a SHA-256 hash from a filename, if unambiguously present.
///
/// Scans for maximal contiguous hex runs (case-insensitive; returned
/// lowercase). Exactly one 64-character run is the hash; none means the
/// filename is not hash-anchored; a run longer than 64 or two 64-character
/// runs is ambiguous.
pub fn extract_hash_from_filename(basename: &str) -> Result<Option<String>, ScopeError> {
    let lower = basename.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let is_hex = |b: u8| matches!(b, b'0'..=b'9' | b'a'..=b'f');

    let mut runs: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if is_hex(bytes[i]) {
            let start = i;
            while i < bytes.len() && is_hex(bytes[i]) {
                i += 1;
            }
            runs.push(&lower[start..i]);
        } else {
            i += 1;
        }
    }

    if runs.iter().any(|r| r.len() > 64) {
        return Err(ScopeError::ZipFilenameAmbiguous(format!(
            "'{basename}' contains a hex run longer than 64 characters"
        )));
    }

    let mut hits = runs.into_iter().filter(|r| r.len() == 64);
    match (hits.next(), hits.next()) {
        (Some(hash), None) => Ok(Some(hash.to_string())),
        (Some(_), Some(_)) => Err(ScopeError::ZipFilenameAmbiguous(format!(
            "'{basename}' contains multiple 64-character hex runs"
        ))),
        _ => Ok(None),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write as _;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, body) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn sha256_hex(path: &Path) -> String {
        let mut hasher = Sha256::new();
        let mut file = File::open(path).unwrap();
        std::io::copy(&mut file, &mut hasher).unwrap();
        format!("{:x}", hasher.finalize())
    }

    // ── Directory scope ─────────────────────────────────────────────────

    #[test]
    fn dir_scope_lists_reads_and_checks() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("START.md"), "go\n").unwrap();
        fs::write(dir.path().join("CHECK.sh"), "echo hi\n").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let scope = Scope::open(dir.path()).unwrap();
        let names = scope.list().unwrap();
        assert_eq!(
            names,
            BTreeSet::from(["START.md".to_string(), "CHECK.sh".to_string()])
        );
        assert!(scope.exists("START.md"));
        assert!(!scope.exists("MISSING.md"));
        assert_eq!(scope.read("START.md").unwrap(), "go\n");
    }

    #[test]
    fn dir_scope_materialize_is_the_real_path() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("CHECK.sh"), "echo hi\n").unwrap();
        let scope = Scope::open(dir.path()).unwrap();
        let materialized = scope.materialize("CHECK.sh").unwrap();
        assert_eq!(materialized.path(), dir.path().join("CHECK.sh"));
    }

    #[test]
    fn missing_scope_rejected() {
        let err = Scope::open(Path::new("/nonexistent/scope")).unwrap_err();
        assert!(matches!(err, ScopeError::ScopeNotFound(_)));
    }

    #[test]
    fn read_missing_file() {
        let dir = TempDir::new().unwrap();
        let scope = Scope::open(dir.path()).unwrap();
        let err = scope.read("MISSING.md").unwrap_err();
        assert!(matches!(err, ScopeError::FileNotFound(name) if name == "MISSING.md"));
    }

    // ── Zip scope ───────────────────────────────────────────────────────

    #[test]
    fn flat_zip_layout() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("wf.zip");
        write_zip(&zip_path, &[("START.md", "a"), ("END.md", "b")]);

        let scope = Scope::open(&zip_path).unwrap();
        let names = scope.list().unwrap();
        assert_eq!(
            names,
            BTreeSet::from(["START.md".to_string(), "END.md".to_string()])
        );
        assert_eq!(scope.read("START.md").unwrap(), "a");
    }

    #[test]
    fn single_folder_zip_strips_prefix() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("wf.zip");
        write_zip(
            &zip_path,
            &[("workflow/START.md", "a"), ("workflow/END.md", "b")],
        );

        let scope = Scope::open(&zip_path).unwrap();
        assert!(scope.exists("START.md"));
        assert!(!scope.exists("workflow/START.md"));
        assert_eq!(scope.read("END.md").unwrap(), "b");
    }

    #[test]
    fn mixed_root_rejected() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("wf.zip");
        write_zip(&zip_path, &[("START.md", "a"), ("folder/END.md", "b")]);
        let err = Scope::open(&zip_path).unwrap_err();
        assert!(matches!(err, ScopeError::ZipLayout(msg) if msg.contains("mix")));
    }

    #[test]
    fn multiple_top_level_folders_rejected() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("wf.zip");
        write_zip(&zip_path, &[("one/A.md", "a"), ("two/B.md", "b")]);
        let err = Scope::open(&zip_path).unwrap_err();
        assert!(matches!(err, ScopeError::ZipLayout(msg) if msg.contains("multiple")));
    }

    #[test]
    fn deep_nesting_rejected() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("wf.zip");
        write_zip(&zip_path, &[("folder/inner/A.md", "a")]);
        let err = Scope::open(&zip_path).unwrap_err();
        assert!(matches!(err, ScopeError::ZipLayout(msg) if msg.contains("nested")));
    }

    #[test]
    fn empty_zip_rejected() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("wf.zip");
        write_zip(&zip_path, &[]);
        let err = Scope::open(&zip_path).unwrap_err();
        assert!(matches!(err, ScopeError::ZipLayout(msg) if msg.contains("empty")));
    }

    #[test]
    fn corrupt_zip_rejected() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("wf.zip");
        fs::write(&zip_path, b"this is not a zip archive").unwrap();
        let err = Scope::open(&zip_path).unwrap_err();
        assert!(matches!(err, ScopeError::ZipLayout(_)));
    }

    #[test]
    fn zip_materialize_extracts_with_matching_suffix() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("wf.zip");
        write_zip(&zip_path, &[("CHECK.sh", "echo hi\n")]);

        let scope = Scope::open(&zip_path).unwrap();
        let temp_path;
        {
            let materialized = scope.materialize("CHECK.sh").unwrap();
            temp_path = materialized.path().to_path_buf();
            assert!(temp_path.exists());
            assert!(temp_path.to_string_lossy().ends_with(".sh"));
            assert_eq!(fs::read_to_string(&temp_path).unwrap(), "echo hi\n");
        }
        // Dropping the handle deletes the extraction.
        assert!(!temp_path.exists());
    }

    // ── Hash anchor ─────────────────────────────────────────────────────

    #[test]
    fn hash_anchor_verifies() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging.zip");
        write_zip(&staging, &[("workflow/START.md", "a")]);
        let hash = sha256_hex(&staging);

        let anchored = dir.path().join(format!("wf-{hash}.zip"));
        fs::rename(&staging, &anchored).unwrap();
        assert!(Scope::open(&anchored).is_ok());
    }

    #[test]
    fn hash_anchor_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let wrong = "0".repeat(64);
        let zip_path = dir.path().join(format!("wf-{wrong}.zip"));
        write_zip(&zip_path, &[("START.md", "a")]);
        let err = Scope::open(&zip_path).unwrap_err();
        assert!(matches!(err, ScopeError::ZipHashMismatch { .. }));
    }

    #[test]
    fn extract_hash_single_run() {
        let hash = "a".repeat(64);
        let found = extract_hash_from_filename(&format!("wf-{hash}.zip")).unwrap();
        assert_eq!(found, Some(hash));
    }

    #[test]
    fn extract_hash_lowercases() {
        let hash = "A1".repeat(32);
        let found = extract_hash_from_filename(&format!("wf-{hash}.zip")).unwrap();
        assert_eq!(found, Some(hash.to_ascii_lowercase()));
    }

    #[test]
    fn extract_hash_none_when_absent() {
        assert_eq!(extract_hash_from_filename("workflow.zip").unwrap(), None);
        // 63 hex chars is not a hash
        let short = "a".repeat(63);
        assert_eq!(
            extract_hash_from_filename(&format!("wf-{short}.zip")).unwrap(),
            None
        );
    }

    #[test]
    fn extract_hash_run_too_long_is_ambiguous() {
        let long = "a".repeat(65);
        let err = extract_hash_from_filename(&format!("wf-{long}.zip")).unwrap_err();
        assert!(matches!(err, ScopeError::ZipFilenameAmbiguous(_)));
    }

    #[test]
    fn extract_hash_two_runs_is_ambiguous() {
        let one = "a".repeat(64);
        let two = "b".repeat(64);
        let err = extract_hash_from_filename(&format!("{one}-{two}.zip")).unwrap_err();
        assert!(matches!(err, ScopeError::ZipFilenameAmbiguous(_)));
    }

    #[test]
    fn zip_detection_is_suffix_only() {
        assert!(is_zip_scope(Path::new("archive.zip")));
        assert!(is_zip_scope(Path::new("archive.ZIP")));
        assert!(!is_zip_scope(Path::new("archive.tar.gz")));
        assert!(!is_zip_scope(Path::new("workflows/test")));
    }
}
