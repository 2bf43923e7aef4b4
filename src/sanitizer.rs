//! Integrity scanning of an install tree against a manifest.
//!
//! The base scan is a size-only pass over the filesystem; the patch scan walks
//! the patch manifest and also checks fingerprints. Neither deletes anything:
//! files the manifest does not know about are left alone.

use glob::Pattern;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::hashing::FingerprintVerifier;
use crate::manifest::{BaseManifest, PatchEntry, PatchManifest};
use crate::progress::{ProgressSender, ScanProgress};
use crate::utils::{file_name_of, local_path, manifest_key, normalize_relative};

/// Relative paths that need repair. Missing files count as mismatched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizationReport {
    pub mismatched_files: BTreeSet<String>,
}

impl SanitizationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched_files.is_empty()
    }

    pub fn contains(&self, relative: &str) -> bool {
        self.mismatched_files.contains(&normalize_relative(relative))
    }

    fn flag(&mut self, relative: &str) {
        self.mismatched_files.insert(normalize_relative(relative));
    }
}

/// Local state of one patch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Satisfied,
    Missing,
    SizeMismatch { actual: u64 },
    FingerprintMismatch,
    /// A `delete` entry whose file is still present.
    PendingDelete,
}

impl EntryState {
    pub fn needs_action(&self) -> bool {
        *self != EntryState::Satisfied
    }
}

/// Checks one patch entry against the install tree.
///
/// The fingerprint is only consulted when the size already matches.
pub async fn check_entry(
    install_path: &Path,
    entry: &PatchEntry,
    verifier: &Arc<dyn FingerprintVerifier>,
) -> Result<EntryState, ScanError> {
    let path = local_path(install_path, &entry.relative_path).ok_or_else(|| ScanError::InvalidPath {
        relative: entry.relative_path.clone(),
    })?;

    let size = match fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        Ok(_) => None,
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(ScanError::Io { path, source: e }),
    };

    if entry.is_delete() {
        return Ok(if size.is_some() {
            EntryState::PendingDelete
        } else {
            EntryState::Satisfied
        });
    }

    let Some(actual) = size else {
        return Ok(EntryState::Missing);
    };
    if actual != entry.size {
        return Ok(EntryState::SizeMismatch { actual });
    }

    if !entry.fingerprint.is_empty() {
        let verifier = verifier.clone();
        let expected = entry.fingerprint.clone();
        let matches = tokio::task::spawn_blocking(move || verifier.verify(&path, &expected))
            .await
            .unwrap_or(false);
        if !matches {
            return Ok(EntryState::FingerprintMismatch);
        }
    }

    Ok(EntryState::Satisfied)
}

/// Files and directories the scanners never look at.
#[derive(Debug, Clone)]
pub struct Exclusions {
    reserved_files: HashSet<String>,
    reserved_patterns: Vec<Pattern>,
    user_data_dirs: HashSet<String>,
}

impl Exclusions {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            reserved_files: config.reserved_files.iter().map(|f| f.to_lowercase()).collect(),
            reserved_patterns: config
                .reserved_patterns
                .iter()
                .filter_map(|p| match Pattern::new(p) {
                    Ok(pattern) => Some(pattern),
                    Err(e) => {
                        warn!(pattern = %p, error = %e, "ignoring invalid exclusion pattern");
                        None
                    }
                })
                .collect(),
            user_data_dirs: config.user_data_dirs.iter().map(|d| d.to_lowercase()).collect(),
        }
    }

    pub fn is_user_data_dir(&self, name: &str) -> bool {
        self.user_data_dirs.contains(&name.to_lowercase())
    }

    pub fn is_reserved_file(&self, name: &str) -> bool {
        self.reserved_files.contains(&name.to_lowercase())
            || self.reserved_patterns.iter().any(|p| p.matches(name))
    }
}

#[derive(Debug, Clone)]
pub struct WalkedFile {
    pub relative_path: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Lists regular files under `root`, pruning user-data directories.
pub fn walk_install(root: &Path, exclusions: &Exclusions) -> Result<Vec<WalkedFile>, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::InstallPathUnreadable {
            path: root.to_path_buf(),
        });
    }

    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        e.depth() == 0
            || !(e.file_type().is_dir() && exclusions.is_user_data_dir(&e.file_name().to_string_lossy()))
    });

    let mut files = vec![];
    for entry in walker {
        let entry = entry.map_err(|e| ScanError::Io {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if exclusions.is_reserved_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(rel) => normalize_relative(&rel.to_string_lossy()),
            Err(_) => continue,
        };
        let size = entry
            .metadata()
            .map_err(|e| ScanError::Io {
                path: entry.path().to_path_buf(),
                source: e.into(),
            })?
            .len();
        files.push(WalkedFile {
            relative_path: relative,
            path: entry.into_path(),
            size,
        });
    }
    Ok(files)
}

pub struct IntegrityScanner {
    verifier: Arc<dyn FingerprintVerifier>,
    config: ScanConfig,
}

impl IntegrityScanner {
    pub fn new(verifier: Arc<dyn FingerprintVerifier>, config: ScanConfig) -> Self {
        Self { verifier, config }
    }

    /// Size-only check of the install tree against the base manifest.
    pub async fn scan_base(
        &self,
        install_path: &Path,
        manifest: &BaseManifest,
        progress: &ProgressSender<ScanProgress>,
    ) -> Result<SanitizationReport, ScanError> {
        let install_path = install_path.to_path_buf();
        let manifest = manifest.clone();
        let exclusions = Exclusions::new(&self.config);
        let report_every = self.config.report_every.max(1);
        let progress = progress.clone();

        tokio::task::spawn_blocking(move || {
            scan_base_blocking(&install_path, &manifest, &exclusions, report_every, &progress)
        })
        .await
        .map_err(|e| ScanError::Io {
            path: PathBuf::new(),
            source: io::Error::new(io::ErrorKind::Other, e),
        })?
    }

    /// Walks the patch manifest and reports every entry that still needs work.
    pub async fn scan_patches(
        &self,
        install_path: &Path,
        manifest: &PatchManifest,
        progress: &ProgressSender<ScanProgress>,
    ) -> Result<SanitizationReport, ScanError> {
        let mut report = SanitizationReport::default();
        let total = manifest.patches.len();
        let report_every = self.config.report_every.max(1);

        for (index, entry) in manifest.patches.iter().enumerate() {
            let processed = index + 1;
            if processed % report_every == 0 || processed == total {
                progress.report(ScanProgress {
                    processed_count: processed,
                    total_count: total,
                    current_name: entry.display_name(),
                });
            }

            let state = check_entry(install_path, entry, &self.verifier).await?;
            if state.needs_action() {
                debug!(path = %entry.relative_path, ?state, "patch entry needs action");
                report.flag(&entry.relative_path);
            }
        }

        info!(checked = total, mismatched = report.mismatched_files.len(), "patch scan finished");
        Ok(report)
    }
}

fn scan_base_blocking(
    install_path: &Path,
    manifest: &BaseManifest,
    exclusions: &Exclusions,
    report_every: usize,
    progress: &ProgressSender<ScanProgress>,
) -> Result<SanitizationReport, ScanError> {
    let mut lookup = HashMap::with_capacity(manifest.files.len());
    for entry in &manifest.files {
        lookup.entry(manifest_key(&entry.relative_path)).or_insert(entry);
    }

    let files = walk_install(install_path, exclusions)?;
    let total = files.len();
    let mut seen = HashSet::with_capacity(total);
    let mut report = SanitizationReport::default();

    for (index, file) in files.iter().enumerate() {
        let processed = index + 1;
        if processed % report_every == 0 {
            progress.report(ScanProgress {
                processed_count: processed,
                total_count: total,
                current_name: file_name_of(&file.relative_path),
            });
        }

        let key = manifest_key(&file.relative_path);
        match lookup.get(&key) {
            Some(entry) => {
                if file.size != entry.size {
                    debug!(path = %file.relative_path, expected = entry.size, actual = file.size, "size mismatch");
                    report.flag(&entry.relative_path);
                }
                seen.insert(key);
            }
            None => leave_unlisted(&file.relative_path),
        }
    }
    progress.report(ScanProgress {
        processed_count: total,
        total_count: total,
        current_name: String::new(),
    });

    for entry in &manifest.files {
        if seen.contains(&manifest_key(&entry.relative_path)) {
            continue;
        }
        match local_path(install_path, &entry.relative_path) {
            Some(path) if path.is_file() => {}
            Some(_) => {
                debug!(path = %entry.relative_path, "missing file");
                report.flag(&entry.relative_path);
            }
            None => warn!(path = %entry.relative_path, "skipping manifest entry outside the install"),
        }
    }

    info!(scanned = total, mismatched = report.mismatched_files.len(), "base scan finished");
    Ok(report)
}

/// Files missing from the manifest are never touched, including stray
/// archives in `Data/`.
fn leave_unlisted(relative: &str) {
    let key = manifest_key(relative);
    if key.starts_with("data/") && key.ends_with(".mpq") {
        debug!(path = %relative, "unlisted archive left in place");
    }
}
