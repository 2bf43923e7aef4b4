use anyhow::{bail, Context, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::hashing::compute_fingerprint;
use crate::sanitizer::{walk_install, Exclusions};
use crate::utils::file_name_of;

pub const BASE_MANIFEST_FILE: &str = "base_manifest.json";
pub const PATCH_MANIFEST_FILE: &str = "patch_manifest.json";

/// Default selection of patch archives inside a client tree.
pub const DEFAULT_PATCH_PATTERN: &str = "Data/*/patch-*.mpq";

/// Patch versions count hours since 2024-01-01T00:00:00Z.
const PATCH_VERSION_EPOCH: i64 = 1_704_067_200;

/// Every file a complete client contains, with its size.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BaseManifest {
    #[serde(default, alias = "Files")]
    pub files: Vec<BaseManifestEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BaseManifestEntry {
    #[serde(alias = "RelativePath")]
    pub relative_path: String,
    #[serde(alias = "Size")]
    pub size: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchManifest {
    #[serde(default, alias = "Version")]
    pub version: i64,
    #[serde(default, alias = "BaseUrl")]
    pub base_url: String,
    #[serde(default, alias = "Patches")]
    pub patches: Vec<PatchEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchEntry {
    #[serde(alias = "RelativePath")]
    pub relative_path: String,
    #[serde(default, alias = "Action")]
    pub action: PatchAction,
    #[serde(default, alias = "Size")]
    pub size: u64,
    #[serde(default, alias = "Fingerprint")]
    pub fingerprint: String,
    #[serde(default, alias = "DownloadName")]
    pub download_name: String,
    #[serde(default, alias = "MD5", skip_serializing_if = "String::is_empty")]
    pub md5: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PatchAction {
    #[default]
    #[serde(alias = "Add")]
    Add,
    #[serde(alias = "Replace")]
    Replace,
    #[serde(alias = "Delete")]
    Delete,
}

impl PatchEntry {
    pub fn is_delete(&self) -> bool {
        self.action == PatchAction::Delete
    }

    /// Name shown in progress output.
    pub fn display_name(&self) -> String {
        if self.download_name.is_empty() {
            file_name_of(&self.relative_path)
        } else {
            self.download_name.clone()
        }
    }
}

pub async fn load_base_manifest(path: &Path) -> Result<BaseManifest> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read base manifest {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid base manifest {:?}", path))
}

/// Loads a patch manifest from an `http(s)` URL or a local path.
pub async fn load_patch_manifest(client: &reqwest::Client, source: &str) -> Result<PatchManifest> {
    let body = if source.starts_with("http://") || source.starts_with("https://") {
        let resp = client
            .get(source)
            .send()
            .await
            .with_context(|| format!("Failed to request patch manifest {}", source))?;
        if !resp.status().is_success() {
            bail!("Patch manifest request failed with status {}", resp.status());
        }
        resp.text().await.context("Failed to read patch manifest response")?
    } else {
        fs::read_to_string(source)
            .await
            .with_context(|| format!("Failed to read patch manifest {}", source))?
    };

    let manifest: PatchManifest =
        serde_json::from_str(&body).with_context(|| format!("Invalid patch manifest {}", source))?;
    debug!(source, entries = manifest.patches.len(), "loaded patch manifest");
    Ok(manifest)
}

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub base_url: String,
    pub patch_pattern: String,
    pub scan: ScanConfig,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            patch_pattern: DEFAULT_PATCH_PATTERN.to_string(),
            scan: ScanConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedManifests {
    pub base: BaseManifest,
    pub patches: PatchManifest,
}

/// Builds both manifests from a reference client directory.
///
/// Every file lands in the base manifest; files matching the patch pattern are
/// also fingerprinted into the patch manifest.
pub async fn generate_manifests(client_dir: &Path, options: &GeneratorOptions) -> Result<GeneratedManifests> {
    let pattern = Pattern::new(&options.patch_pattern)
        .with_context(|| format!("Invalid patch pattern {}", options.patch_pattern))?;
    let match_options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let exclusions = Exclusions::new(&options.scan);
    let root = client_dir.to_path_buf();
    let mut files = tokio::task::spawn_blocking(move || walk_install(&root, &exclusions))
        .await
        .context("Directory walk panicked")??;
    files.retain(|f| !file_name_of(&f.relative_path).starts_with('.'));
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let base = BaseManifest {
        files: files
            .iter()
            .map(|f| BaseManifestEntry {
                relative_path: f.relative_path.clone(),
                size: f.size,
            })
            .collect(),
    };

    let semaphore = Arc::new(Semaphore::new(num_cpus::get().max(1)));
    let mut handles = vec![];
    for file in files
        .into_iter()
        .filter(|f| pattern.matches_with(&f.relative_path, match_options))
    {
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await?;
            let path: PathBuf = file.path.clone();
            let fingerprint = tokio::task::spawn_blocking(move || compute_fingerprint(&path)).await??;
            debug!(path = %file.relative_path, "fingerprinted patch file");
            Ok::<PatchEntry, anyhow::Error>(PatchEntry {
                download_name: file_name_of(&file.relative_path),
                relative_path: file.relative_path,
                action: PatchAction::Add,
                size: file.size,
                fingerprint,
                md5: String::new(),
            })
        }));
    }

    let mut patches = Vec::with_capacity(handles.len());
    for handle in handles {
        patches.push(handle.await??);
    }

    let manifests = GeneratedManifests {
        base,
        patches: PatchManifest {
            version: patch_version_now(),
            base_url: options.base_url.clone(),
            patches,
        },
    };
    info!(
        files = manifests.base.files.len(),
        patches = manifests.patches.patches.len(),
        "generated manifests"
    );
    Ok(manifests)
}

pub fn patch_version_now() -> i64 {
    (chrono::Utc::now().timestamp() - PATCH_VERSION_EPOCH) / 3600
}

pub async fn write_manifests(manifests: &GeneratedManifests, out_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("Failed to create {:?}", out_dir))?;
    let base_path = out_dir.join(BASE_MANIFEST_FILE);
    let patch_path = out_dir.join(PATCH_MANIFEST_FILE);
    fs::write(&base_path, serde_json::to_string_pretty(&manifests.base)?)
        .await
        .context("Failed to write base manifest")?;
    fs::write(&patch_path, serde_json::to_string_pretty(&manifests.patches)?)
        .await
        .context("Failed to write patch manifest")?;
    Ok((base_path, patch_path))
}
