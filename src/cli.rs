use anyhow::{bail, Result};
use clap::ValueEnum;
use rpatch::{FingerprintVerifier, PartialSha256, PatchManifest, SizeOnly};
use std::sync::Arc;

/// How a file whose size already matches its manifest entry is checked.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FingerprintCheck {
    /// Compare fingerprints where the manifest has one
    Auto,
    /// Refuse manifests with add/replace entries lacking a fingerprint
    Require,
    /// Trust matching sizes
    Skip,
}

impl FingerprintCheck {
    pub fn verifier(self) -> Arc<dyn FingerprintVerifier> {
        match self {
            FingerprintCheck::Skip => Arc::new(SizeOnly),
            FingerprintCheck::Auto | FingerprintCheck::Require => Arc::new(PartialSha256),
        }
    }

    pub fn check_manifest(self, manifest: &PatchManifest) -> Result<()> {
        if self != FingerprintCheck::Require {
            return Ok(());
        }
        let missing: Vec<&str> = manifest
            .patches
            .iter()
            .filter(|p| !p.is_delete() && p.fingerprint.is_empty())
            .map(|p| p.relative_path.as_str())
            .collect();
        if !missing.is_empty() {
            bail!("Fingerprints are required, but these entries have none: {:?}", missing);
        }
        Ok(())
    }
}
