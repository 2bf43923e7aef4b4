use anyhow::Result;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use url::Url;

pub fn get_filename_from_url(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return Ok(filename.to_string());
            }
        }
    }

    // Fallback if no filename found in path
    Ok(format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// `client.zip` + `.meta` -> `client.zip.meta`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Forward slashes, no leading `./` or `/`.
pub fn normalize_relative(relative: &str) -> String {
    let unified = relative.replace('\\', "/");
    let mut trimmed = unified.as_str();
    loop {
        if let Some(rest) = trimmed.strip_prefix("./") {
            trimmed = rest;
        } else if let Some(rest) = trimmed.strip_prefix('/') {
            trimmed = rest;
        } else {
            break;
        }
    }
    trimmed.to_string()
}

/// Lookup key for manifest paths; install trees come from case-insensitive filesystems.
pub fn manifest_key(relative: &str) -> String {
    normalize_relative(relative).to_lowercase()
}

/// Resolves a manifest path under the install directory.
///
/// Returns `None` for paths that would escape the install directory.
pub fn local_path(install_path: &Path, relative: &str) -> Option<PathBuf> {
    let normalized = normalize_relative(relative);
    let relative = Path::new(&normalized);
    let mut path = install_path.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if path == install_path {
        return None;
    }
    Some(path)
}

pub fn file_name_of(relative: &str) -> String {
    let normalized = normalize_relative(relative);
    normalized
        .rsplit('/')
        .next()
        .unwrap_or(normalized.as_str())
        .to_string()
}

/// `base_url/relative/path`.
pub fn entry_url(base_url: &str, relative: &str) -> Result<Url> {
    let url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        normalize_relative(relative)
    );
    Ok(Url::parse(&url)?)
}

/// `base_url/filename`, for hosts that do not mirror the manifest's folders.
pub fn flat_entry_url(base_url: &str, relative: &str) -> Result<Url> {
    let url = format!("{}/{}", base_url.trim_end_matches('/'), file_name_of(relative));
    Ok(Url::parse(&url)?)
}
