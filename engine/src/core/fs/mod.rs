//! Filesystem utilities.
//!
//! Every annotation record, export and settings file is written through
//! [`atomic_write_bytes`], so a crash mid-write leaves either the previous
//! file or the new one on disk, never a truncated mix.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::{CoreError, CoreResult};

// =============================================================================
// Path Validation
// =============================================================================

/// Substrings that would let an identifier escape its directory
const FORBIDDEN_ID_PATTERNS: &[(&str, &str)] = &[
    ("..", "path traversal"),
    ("/", "a path separator"),
    ("\\", "a path separator"),
    (":", "a drive or stream separator"),
];

/// Checks that an identifier can be used as a single file name component.
pub fn validate_path_id_component(id: &str, label: &str) -> Result<(), String> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(format!("{label} is empty or contains only whitespace"));
    }
    if let Some((_, what)) = FORBIDDEN_ID_PATTERNS
        .iter()
        .find(|(pattern, _)| trimmed.contains(pattern))
    {
        return Err(format!("Invalid {label} '{id}': contains {what}"));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(format!("Invalid {label}: contains control characters"));
    }
    Ok(())
}

// =============================================================================
// Atomic Writes
// =============================================================================

/// Writes `bytes` to `path`, replacing any existing file atomically.
///
/// Data goes to a hidden sibling first and is synced before it takes the
/// destination's name. Parent directories are created as needed.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let staged = sibling(path, ".", &format!(".tmp.{}", std::process::id()));
    if let Err(e) = write_synced(&staged, bytes) {
        let _ = std::fs::remove_file(&staged);
        return Err(e);
    }

    replace_with(path, &staged).inspect_err(|_| {
        let _ = std::fs::remove_file(&staged);
    })
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

fn write_synced(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// `{prefix}{file name}{suffix}` next to `path`
fn sibling(path: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!("{prefix}{name}{suffix}"))
}

/// Moves `staged` onto `dest`.
///
/// A plain rename replaces atomically where the platform allows it; otherwise
/// the old file is parked as `.bak` and restored if the second rename fails.
fn replace_with(dest: &Path, staged: &Path) -> CoreResult<()> {
    let first_err = match std::fs::rename(staged, dest) {
        Ok(()) => return Ok(()),
        Err(e) if dest.exists() => e,
        Err(e) => return Err(CoreError::IoError(e)),
    };
    tracing::debug!(path = %dest.display(), "Direct replace failed ({}), swapping via backup", first_err);

    let backup = sibling(dest, "", ".bak");
    let _ = std::fs::remove_file(&backup);
    std::fs::rename(dest, &backup)?;

    match std::fs::rename(staged, dest) {
        Ok(()) => {
            let _ = std::fs::remove_file(&backup);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::rename(&backup, dest);
            Err(CoreError::IoError(e))
        }
    }
}
