use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;

use crate::error::ToolError;

pub fn default_accounts_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pyrus-mcp")
        .join("accounts.json")
}

pub fn default_log_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pyrus-mcp")
        .join("pyrus-mcp.log")
}

pub fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Downloads")
    })
}

pub fn expand_user(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Derives the on-disk filename for a downloaded file. The server-supplied
/// name arrives percent-encoded from the transport layer and may contain
/// directory components (`../../etc/evil.txt`, absolute paths); only its
/// final component is kept. Returns the safe name plus a warning when the
/// name had to be synthesized.
pub fn safe_filename(server_name: Option<&str>, file_id: u64) -> (String, Option<String>) {
    let fallback = || format!("file_{file_id}");

    let Some(raw) = server_name.filter(|name| !name.trim().is_empty()) else {
        return (
            fallback(),
            Some(format!(
                "File {file_id} has no filename from API, using fallback"
            )),
        );
    };

    let decoded = percent_decode_str(raw)
        .decode_utf8_lossy()
        .replace('+', " ");
    let stripped = Path::new(&decoded)
        .file_name()
        .map(|name| name.to_string_lossy().trim().to_string())
        .unwrap_or_default();

    if stripped.is_empty() {
        return (
            fallback(),
            Some(format!(
                "File {file_id} has invalid filename '{raw}', using fallback"
            )),
        );
    }
    (stripped, None)
}

/// Resolves the download destination, creating intermediate directories as
/// needed. A pre-existing non-directory at the path is a validation error;
/// creation failures distinguish permission problems from other I/O errors.
pub fn ensure_download_dir(dir: &Path) -> Result<(), ToolError> {
    if dir.exists() && !dir.is_dir() {
        return Err(ToolError::new(
            "not_a_directory",
            format!(
                "Cannot save file: '{}' exists but is not a directory",
                dir.display()
            ),
        )
        .with_field("save_dir"));
    }

    std::fs::create_dir_all(dir).map_err(|err| match err.kind() {
        std::io::ErrorKind::PermissionDenied => ToolError::new(
            "permission_denied",
            format!(
                "Cannot create directory '{}': permission denied. Check permissions or choose a different save location.",
                dir.display()
            ),
        )
        .with_field("save_dir"),
        _ => ToolError::new(
            "io_error",
            format!("Cannot create directory '{}': {err}", dir.display()),
        )
        .with_field("save_dir"),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_filename_strips_directory_components() {
        let (name, warning) = safe_filename(Some("../../etc/evil.txt"), 42);
        assert_eq!(name, "evil.txt");
        assert!(warning.is_none());

        let (name, _) = safe_filename(Some("/etc/passwd"), 42);
        assert_eq!(name, "passwd");
    }

    #[test]
    fn safe_filename_decodes_percent_escapes_and_plus() {
        let (name, warning) = safe_filename(Some("My%20report+final.pdf"), 1);
        assert_eq!(name, "My report final.pdf");
        assert!(warning.is_none());
    }

    #[test]
    fn safe_filename_falls_back_when_unresolvable() {
        let (name, warning) = safe_filename(None, 9);
        assert_eq!(name, "file_9");
        assert!(warning.is_some());

        let (name, warning) = safe_filename(Some(".."), 9);
        assert_eq!(name, "file_9");
        assert!(warning.is_some());

        let (name, warning) = safe_filename(Some("   "), 9);
        assert_eq!(name, "file_9");
        assert!(warning.is_some());
    }

    #[test]
    fn ensure_download_dir_rejects_file_at_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let file_path = tmp.path().join("occupied");
        std::fs::write(&file_path, b"x").unwrap();

        let err = ensure_download_dir(&file_path).unwrap_err();
        assert_eq!(err.code, "not_a_directory");
    }

    #[test]
    fn ensure_download_dir_creates_nested_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b").join("c");
        ensure_download_dir(&nested).unwrap();
        assert!(nested.is_dir());
        // Idempotent on an existing directory.
        ensure_download_dir(&nested).unwrap();
    }
}
