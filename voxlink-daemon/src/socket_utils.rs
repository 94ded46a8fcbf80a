//! Unix socket path utilities with security-focused defaults
//!
//! Provides secure socket paths using XDG_RUNTIME_DIR with fallback to user-specific locations.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// File name of the control socket
pub const SOCKET_NAME: &str = "voxlink.sock";

/// Get secure socket directory path
///
/// Priority:
/// 1. XDG_RUNTIME_DIR (user-specific, mode 0700, auto-cleaned)
/// 2. ~/.local/share/voxlink (user-specific, created on demand)
pub fn get_socket_dir() -> Result<PathBuf> {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        let path = PathBuf::from(runtime_dir);
        if path.exists() {
            return Ok(path);
        }
    }

    let home = std::env::var("HOME").context("HOME environment variable not set")?;

    let socket_dir = PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("voxlink");

    if !socket_dir.exists() {
        std::fs::create_dir_all(&socket_dir).context("Failed to create socket directory")?;
    }

    // Owner-only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o700);
        std::fs::set_permissions(&socket_dir, permissions)
            .context("Failed to set socket directory permissions")?;
    }

    Ok(socket_dir)
}

/// Get path for the control socket
pub fn get_ipc_socket_path() -> Result<PathBuf> {
    Ok(get_socket_dir()?.join(SOCKET_NAME))
}

/// Set secure permissions on a socket file (0600 = owner read/write only)
#[cfg(unix)]
pub fn secure_socket_permissions(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if socket_path.exists() {
        let permissions = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(socket_path, permissions)
            .context("Failed to set socket permissions")?;
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn secure_socket_permissions(_socket_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_socket_path() {
        let path = get_ipc_socket_path().unwrap();
        assert!(path.ends_with(SOCKET_NAME));
        assert!(path.is_absolute());
    }

    #[cfg(unix)]
    #[test]
    fn test_secure_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        std::fs::write(&path, b"").unwrap();

        secure_socket_permissions(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
