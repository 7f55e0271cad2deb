//! Unix Domain Socket IPC between the CLI and the daemon.
//!
//! The protocol is newline-delimited JSON: one [`IpcRequest`] per line from
//! the client, one [`IpcResponse`] per line back.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/testhub/daemon.sock`
//! - Fallback: `/tmp/testhub-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket_path = get_socket_path();
//!     let mut client = IpcClient::connect(&socket_path).await?;
//!
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
mod server;

pub use client::IpcClient;
pub use messages::{IpcErrorKind, IpcRequest, IpcResponse, IpcSessionInfo};
pub use server::{IpcConnection, IpcError, IpcServer, RequestHandler};

use std::path::PathBuf;

/// Get the default socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/testhub/daemon.sock`
/// 2. Otherwise: `/tmp/testhub-$UID/daemon.sock`
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("testhub").join("daemon.sock")
    } else {
        // Get UID by checking metadata of a file we own
        let uid = std::fs::metadata("/proc/self")
            .map(|m| m.uid())
            .unwrap_or(0);

        PathBuf::from(format!("/tmp/testhub-{}", uid)).join("daemon.sock")
    }
}

#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from("/tmp/testhub-unsupported/daemon.sock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_runtime_dir<F: FnOnce()>(value: Option<&str>, f: F) {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();
        // SAFETY: env access is serialized across these tests.
        unsafe {
            match value {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
        f();
        // SAFETY: see above.
        unsafe {
            match original {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
    }

    #[test]
    #[serial]
    fn test_get_socket_path_with_xdg_runtime_dir() {
        with_runtime_dir(Some("/run/user/1000"), || {
            assert_eq!(
                get_socket_path(),
                PathBuf::from("/run/user/1000/testhub/daemon.sock")
            );
        });
    }

    #[test]
    #[serial]
    fn test_get_socket_path_without_xdg_runtime_dir() {
        with_runtime_dir(None, || {
            let path = get_socket_path();
            let text = path.to_str().unwrap();
            assert!(text.starts_with("/tmp/testhub-"));
            assert!(text.ends_with("/daemon.sock"));
        });
    }

    #[test]
    #[serial]
    fn test_socket_path_is_absolute_sock_file() {
        let path = get_socket_path();
        assert!(path.is_absolute());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("sock"));
    }
}
