//! Service name resolution.
//!
//! Servers advertise a name and get back the transport address to listen
//! on; clients resolve the same name to connect. The directory is a
//! collaborator: anything implementing [`ServiceDirectory`] can stand in,
//! [`PathDirectory`] just maps names to socket files under one directory.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::trace::debug;

/// Longest service name [`PathDirectory`] accepts. Keeps the socket path
/// inside `sun_path` for reasonable root directories.
pub const MAX_SERVICE_NAME: usize = 64;

/// Errors from directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The name cannot be used as a service name.
    #[error("invalid service name '{0}'")]
    InvalidName(String),
    /// Nobody advertises this name.
    #[error("service '{0}' is not advertised")]
    NotFound(String),
    /// The directory backing store failed.
    #[error("directory I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Where a service can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportAddr(PathBuf);

impl TransportAddr {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Maps service names to transport addresses.
pub trait ServiceDirectory {
    /// Claims `name` for a server and returns the address to listen on.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or cannot be claimed.
    fn advertise(&self, name: &str) -> Result<TransportAddr, DirectoryError>;

    /// Releases a name claimed with [`advertise`](Self::advertise).
    fn withdraw(&self, name: &str);

    /// Looks up the address of an advertised service.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] if nobody advertises `name`.
    fn resolve(&self, name: &str) -> Result<TransportAddr, DirectoryError>;
}

/// Directory backed by socket files under a root directory:
/// `<root>/<name>.sock`.
#[derive(Debug, Clone)]
pub struct PathDirectory {
    root: PathBuf,
}

impl PathDirectory {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, DirectoryError> {
        let valid = !name.is_empty()
            && name.len() <= MAX_SERVICE_NAME
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
            && !name.starts_with('.');
        if !valid {
            return Err(DirectoryError::InvalidName(name.to_owned()));
        }
        Ok(self.root.join(format!("{name}.sock")))
    }
}

impl ServiceDirectory for PathDirectory {
    fn advertise(&self, name: &str) -> Result<TransportAddr, DirectoryError> {
        let path = self.path_of(name)?;
        std::fs::create_dir_all(&self.root)?;
        debug!(service = name, path = %path.display(), "service advertised");
        Ok(TransportAddr(path))
    }

    fn withdraw(&self, name: &str) {
        if let Ok(path) = self.path_of(name) {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(service = name, error = %e, "socket file already gone");
            }
        }
    }

    fn resolve(&self, name: &str) -> Result<TransportAddr, DirectoryError> {
        let path = self.path_of(name)?;
        if path.exists() {
            Ok(TransportAddr(path))
        } else {
            Err(DirectoryError::NotFound(name.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_socket_files() {
        let dir = tempfile::tempdir().unwrap();
        let directory = PathDirectory::new(dir.path());

        let addr = directory.advertise("echo").unwrap();
        assert_eq!(addr.path(), dir.path().join("echo.sock"));
    }

    #[test]
    fn unadvertised_name_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let directory = PathDirectory::new(dir.path());

        assert!(matches!(
            directory.resolve("missing"),
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[test]
    fn path_like_names_are_rejected() {
        let directory = PathDirectory::new("/tmp");
        for bad in ["", "../x", "a/b", ".hidden", &"n".repeat(MAX_SERVICE_NAME + 1)] {
            assert!(
                matches!(directory.advertise(bad), Err(DirectoryError::InvalidName(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn resolve_sees_existing_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let directory = PathDirectory::new(dir.path());
        let addr = directory.advertise("svc").unwrap();
        std::fs::write(addr.path(), b"").unwrap();

        assert_eq!(directory.resolve("svc").unwrap(), addr);
        directory.withdraw("svc");
        assert!(directory.resolve("svc").is_err());
    }
}
