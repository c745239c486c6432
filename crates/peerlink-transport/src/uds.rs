use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::stream::LinkStream;

/// `sockaddr_un.sun_path` capacity.
#[cfg(target_os = "linux")]
const SUN_PATH_MAX: usize = 108;
#[cfg(not(target_os = "linux"))]
const SUN_PATH_MAX: usize = 104;

/// Device and inode of the socket file we created, so drop only removes
/// that file and not one a later process bound at the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Inode(u64, u64);

impl Inode {
    fn of(path: &Path) -> io::Result<Self> {
        let meta = fs::symlink_metadata(path)?;
        Ok(Self(meta.dev(), meta.ino()))
    }
}

/// Listening Unix domain socket bound to a filesystem path.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    inode: Inode,
}

impl UnixDomainSocket {
    /// Owner read/write only.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind `path`, replacing a stale socket left there by an earlier process.
    ///
    /// Anything at `path` that is not a socket is left alone and the bind fails.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = path.as_os_str().len();
        if len >= SUN_PATH_MAX {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: SUN_PATH_MAX,
            });
        }

        let bound = clear_stale(&path)
            .and_then(|()| UnixListener::bind(&path))
            .and_then(|listener| {
                fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
                Ok((listener, Inode::of(&path)?))
            });
        let (listener, inode) = bound.map_err(|source| TransportError::Bind {
            endpoint: format!("unix://{}", path.display()),
            source,
        })?;

        info!(path = %path.display(), mode = format_args!("{mode:o}"), "unix socket bound");
        Ok(Self {
            listener,
            path,
            inode,
        })
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        Ok(self.listener.set_nonblocking(nonblocking)?)
    }

    /// Take one connection. In non-blocking mode an empty backlog is
    /// `TransportError::Accept` with `WouldBlock`.
    pub fn accept(&self) -> Result<LinkStream> {
        let (stream, _) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nonblocking(false).map_err(TransportError::Accept)?;
        debug!(path = %self.path.display(), "unix connection accepted");
        Ok(LinkStream::from_unix(stream))
    }

    pub fn connect(path: impl AsRef<Path>) -> Result<LinkStream> {
        let path = path.as_ref();
        match UnixStream::connect(path) {
            Ok(stream) => Ok(LinkStream::from_unix(stream)),
            Err(source) => Err(TransportError::Connect {
                endpoint: format!("unix://{}", path.display()),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn clear_stale(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a unix socket",
        ));
    }
    debug!(path = %path.display(), "replacing stale socket");
    fs::remove_file(path)
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        match Inode::of(&self.path) {
            Ok(inode) if inode == self.inode => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %err, "could not remove socket file");
                }
            }
            Ok(_) => debug!(path = %self.path.display(), "socket path rebound elsewhere, leaving it"),
            Err(_) => {}
        }
    }
}
