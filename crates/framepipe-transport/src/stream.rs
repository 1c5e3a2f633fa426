use std::io::{Read, Write};
use std::net::Shutdown;
use std::time::Duration;

use crate::error::Result;

/// A connected, ordered byte stream.
///
/// Everything above the transport layer (framed readers, stream-backed
/// message pipes, the CLI) only needs `Read + Write` plus the handful of
/// socket controls exposed here.
pub struct IpcStream {
    inner: Inner,
}

enum Inner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl IpcStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: Inner::Unix(stream),
        }
    }

    /// Create a pair of connected streams (a socketpair on Unix).
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Set the read timeout. `None` blocks indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            Inner::Unix(stream) => Ok(stream.set_read_timeout(timeout)?),
        }
    }

    /// Set the write timeout. `None` blocks indefinitely.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            Inner::Unix(stream) => Ok(stream.set_write_timeout(timeout)?),
        }
    }

    /// Switch the stream between blocking and non-blocking mode.
    ///
    /// In non-blocking mode reads that cannot make progress fail with
    /// `ErrorKind::WouldBlock`, which framed readers surface as a resumable
    /// suspension rather than an error.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            Inner::Unix(stream) => Ok(stream.set_nonblocking(nonblocking)?),
        }
    }

    /// Duplicate the stream handle so reads and writes can live on
    /// different threads.
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            Inner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
        }
    }

    /// Shut down one or both halves of the connection.
    ///
    /// Shutting down the read half wakes any thread blocked in `read` with
    /// an end-of-stream.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            Inner::Unix(stream) => match stream.shutdown(how) {
                Ok(()) => Ok(()),
                // Already disconnected by the peer.
                Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Credentials of the connected peer as `(uid, gid, pid)` via
    /// `SO_PEERCRED`, or `None` when unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            Inner::Unix(stream) => stream.as_raw_fd(),
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable locations of the sizes
        // passed, and `fd` is an open socket owned by `self`.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        (rc == 0 && len as usize == std::mem::size_of::<libc::ucred>())
            .then_some((cred.uid, cred.gid, cred.pid as u32))
    }

    /// Credentials of the connected peer; not exposed on this platform.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            Inner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            Inner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            Inner::Unix(stream) => stream.flush(),
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            Inner::Unix(_) => f.debug_struct("IpcStream").field("kind", &"unix").finish(),
        }
    }
}
