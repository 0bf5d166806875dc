//! Listening socket acquisition.
//!
//! The service either receives a listener explicitly (bound from a URI on the
//! command line) or inherits one from the init system through the socket
//! activation protocol:
//!
//! - `LISTEN_PID` must be present and name this process
//! - `LISTEN_FDS` must be exactly `1`
//! - the inherited descriptor is fd 3 (`SD_LISTEN_FDS_START`)
//!
//! Anything else is a fatal startup error; there is no policy for choosing
//! among several inherited sockets.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// Environment variable marking an active socket activation handoff.
pub const LISTEN_PID: &str = "LISTEN_PID";

/// Environment variable carrying the number of inherited descriptors.
pub const LISTEN_FDS: &str = "LISTEN_FDS";

/// First descriptor passed by the init system.
pub const LISTEN_FDS_START: RawFd = 3;

/// Errors raised while acquiring the listening socket.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// No explicit listener and no socket activation marker.
    #[error(
        "cannot create API server: no listener provided and socket activation protocol is not active"
    )]
    NotActivated,

    /// The activation variables were meant for another process.
    #[error("socket activation descriptors belong to pid {expected}, not {actual}")]
    PidMismatch {
        /// Pid named by `LISTEN_PID`.
        expected: u32,
        /// Our pid.
        actual: u32,
    },

    /// An activation variable does not parse.
    #[error("invalid {var} value {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// Zero or several descriptors were inherited.
    #[error("wrong number of file descriptors for socket activation protocol ({0} != 1)")]
    DescriptorCount(usize),

    /// The inherited descriptor is neither a unix nor an inet socket.
    #[error("unsupported socket family {0} on inherited descriptor")]
    UnsupportedFamily(i32),

    /// A listen URI could not be understood.
    #[error("invalid listen URI {0:?}: expected unix:///path or tcp:host:port")]
    InvalidUri(String),

    /// Socket system call failed.
    #[error("listener I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Socket activation variables, captured once so acquisition is testable
/// without touching the process environment.
#[derive(Debug, Clone)]
pub struct ActivationEnv {
    /// Value of `LISTEN_PID`.
    pub listen_pid: Option<String>,
    /// Value of `LISTEN_FDS`.
    pub listen_fds: Option<String>,
    /// First inherited descriptor.
    pub first_fd: RawFd,
    /// Pid of this process.
    pub pid: u32,
}

impl ActivationEnv {
    /// Reads the activation variables of the running process.
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            listen_pid: std::env::var(LISTEN_PID).ok(),
            listen_fds: std::env::var(LISTEN_FDS).ok(),
            first_fd: LISTEN_FDS_START,
            pid: std::process::id(),
        }
    }

    /// Returns true if the activation marker is present.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.listen_pid.is_some()
    }
}

/// A listening socket the API server accepts on.
#[derive(Debug)]
pub enum ApiListener {
    /// TCP listener.
    Tcp(TcpListener),
    /// Unix domain socket listener.
    Unix(UnixListener),
}

impl ApiListener {
    /// Accepts the next connection.
    ///
    /// # Errors
    ///
    /// Returns the underlying accept error.
    pub async fn accept(&self) -> io::Result<ApiStream> {
        match self {
            Self::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok(ApiStream::Tcp(stream))
            }
            Self::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(ApiStream::Unix(stream))
            }
        }
    }

    /// Returns a printable local address (`tcp:127.0.0.1:8080`,
    /// `unix:///run/podgate.sock`).
    #[must_use]
    pub fn local_addr(&self) -> String {
        match self {
            Self::Tcp(l) => l
                .local_addr()
                .map_or_else(|_| "tcp:?".to_string(), |a| format!("tcp:{a}")),
            Self::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| format!("unix://{}", p.display())))
                .unwrap_or_else(|| "unix:(unnamed)".to_string()),
        }
    }
}

/// An accepted connection.
#[derive(Debug)]
pub enum ApiStream {
    /// TCP connection.
    Tcp(TcpStream),
    /// Unix domain socket connection.
    Unix(UnixStream),
}

impl AsyncRead for ApiStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ApiStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Returns `explicit` if given, otherwise the socket-activated listener.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// See [`ListenerError`]; every error is fatal for startup.
pub fn acquire(explicit: Option<ApiListener>) -> Result<ApiListener, ListenerError> {
    acquire_with(explicit, &ActivationEnv::from_process())
}

/// [`acquire`] against captured activation variables.
///
/// # Errors
///
/// See [`ListenerError`].
pub fn acquire_with(
    explicit: Option<ApiListener>,
    env: &ActivationEnv,
) -> Result<ApiListener, ListenerError> {
    if let Some(listener) = explicit {
        return Ok(listener);
    }

    let raw_pid = env.listen_pid.as_deref().ok_or(ListenerError::NotActivated)?;
    let expected: u32 = raw_pid.trim().parse().map_err(|_| ListenerError::InvalidEnv {
        var: LISTEN_PID,
        value: raw_pid.to_string(),
    })?;
    if expected != env.pid {
        return Err(ListenerError::PidMismatch {
            expected,
            actual: env.pid,
        });
    }

    let raw_fds = env.listen_fds.as_deref().unwrap_or("0");
    let count: usize = raw_fds.trim().parse().map_err(|_| ListenerError::InvalidEnv {
        var: LISTEN_FDS,
        value: raw_fds.to_string(),
    })?;
    if count != 1 {
        return Err(ListenerError::DescriptorCount(count));
    }

    let listener = listener_from_fd(env.first_fd)?;
    tracing::info!(fd = env.first_fd, addr = %listener.local_addr(), "using socket-activated listener");
    Ok(listener)
}

/// Binds a listener for `uri` (`unix:///path`, `tcp:host:port` or
/// `tcp://host:port`).
///
/// # Errors
///
/// Returns [`ListenerError::InvalidUri`] for unknown schemes and
/// [`ListenerError::Io`] if binding fails.
pub async fn bind(uri: &str) -> Result<ApiListener, ListenerError> {
    if let Some(path) = uri.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(ListenerError::InvalidUri(uri.to_string()));
        }
        return bind_unix(Path::new(path));
    }
    if let Some(addr) = uri
        .strip_prefix("tcp://")
        .or_else(|| uri.strip_prefix("tcp:"))
    {
        if addr.is_empty() {
            return Err(ListenerError::InvalidUri(uri.to_string()));
        }
        let listener = TcpListener::bind(addr).await?;
        return Ok(ApiListener::Tcp(listener));
    }
    Err(ListenerError::InvalidUri(uri.to_string()))
}

/// Binds a unix socket at `path`, replacing a stale socket file.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound.
pub fn bind_unix(path: &Path) -> Result<ApiListener, ListenerError> {
    // Remove existing socket
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove stale socket");
        }
    }
    // Create parent directory if needed
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(ApiListener::Unix(UnixListener::bind(path)?))
}

/// Path of a `unix://` listener, for cleanup on exit.
#[must_use]
pub fn unix_socket_path(listener: &ApiListener) -> Option<PathBuf> {
    match listener {
        ApiListener::Unix(l) => l
            .local_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(Path::to_path_buf)),
        ApiListener::Tcp(_) => None,
    }
}

fn listener_from_fd(fd: RawFd) -> Result<ApiListener, ListenerError> {
    if fd < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid file descriptor").into());
    }

    // SAFETY: the descriptor was handed to this process by the init system
    // and nothing else in the process owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(owned.as_raw_fd())?;

    match socket_family(owned.as_raw_fd())? {
        libc::AF_UNIX => {
            let std_listener = std::os::unix::net::UnixListener::from(owned);
            std_listener.set_nonblocking(true)?;
            Ok(ApiListener::Unix(UnixListener::from_std(std_listener)?))
        }
        libc::AF_INET | libc::AF_INET6 => {
            let std_listener = std::net::TcpListener::from(owned);
            std_listener.set_nonblocking(true)?;
            Ok(ApiListener::Tcp(TcpListener::from_std(std_listener)?))
        }
        other => Err(ListenerError::UnsupportedFamily(other)),
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD only reads descriptor flags; an invalid fd yields -1.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: F_SETFD takes an int argument and touches no memory.
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn socket_family(fd: RawFd) -> io::Result<i32> {
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    #[allow(clippy::cast_possible_truncation)]
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage and len outlive the call, and len holds the size of
    // storage, so the kernel writes at most that many bytes.
    let result = unsafe {
        libc::getsockname(
            fd,
            std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr>(),
            &raw mut len,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(i32::from(storage.ss_family))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use tempfile::TempDir;

    fn env(pid: Option<&str>, fds: Option<&str>, first_fd: RawFd) -> ActivationEnv {
        ActivationEnv {
            listen_pid: pid.map(str::to_string),
            listen_fds: fds.map(str::to_string),
            first_fd,
            pid: std::process::id(),
        }
    }

    fn own_pid() -> String {
        std::process::id().to_string()
    }

    #[tokio::test]
    async fn explicit_listener_is_returned_unchanged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let acquired = acquire_with(Some(ApiListener::Tcp(listener)), &env(None, None, -1)).unwrap();
        match acquired {
            ApiListener::Tcp(l) => assert_eq!(l.local_addr().unwrap(), addr),
            ApiListener::Unix(_) => panic!("expected tcp listener"),
        }
    }

    #[tokio::test]
    async fn missing_marker_is_fatal() {
        let err = acquire_with(None, &env(None, Some("1"), -1)).unwrap_err();
        assert!(matches!(err, ListenerError::NotActivated));
        assert!(err.to_string().contains("socket activation protocol is not active"));
    }

    #[tokio::test]
    async fn zero_descriptors_is_fatal() {
        let pid = own_pid();
        let err = acquire_with(None, &env(Some(&pid), Some("0"), -1)).unwrap_err();
        assert!(matches!(err, ListenerError::DescriptorCount(0)));

        let err = acquire_with(None, &env(Some(&pid), None, -1)).unwrap_err();
        assert!(matches!(err, ListenerError::DescriptorCount(0)));
    }

    #[tokio::test]
    async fn several_descriptors_is_fatal() {
        let pid = own_pid();
        let err = acquire_with(None, &env(Some(&pid), Some("2"), -1)).unwrap_err();
        assert!(matches!(err, ListenerError::DescriptorCount(2)));
        assert_eq!(
            err.to_string(),
            "wrong number of file descriptors for socket activation protocol (2 != 1)"
        );
    }

    #[tokio::test]
    async fn descriptors_for_another_process_are_rejected() {
        let other = (std::process::id() + 1).to_string();
        let err = acquire_with(None, &env(Some(&other), Some("1"), -1)).unwrap_err();
        assert!(matches!(err, ListenerError::PidMismatch { .. }));
    }

    #[tokio::test]
    async fn garbage_variables_are_rejected() {
        let err = acquire_with(None, &env(Some("abc"), Some("1"), -1)).unwrap_err();
        assert!(matches!(err, ListenerError::InvalidEnv { var: LISTEN_PID, .. }));

        let pid = own_pid();
        let err = acquire_with(None, &env(Some(&pid), Some("one"), -1)).unwrap_err();
        assert!(matches!(err, ListenerError::InvalidEnv { var: LISTEN_FDS, .. }));
    }

    #[tokio::test]
    async fn single_unix_descriptor_becomes_listener() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("activated.sock");
        let std_listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let fd = std_listener.into_raw_fd();

        let pid = own_pid();
        let listener = acquire_with(None, &env(Some(&pid), Some("1"), fd)).unwrap();
        assert!(matches!(listener, ApiListener::Unix(_)));
        assert_eq!(unix_socket_path(&listener).as_deref(), Some(path.as_path()));

        let client = tokio::spawn(async move { UnixStream::connect(&path).await });
        let accepted = listener.accept().await.unwrap();
        assert!(matches!(accepted, ApiStream::Unix(_)));
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn single_tcp_descriptor_becomes_listener() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let fd = std_listener.into_raw_fd();

        let pid = own_pid();
        let listener = acquire_with(None, &env(Some(&pid), Some("1"), fd)).unwrap();
        assert_eq!(listener.local_addr(), format!("tcp:{addr}"));
    }

    #[tokio::test]
    async fn bind_understands_uri_forms() {
        let dir = TempDir::new().unwrap();
        let sock = dir.path().join("nested").join("api.sock");

        let unix = bind(&format!("unix://{}", sock.display())).await.unwrap();
        assert!(matches!(unix, ApiListener::Unix(_)));
        assert!(sock.exists());

        let tcp = bind("tcp:127.0.0.1:0").await.unwrap();
        assert!(matches!(tcp, ApiListener::Tcp(_)));

        for bad in ["http://localhost", "unix://", "tcp:", "/just/a/path"] {
            assert!(matches!(bind(bad).await, Err(ListenerError::InvalidUri(_))), "{bad}");
        }
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = TempDir::new().unwrap();
        let sock = dir.path().join("api.sock");
        std::fs::write(&sock, b"stale").unwrap();

        let listener = bind_unix(&sock).unwrap();
        assert_eq!(unix_socket_path(&listener).as_deref(), Some(sock.as_path()));
    }
}
