//! Backend side of a handoff.
//!
//! [`ProxyListener`] wraps the channel end a backend inherited from the
//! proxy and turns each handoff back into a connection. The returned
//! [`ProxiedStream`] first replays the bytes the proxy consumed while
//! sniffing, then reads from the socket directly.

use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use nix::sys::socket::{recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, Interest, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{set_cloexec, HandoffSource};
use crate::error::HandoffError;
use crate::tracker::{ConnectionGuard, ConnectionTracker};
use crate::{ChannelKind, MAX_HEADER_SIZE};

/// Keep-alive idle period applied to handed-off TCP sockets.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Room for more descriptors than allowed, so extras are seen and rejected.
const MAX_RECEIVED_FDS: usize = 4;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Receives connections handed off by the proxy over one channel.
pub struct ProxyListener {
    /// Child end of the channel, `None` once closed or out of sync.
    /// Locked for the duration of one handoff.
    socket: Mutex<Option<UnixStream>>,
    kind: ChannelKind,
    tracker: ConnectionTracker,
}

impl ProxyListener {
    /// Wrap a channel descriptor. Must be called within a tokio runtime.
    pub fn from_fd(fd: OwnedFd, kind: ChannelKind) -> Result<Self, HandoffError> {
        let socket = std::os::unix::net::UnixStream::from(fd);
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket: Mutex::new(Some(UnixStream::from_std(socket)?)),
            kind,
            tracker: ConnectionTracker::new(),
        })
    }

    /// Take the inherited channel of `kind` from the environment.
    ///
    /// Returns `Ok(None)` when the proxy did not pass this channel. The
    /// variable is removed so it does not leak into grandchildren.
    pub fn from_env(kind: ChannelKind) -> Result<Option<Self>, HandoffError> {
        let var = kind.env_var();
        let Some(value) = std::env::var_os(var) else {
            return Ok(None);
        };
        std::env::remove_var(var);

        let value = value.to_string_lossy().into_owned();
        let fd: RawFd = match value.trim().parse() {
            Ok(fd) if fd >= 0 => fd,
            _ => return Err(HandoffError::InvalidInheritedSocket { var, value }),
        };
        set_cloexec(fd)?;

        info!(channel = %kind, fd = fd, "Inherited handoff channel");
        // SAFETY: the proxy placed the channel at this slot before exec and
        // no other code in this process claims it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::from_fd(fd, kind).map(Some)
    }

    /// Count connections from this listener in `tracker` instead of a private one.
    pub fn with_tracker(mut self, tracker: ConnectionTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Wait for the next handoff.
    ///
    /// Fails with [`HandoffError::Closed`] once the proxy closes its end.
    /// A malformed message, or one abandoned halfway, leaves the channel
    /// out of sync; the error is returned once and the channel is closed.
    pub async fn accept(&self) -> Result<ProxiedStream, HandoffError> {
        let mut socket = self.socket.lock().await;

        let mut header = [0u8; 4];
        let (read, mut fds) = {
            let stream = socket.as_ref().ok_or(HandoffError::Closed)?;
            let sock = stream.as_raw_fd();
            stream
                .async_io(Interest::READABLE, || recv_header(sock, &mut header))
                .await?
        };
        if read == 0 && fds.is_empty() {
            *socket = None;
            return Err(HandoffError::Closed);
        }

        // Only put back once the whole message is read, so an error or a
        // cancelled read drops the stream.
        let mut stream = socket.take().ok_or(HandoffError::Closed)?;
        let prefix = match read_message_rest(&mut stream, &mut header, read, fds.len()).await {
            Ok(prefix) => prefix,
            Err(e) => {
                warn!(channel = %self.kind, error = %e, "Handoff channel out of sync, closing");
                return Err(e);
            }
        };
        *socket = Some(stream);
        drop(socket);

        let fd = fds.pop().ok_or(HandoffError::InvalidDescriptorCount(0))?;
        enable_keepalive(&fd);

        let stream = std::net::TcpStream::from(fd);
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream)?;

        debug!(channel = %self.kind, prefix_len = prefix.len(), "Accepted handed-off connection");
        Ok(ProxiedStream::new(
            Bytes::from(prefix),
            stream,
            self.tracker.track(),
        ))
    }
}

/// Read what is left of a message whose first `read` bytes are in `header`.
async fn read_message_rest(
    stream: &mut UnixStream,
    header: &mut [u8; 4],
    read: usize,
    fd_count: usize,
) -> Result<Vec<u8>, HandoffError> {
    if fd_count != 1 {
        return Err(HandoffError::InvalidDescriptorCount(fd_count));
    }
    if read < header.len() {
        stream.read_exact(&mut header[read..]).await?;
    }

    let len = u32::from_le_bytes(*header) as usize;
    if len > MAX_HEADER_SIZE {
        return Err(HandoffError::InvalidLength(len));
    }
    let mut prefix = vec![0u8; len];
    stream.read_exact(&mut prefix).await?;
    Ok(prefix)
}

fn recv_header(sock: RawFd, header: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(header)];
    let mut cmsg = nix::cmsg_space!([RawFd; MAX_RECEIVED_FDS]);
    let msg = recvmsg::<()>(sock, &mut iov, Some(&mut cmsg), RECV_FLAGS)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: SCM_RIGHTS descriptors were just installed in this
            // process by the kernel and are owned by nobody else.
            fds.extend(
                received
                    .into_iter()
                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
            );
        }
    }
    Ok((msg.bytes, fds))
}

fn enable_keepalive(fd: &OwnedFd) {
    if let Err(e) = setsockopt(fd, sockopt::KeepAlive, &true) {
        debug!(error = %e, "Keep-alive not supported on handed-off socket");
        return;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Err(e) = setsockopt(fd, sockopt::TcpKeepIdle, &(KEEPALIVE_PERIOD.as_secs() as u32)) {
        debug!(error = %e, "Failed to set keep-alive period");
    }
}

/// A handed-off connection.
///
/// Reads return the proxy's consumed prefix before any live data. The
/// connection counts as open in its listener's [`ConnectionTracker`]
/// until dropped.
pub struct ProxiedStream {
    prefix: Bytes,
    inner: TcpStream,
    _guard: ConnectionGuard,
}

impl ProxiedStream {
    fn new(prefix: Bytes, inner: TcpStream, guard: ConnectionGuard) -> Self {
        Self {
            prefix,
            inner,
            _guard: guard,
        }
    }

    /// Prefix bytes not yet returned by a read.
    pub fn pending_prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }
}

impl HandoffSource for ProxiedStream {
    /// Only a fully drained stream can move on without losing bytes.
    fn handoff_fd(&self) -> Option<BorrowedFd<'_>> {
        if self.prefix.is_empty() {
            Some(self.inner.as_fd())
        } else {
            None
        }
    }
}

impl AsyncRead for ProxiedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(out.remaining());
            let chunk = this.prefix.split_to(n);
            out.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl AsyncWrite for ProxiedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
