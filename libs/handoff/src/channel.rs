//! Proxy side of a handoff: the per-host transfer channel.
//!
//! A channel is a Unix stream socket pair. The proxy keeps the parent end
//! and writes handoffs to it; the child end is inherited by the backend
//! process, which reads them with [`crate::ProxyListener`].

use std::io::{self, IoSlice};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex as StdMutex, PoisonError};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{sendmsg, socketpair, AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::HandoffError;
use crate::MAX_HEADER_SIZE;

/// A connection whose socket can be passed to another process.
///
/// Returns `None` when the connection is wrapped in a way that would lose
/// state if only the descriptor moved.
pub trait HandoffSource {
    fn handoff_fd(&self) -> Option<BorrowedFd<'_>>;
}

impl HandoffSource for tokio::net::TcpStream {
    fn handoff_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl HandoffSource for std::net::TcpStream {
    fn handoff_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

impl HandoffSource for tokio::net::UnixStream {
    fn handoff_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.as_fd())
    }
}

/// Parent end of a proxy-to-backend socket pair.
///
/// Handoffs are serialized by the write lock: the length/descriptor
/// message and the prefix bytes of one connection are never interleaved
/// with those of another.
pub struct TransferChannel {
    /// Parent end, `None` once closed. Doubles as the write lock.
    parent: Mutex<Option<UnixStream>>,
    /// Retained copy of the child end, duplicated into spawned backends.
    child: StdMutex<Option<OwnedFd>>,
}

impl TransferChannel {
    /// Create a new socket pair. Must be called within a tokio runtime.
    pub fn new() -> Result<Self, HandoffError> {
        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        set_cloexec(parent.as_raw_fd())?;
        set_cloexec(child.as_raw_fd())?;

        let parent = std::os::unix::net::UnixStream::from(parent);
        parent.set_nonblocking(true)?;
        let parent = UnixStream::from_std(parent)?;

        Ok(Self {
            parent: Mutex::new(Some(parent)),
            child: StdMutex::new(Some(child)),
        })
    }

    /// Duplicate the child end onto a descriptor numbered at least `lowest`.
    ///
    /// The duplicate is close-on-exec; the spawner decides which slot it
    /// finally occupies in the backend.
    pub fn dup_child_end(&self, lowest: RawFd) -> Result<OwnedFd, HandoffError> {
        let child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let fd = child.as_ref().ok_or(HandoffError::Closed)?;
        let dup = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(lowest))?;
        // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(dup) })
    }

    /// Hand `conn` and the bytes already read from it to the backend.
    ///
    /// The caller keeps ownership of `conn` and should drop it afterwards;
    /// the backend holds its own reference to the socket.
    ///
    /// A transfer that is cancelled, or fails after the descriptor went
    /// out, closes the channel. Otherwise the backend would read the next
    /// header from the middle of this prefix.
    pub async fn transfer<S>(&self, conn: &S, prefix: &[u8]) -> Result<(), HandoffError>
    where
        S: HandoffSource + ?Sized,
    {
        let fd = conn.handoff_fd().ok_or(HandoffError::BadSocket)?;
        if prefix.len() > MAX_HEADER_SIZE {
            return Err(HandoffError::InvalidLength(prefix.len()));
        }
        let header = (prefix.len() as u32).to_le_bytes();

        let mut parent = self.parent.lock().await;
        let passed = fd.as_raw_fd();

        // Held outside the slot until the message is complete, so a
        // cancelled transfer drops it.
        let mut stream = parent.take().ok_or(HandoffError::Closed)?;
        let sock = stream.as_raw_fd();
        let sent = match stream
            .async_io(Interest::WRITABLE, || send_header(sock, &header, passed))
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                // Nothing was written.
                *parent = Some(stream);
                return Err(e.into());
            }
        };

        if let Err(e) = finish_message(&mut stream, &header[sent..], prefix).await {
            warn!(error = %e, "Handoff left channel out of sync, closing");
            return Err(e.into());
        }
        *parent = Some(stream);

        debug!(fd = passed, prefix_len = prefix.len(), "Connection handed off");
        Ok(())
    }

    /// Close both ends held by this process.
    ///
    /// Waits for an in-flight transfer to finish. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), HandoffError> {
        let parent = self.parent.lock().await.take();
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if parent.is_none() && child.is_none() {
            debug!("Transfer channel already closed");
        }
        Ok(())
    }

    /// Whether the channel is closed, by [`close`](Self::close) or by an
    /// abandoned transfer.
    pub async fn is_closed(&self) -> bool {
        self.parent.lock().await.is_none()
    }
}

/// Write the part of the header `sendmsg` did not take, then the prefix.
///
/// The descriptor travels with the first header byte.
async fn finish_message(
    stream: &mut UnixStream,
    header_rest: &[u8],
    prefix: &[u8],
) -> io::Result<()> {
    stream.write_all(header_rest).await?;
    stream.write_all(prefix).await
}

fn send_header(sock: RawFd, header: &[u8], passed: RawFd) -> io::Result<usize> {
    let fds = [passed];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(header)];
    sendmsg::<()>(sock, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
}

pub(crate) fn set_cloexec(fd: RawFd) -> Result<(), HandoffError> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}
