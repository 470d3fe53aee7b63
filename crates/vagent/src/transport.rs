//! Opening the byte stream to the peer.
//!
//! - unix-connect: connect to a listening unix socket
//! - unix-listen: bind, accept exactly one peer, stop listening
//! - virtio-serial / isa-serial: open the character device non-blocking and
//!   drive it through the tokio reactor with `AsyncFd`

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use nix::fcntl::OFlag;
use nix::sys::termios;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};

use crate::config::ChannelMethod;

/// A duplex byte stream to the peer.
pub trait AgentStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AgentStream for T {}

pub type BoxedStream = Box<dyn AgentStream>;

pub async fn open(method: ChannelMethod, path: &Path) -> io::Result<BoxedStream> {
    tracing::info!(method = %method, path = %path.display(), "Opening channel");
    match method {
        ChannelMethod::UnixConnect => Ok(Box::new(UnixStream::connect(path).await?)),
        ChannelMethod::UnixListen => Ok(Box::new(accept_one(path).await?)),
        ChannelMethod::VirtioSerial => Ok(Box::new(CharDevice::open(path, false)?)),
        ChannelMethod::IsaSerial => Ok(Box::new(CharDevice::open(path, true)?)),
    }
}

async fn accept_one(path: &Path) -> io::Result<UnixStream> {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!(path = %path.display(), "Waiting for peer");
    let (stream, _) = listener.accept().await?;
    tracing::info!("Peer connected");
    Ok(stream)
}

/// A character device (virtio-serial port or serial tty) on the reactor.
#[derive(Debug)]
pub struct CharDevice {
    inner: AsyncFd<File>,
}

impl CharDevice {
    /// Open `path` read/write and non-blocking. Serial ttys are switched to
    /// raw mode so no byte of a frame is translated or eaten.
    pub fn open(path: &Path, raw_tty: bool) -> io::Result<Self> {
        let flags = OFlag::O_NONBLOCK | OFlag::O_NOCTTY;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags.bits())
            .open(path)?;
        if raw_tty {
            let mut attrs = termios::tcgetattr(&file).map_err(io::Error::from)?;
            termios::cfmakeraw(&mut attrs);
            termios::tcsetattr(&file, termios::SetArg::TCSANOW, &attrs)
                .map_err(io::Error::from)?;
        }
        Self::from_file(file)
    }

    /// Wrap an already non-blocking file.
    pub fn from_file(file: File) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(file)?,
        })
    }
}

impl AsyncRead for CharDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = match self.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for CharDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = match self.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
