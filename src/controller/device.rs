//! Joystick device node opened for non-blocking reads
//!
//! The kernel joystick interface hands out one 8-byte record per `read`.
//! A blocking read parks a runtime thread until the next record arrives,
//! and timing out the future does not abort that thread. The device is
//! therefore opened with `O_NONBLOCK` and driven by epoll readiness through
//! [`AsyncFd`], so a pending read is dropped the moment the source stops
//! waiting and the descriptor is closed when the source releases it.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

/// Readiness-driven joystick device
///
/// Works for anything epoll accepts: character devices such as
/// `/dev/input/jsX`, FIFOs and pipes. Regular files are rejected at
/// construction.
#[derive(Debug)]
pub struct JoystickDevice {
    fd: AsyncFd<File>,
}

impl JoystickDevice {
    /// Open `path` read-only without blocking.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        // O_NONBLOCK at open time keeps opening a FIFO from waiting for a writer
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)?;
        debug!("Opened {} for non-blocking reads", path.display());
        Self::from_file(file)
    }

    /// Switch an already opened handle to non-blocking mode and register it
    /// with the runtime
    pub fn from_file(file: File) -> io::Result<Self> {
        fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
        Ok(Self {
            fd: AsyncFd::new(file)?,
        })
    }
}

impl AsyncRead for JoystickDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                // Spurious readiness, cleared by try_io
                Err(_would_block) => continue,
            }
        }
    }
}
