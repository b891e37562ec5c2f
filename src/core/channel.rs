//! # Byte Channels
//!
//! The non-blocking byte channel abstraction every layer is stacked on.
//!
//! A channel never blocks the worker thread. `read` and `write` report "not
//! ready" as `Ok(0)`; the only suspension point is [`Channel::ready`], which parks
//! the calling task on the readiness multiplexer until the channel can make
//! progress. End of stream is reported as `ErrorKind::UnexpectedEof`.
//!
//! ## Implementations
//! - [`TcpChannel`]: a tokio `TcpStream` driven through `try_read`/`try_write`
//! - [`PipeChannel`]: an in-memory duplex pair, see [`pipe`]
//! - `SslChannel` (in `transport::tls`): TLS on top of any other channel

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::trace;

/// Non-blocking, cooperatively scheduled byte channel
#[allow(async_fn_in_trait)]
pub trait Channel {
    /// Read available bytes. `Ok(0)` means nothing is ready yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `buf` as possible. `Ok(0)` means the channel would block.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Suspend until the channel is ready for `interest`.
    async fn ready(&mut self, interest: Interest) -> io::Result<()>;

    /// Whether the channel can still carry data.
    fn is_open(&self) -> bool;

    /// Gracefully close the channel. Calling it again is a no-op.
    async fn close(&mut self) -> io::Result<()>;
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel closed")
}

/// Plain TCP channel
#[derive(Debug)]
pub struct TcpChannel {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream: Some(stream),
            peer,
        }
    }

    /// Remote address, if the socket reported one
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Channel for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.stream.as_ref().ok_or_else(closed_error)?;
        if buf.is_empty() {
            return Ok(0);
        }
        match stream.try_read(buf) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.stream.as_ref().ok_or_else(closed_error)?;
        match stream.try_write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn ready(&mut self, interest: Interest) -> io::Result<()> {
        let stream = self.stream.as_ref().ok_or_else(closed_error)?;
        stream.ready(interest).await.map(|_| ())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut stream) = self.stream.take() {
            trace!(peer = ?self.peer, "Closing TCP channel");
            // Peer may already be gone; the socket is released either way.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PipeBuffer {
    data: Mutex<VecDeque<u8>>,
    closed: AtomicBool,
    notify: Notify,
}

impl PipeBuffer {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<u8>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One end of an in-memory duplex pipe
#[derive(Debug)]
pub struct PipeChannel {
    incoming: Arc<PipeBuffer>,
    outgoing: Arc<PipeBuffer>,
    open: bool,
}

/// Create a connected pair of in-memory channels.
///
/// Writes never block; reads see bytes in the order they were written.
pub fn pipe() -> (PipeChannel, PipeChannel) {
    let a_to_b = Arc::new(PipeBuffer::default());
    let b_to_a = Arc::new(PipeBuffer::default());
    (
        PipeChannel {
            incoming: b_to_a.clone(),
            outgoing: a_to_b.clone(),
            open: true,
        },
        PipeChannel {
            incoming: a_to_b,
            outgoing: b_to_a,
            open: true,
        },
    )
}

impl Channel for PipeChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Err(closed_error());
        }
        let mut data = self.incoming.lock();
        if data.is_empty() {
            if self.incoming.closed.load(Ordering::Acquire) {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            return Ok(0);
        }
        let n = buf.len().min(data.len());
        for (slot, byte) in buf.iter_mut().zip(data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open || self.outgoing.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.outgoing.lock().extend(buf.iter().copied());
        self.outgoing.notify.notify_one();
        Ok(buf.len())
    }

    async fn ready(&mut self, interest: Interest) -> io::Result<()> {
        if !self.open {
            return Err(closed_error());
        }
        if interest.is_writable() {
            return Ok(());
        }
        loop {
            if !self.incoming.lock().is_empty() || self.incoming.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            self.incoming.notify.notified().await;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> io::Result<()> {
        if self.open {
            self.open = false;
            self.outgoing.closed.store(true, Ordering::Release);
            self.outgoing.notify.notify_one();
        }
        Ok(())
    }
}
