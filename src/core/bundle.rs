//! # Packet Bundle Channel
//!
//! Frames writes into discrete, DEFLATE-compressed, length-prefixed bundles and
//! decodes inbound bundles atomically.
//!
//! ## Wire Format
//! ```text
//! [Length(4, big-endian)] [zlib-compressed payload(Length)]
//! ```
//!
//! ## Flow
//! - Callers append to [`PacketBundleChannel::output`] and seal it with
//!   [`PacketBundleChannel::queue_bundle`]
//! - [`PacketBundleChannel::process`] makes bounded non-blocking progress in both
//!   directions and reports `Bundle`, `Yield` or `Closed`
//! - Partially written bundles stay at the head of the queue until the channel
//!   accepts the rest; outbound order is strictly FIFO
//!
//! ## Limits
//! - A declared length above the configured maximum (at most 64 MiB) is rejected
//!   straight from the 4-byte header, before any payload buffer is allocated
//! - Decompressed output is bounded by the same maximum. Outbound bundles are
//!   therefore held to it before compression as well as after, so nothing is
//!   sent that the peer would refuse to inflate
//!
//! Any I/O failure or protocol violation, including an oversized outbound
//! bundle, closes the channel for good.

use std::collections::VecDeque;
use std::io;

use tokio::io::Interest;
use tracing::{debug, info, instrument, warn};

use crate::config::{TransportConfig, MAX_BUNDLE_SIZE};
use crate::core::channel::Channel;
use crate::error::{ProtocolError, Result};
use crate::utils::{buffer_pool, compression, metrics::global_metrics};

/// Size of the big-endian length prefix
pub const HEADER_LEN: usize = 4;

/// Outcome of one [`PacketBundleChannel::process`] step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStatus {
    /// A complete bundle is ready; fetch it with `take_bundle`
    Bundle,
    /// No progress possible right now; yield until the channel is ready
    Yield,
    /// The channel is finished
    Closed,
}

/// A queued bundle and how much of it has already been written
struct OutboundBundle {
    buffer: Vec<u8>,
    offset: usize,
}

/// Inbound decoder state
enum Inbound {
    Header { bytes: [u8; HEADER_LEN], filled: usize },
    Body { buffer: Vec<u8>, filled: usize },
}

impl Inbound {
    fn header() -> Self {
        Inbound::Header {
            bytes: [0; HEADER_LEN],
            filled: 0,
        }
    }
}

/// Bundle framing over any [`Channel`]
pub struct PacketBundleChannel<C: Channel> {
    channel: C,
    output: Vec<u8>,
    scratch: Vec<u8>,
    outbound: VecDeque<OutboundBundle>,
    inbound: Inbound,
    ready: Option<Vec<u8>>,
    max_bundle_size: usize,
    compression_level: u32,
    process_attempts: usize,
    pool_max_buffers: usize,
    bytes_in: u64,
    bytes_out: u64,
    closed: bool,
    close_reason: Option<ProtocolError>,
}

impl<C: Channel> PacketBundleChannel<C> {
    /// Wrap `channel` using default transport settings
    pub fn new(channel: C) -> Self {
        Self::with_config(channel, &TransportConfig::default())
    }

    pub fn with_config(channel: C, config: &TransportConfig) -> Self {
        Self {
            channel,
            output: Vec::new(),
            scratch: Vec::new(),
            outbound: VecDeque::new(),
            inbound: Inbound::header(),
            ready: None,
            max_bundle_size: config.max_bundle_size.min(MAX_BUNDLE_SIZE),
            compression_level: config.compression_level,
            process_attempts: config.process_attempts.max(1),
            pool_max_buffers: config.pool_max_buffers,
            bytes_in: 0,
            bytes_out: 0,
            closed: false,
            close_reason: None,
        }
    }

    /// Growable buffer holding the bundle currently being written
    pub fn output(&mut self) -> &mut Vec<u8> {
        &mut self.output
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Bundles waiting to be written (including a partially written one)
    pub fn pending_bundles(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Why the channel closed, if it closed because of an error
    pub fn close_reason(&self) -> Option<&ProtocolError> {
        self.close_reason.as_ref()
    }

    /// Compress the output buffer into a framed bundle and queue it for writing.
    ///
    /// The output buffer is reset whether or not this succeeds. An oversized
    /// bundle terminates the channel.
    pub fn queue_bundle(&mut self) -> Result<()> {
        if self.closed {
            self.output.clear();
            return Err(ProtocolError::ConnectionClosed);
        }
        if self.output.len() > self.max_bundle_size {
            let len = self.output.len();
            self.output.clear();
            self.terminate(ProtocolError::OversizedBundle(len));
            return Err(ProtocolError::OversizedBundle(len));
        }

        let compressed =
            compression::compress_into(&self.output, self.compression_level, &mut self.scratch);
        self.output.clear();
        compressed?;

        let len = self.scratch.len();
        if len > self.max_bundle_size {
            self.terminate(ProtocolError::OversizedBundle(len));
            return Err(ProtocolError::OversizedBundle(len));
        }

        let mut buffer = buffer_pool::acquire(HEADER_LEN + len);
        buffer[..HEADER_LEN].copy_from_slice(&(len as u32).to_be_bytes());
        buffer[HEADER_LEN..].copy_from_slice(&self.scratch);
        self.outbound.push_back(OutboundBundle { buffer, offset: 0 });
        global_metrics().bundle_sent();
        Ok(())
    }

    /// Append `data` to the output buffer and queue it as one bundle.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.output.extend_from_slice(data);
        self.queue_bundle()
    }

    /// Drain as much of the outbound queue as the channel accepts.
    ///
    /// Returns whether any bytes were written.
    pub fn write(&mut self) -> Result<bool> {
        let mut progress = false;
        while let Some(head) = self.outbound.front_mut() {
            let written = self
                .channel
                .write(&head.buffer[head.offset..])
                .map_err(ProtocolError::from_io)?;
            if written == 0 {
                break;
            }
            progress = true;
            head.offset += written;
            self.bytes_out += written as u64;
            global_metrics().bytes_written(written as u64);

            if head.offset == head.buffer.len() {
                if let Some(done) = self.outbound.pop_front() {
                    buffer_pool::release(done.buffer, self.pool_max_buffers);
                }
            }
        }
        Ok(progress)
    }

    /// Read towards the next bundle. Returns `true` once one is fully decoded.
    fn fetch(&mut self) -> Result<bool> {
        loop {
            match &mut self.inbound {
                Inbound::Header { bytes, filled } => {
                    let n = self
                        .channel
                        .read(&mut bytes[*filled..])
                        .map_err(ProtocolError::from_io)?;
                    if n == 0 {
                        return Ok(false);
                    }
                    *filled += n;
                    self.bytes_in += n as u64;
                    if *filled < HEADER_LEN {
                        continue;
                    }

                    let declared = u32::from_be_bytes(*bytes) as usize;
                    if declared > self.max_bundle_size {
                        return Err(ProtocolError::OversizedBundle(declared));
                    }
                    self.inbound = Inbound::Body {
                        buffer: buffer_pool::acquire(declared),
                        filled: 0,
                    };
                }
                Inbound::Body { buffer, filled } => {
                    if *filled < buffer.len() {
                        let n = self
                            .channel
                            .read(&mut buffer[*filled..])
                            .map_err(ProtocolError::from_io)?;
                        if n == 0 {
                            return Ok(false);
                        }
                        *filled += n;
                        self.bytes_in += n as u64;
                        continue;
                    }

                    let decoded = compression::decompress(buffer, self.max_bundle_size);
                    if let Inbound::Body { buffer, .. } =
                        std::mem::replace(&mut self.inbound, Inbound::header())
                    {
                        global_metrics().bytes_read((HEADER_LEN + buffer.len()) as u64);
                        buffer_pool::release(buffer, self.pool_max_buffers);
                    }
                    self.ready = Some(decoded?);
                    global_metrics().bundle_received();
                    return Ok(true);
                }
            }
        }
    }

    /// One bounded, non-blocking step in both directions.
    pub fn process(&mut self) -> BundleStatus {
        if self.ready.is_some() {
            return BundleStatus::Bundle;
        }
        for _ in 0..self.process_attempts {
            if self.closed {
                return BundleStatus::Closed;
            }
            let before = (self.bytes_in, self.bytes_out);

            if let Err(e) = self.write() {
                self.terminate(e);
                return BundleStatus::Closed;
            }
            match self.fetch() {
                Ok(true) => return BundleStatus::Bundle,
                Ok(false) => {}
                Err(e) => {
                    self.terminate(e);
                    return BundleStatus::Closed;
                }
            }

            if (self.bytes_in, self.bytes_out) == before {
                break;
            }
        }
        if self.closed {
            BundleStatus::Closed
        } else {
            BundleStatus::Yield
        }
    }

    /// Take the most recently decoded bundle.
    pub fn take_bundle(&mut self) -> Option<Vec<u8>> {
        self.ready.take()
    }

    /// Hand a consumed bundle buffer back for reuse.
    pub fn recycle(&self, buffer: Vec<u8>) {
        buffer_pool::release(buffer, self.pool_max_buffers);
    }

    /// Suspend until the underlying channel can make progress.
    pub async fn wait(&mut self) -> Result<()> {
        let interest = if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        self.channel
            .ready(interest)
            .await
            .map_err(ProtocolError::from_io)
    }

    /// Wait for and return the next bundle.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.process() {
                BundleStatus::Bundle => {
                    if let Some(bundle) = self.take_bundle() {
                        return Ok(bundle);
                    }
                }
                BundleStatus::Yield => {
                    if let Err(e) = self.wait().await {
                        self.terminate(e);
                    }
                }
                BundleStatus::Closed => {
                    return Err(self
                        .close_reason
                        .take()
                        .unwrap_or(ProtocolError::ConnectionClosed));
                }
            }
        }
    }

    /// Write every queued bundle.
    pub async fn flush(&mut self) -> Result<()> {
        while !self.outbound.is_empty() {
            if self.closed {
                return Err(ProtocolError::ConnectionClosed);
            }
            if !self.write()? {
                self.channel
                    .ready(Interest::WRITABLE)
                    .await
                    .map_err(ProtocolError::from_io)?;
            }
        }
        Ok(())
    }

    /// Flush what can be flushed, then close the underlying channel. Idempotent.
    #[instrument(skip(self), level = "debug")]
    pub async fn close(&mut self) -> Result<()> {
        if !self.closed {
            if let Err(e) = self.flush().await {
                debug!(error=%e, "Dropping unflushed bundles on close");
            }
            self.closed = true;
        }
        for bundle in self.outbound.drain(..) {
            buffer_pool::release(bundle.buffer, self.pool_max_buffers);
        }
        self.channel.close().await.map_err(ProtocolError::from_io)
    }

    fn terminate(&mut self, error: impl Into<ProtocolError>) {
        let error = error.into();
        if self.closed {
            return;
        }
        self.closed = true;
        if error.is_protocol_violation() {
            global_metrics().protocol_error();
            warn!(error=%error, "Bundle channel terminated by protocol violation");
        } else if error.is_expected_disconnect() {
            debug!(error=%error, "Bundle channel closed by peer");
        } else {
            info!(error=%error, "Bundle channel terminated");
        }
        self.close_reason = Some(match error {
            ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                ProtocolError::ConnectionClosed
            }
            other => other,
        });
    }
}
