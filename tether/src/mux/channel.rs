//! Logical channels and the reader/writer handles handed to callers.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;

use super::buffer::ByteBuffer;
use crate::error::ChannelClosed;

/// Which way a channel's bytes flow relative to the physical pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Filled locally, drained onto the wire by the outbound pump.
    ToWire,
    /// Filled from the wire by the inbound router, drained locally.
    FromWire,
}

pub(crate) struct Channel {
    id: i64,
    direction: Direction,
    buffer: ByteBuffer,
}

impl Channel {
    pub(crate) fn new(
        id: i64,
        direction: Direction,
        capacity: usize,
        wake: Option<Arc<Notify>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            direction,
            buffer: ByteBuffer::new(capacity, wake),
        })
    }

    pub(crate) fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn buffer(&self) -> &ByteBuffer {
        &self.buffer
    }
}

/// Write half of a to-wire channel. Dropping the writer closes the
/// channel, which eventually puts the end-of-channel frame on the wire.
pub struct ChannelWriter {
    channel: Arc<Channel>,
}

impl ChannelWriter {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        debug_assert_eq!(channel.direction(), Direction::ToWire);
        Self { channel }
    }

    pub fn id(&self) -> i64 {
        self.channel.id()
    }

    /// Queue all of `bytes` for transmission, blocking on backpressure.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ChannelClosed> {
        self.channel.buffer().write(bytes).await
    }

    /// Close the stream. Buffered bytes still go out, followed by the
    /// end-of-channel marker.
    pub fn close(&self) {
        self.channel.buffer().finish();
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.channel.buffer().finish();
    }
}

/// Read half of a from-wire channel.
pub struct ChannelReader {
    channel: Arc<Channel>,
}

impl ChannelReader {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        debug_assert_eq!(channel.direction(), Direction::FromWire);
        Self { channel }
    }

    pub fn id(&self) -> i64 {
        self.channel.id()
    }

    /// Read up to `buf.len()` bytes; 0 means end-of-stream.
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        self.channel.buffer().read(buf).await
    }

    /// Take the next buffered chunk, up to `max` bytes. `None` at
    /// end-of-stream.
    pub async fn next_chunk(&self, max: usize) -> Option<Bytes> {
        self.channel.buffer().next_chunk(max).await
    }

    /// Read until end-of-stream and return everything.
    pub async fn read_to_end(&self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk(64 * 1024).await {
            out.extend_from_slice(&chunk);
        }
        out
    }
}
