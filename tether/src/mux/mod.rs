//! Channel multiplexing engine for one duplex pipe.
//!
//! A `Transport` owns the pipe after the preamble exchange and runs two
//! tasks against it: the outbound pump (`pump`) serializing to-wire channel
//! buffers into frames, and the inbound router (`router`) appending frames
//! into from-wire channel buffers. The registry is the only state shared
//! between them and the application.

mod buffer;
mod channel;
mod codec;
mod pump;
mod registry;
mod router;

pub use channel::{ChannelReader, ChannelWriter, Direction};
pub use codec::{CONTROL_REPLY_ID, CONTROL_REQUEST_ID, Frame, FrameCodec, PREAMBLE, align};
pub use registry::IdPool;

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::error::{RegistryError, TransportError};
use channel::Channel;
use registry::{IdAllocator, Registry};

/// State shared by the pump, the router, and application tasks.
pub(crate) struct MuxShared {
    pub(crate) registry: Registry,
    ids: IdAllocator,
    pub(crate) wake: Arc<Notify>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) config: TransportConfig,
}

impl MuxShared {
    fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            ids: IdAllocator::new(),
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    pub(crate) fn next_id(&self, pool: IdPool) -> i64 {
        self.ids.next(pool)
    }

    /// Register a to-wire channel and hand back its write half.
    pub(crate) fn open_to_wire(&self, id: i64) -> Result<ChannelWriter, RegistryError> {
        let channel = Channel::new(
            id,
            Direction::ToWire,
            self.config.channel_capacity,
            Some(Arc::clone(&self.wake)),
        );
        self.registry.register(Arc::clone(&channel))?;
        Ok(ChannelWriter::new(channel))
    }

    /// Register a from-wire channel and hand back its read half.
    pub(crate) fn open_from_wire(&self, id: i64) -> Result<ChannelReader, RegistryError> {
        let channel = Channel::new(id, Direction::FromWire, self.config.channel_capacity, None);
        self.registry.register(Arc::clone(&channel))?;
        Ok(ChannelReader::new(channel))
    }

    /// Kill the connection: cancel every task and force-close every
    /// channel so no reader or writer stays blocked.
    pub(crate) fn teardown(&self) {
        self.shutdown.cancel();
        for channel in self.registry.drain() {
            channel.buffer().abort();
        }
        self.wake.notify_one();
    }
}

type PipeReader = Box<dyn AsyncRead + Send + Unpin>;
type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live multiplexed connection over a duplex pipe.
pub struct Transport {
    shared: Arc<MuxShared>,
    io: Mutex<Option<(PipeReader, PipeWriter)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    /// Exchange preambles over `pipe`.
    ///
    /// The preamble read is the only operation in the transport with a
    /// timeout. No frame moves until [`Transport::start`]: register the
    /// reserved channels first so an early frame from the peer cannot
    /// land on an unknown id.
    pub async fn connect<S>(mut pipe: S, config: TransportConfig) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        pipe.write_all(&PREAMBLE).await?;
        pipe.flush().await?;

        let mut peer = [0u8; 9];
        match tokio::time::timeout(config.connect_timeout, pipe.read_exact(&mut peer)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(TransportError::Io(e)),
            Err(_) => return Err(TransportError::ConnectTimeout),
        }
        if peer != PREAMBLE {
            return Err(TransportError::PreambleMismatch(peer));
        }
        tracing::debug!("preamble exchanged");

        let shared = MuxShared::new(config);
        let (read_half, write_half) = tokio::io::split(pipe);
        let read_half: PipeReader = Box::new(read_half);
        let write_half: PipeWriter = Box::new(write_half);
        Ok(Self {
            shared,
            io: Mutex::new(Some((read_half, write_half))),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the outbound pump and inbound router. Frames only flow once
    /// this is called; calling it again does nothing.
    pub fn start(&self) {
        let io = {
            let mut guard = match self.io.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        let Some((read_half, write_half)) = io else {
            return;
        };
        tracing::debug!("starting pump and router");
        let pump_task = tokio::spawn(pump::run(
            FramedWrite::new(write_half, FrameCodec),
            Arc::clone(&self.shared),
        ));
        let router_task = tokio::spawn(router::run(
            FramedRead::new(read_half, FrameCodec),
            Arc::clone(&self.shared),
        ));
        let mut guard = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(pump_task);
        guard.push(router_task);
    }

    pub(crate) fn shared(&self) -> Arc<MuxShared> {
        Arc::clone(&self.shared)
    }

    /// Token cancelled when the connection dies, however it dies.
    pub fn closed(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Tear the connection down and wait for the pump and router to stop.
    pub async fn terminate(&self) {
        self.shared.teardown();
        {
            // Close the pipe even if frame processing never started.
            let mut guard = match self.io.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take();
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = match self.tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;

    fn test_config() -> TransportConfig {
        TransportConfig::new().with_connect_timeout(Duration::from_secs(2))
    }

    async fn pair() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(4096);
        let (a, b) = tokio::join!(
            Transport::connect(a, test_config()),
            Transport::connect(b, test_config()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        a.start();
        b.start();
        (a, b)
    }

    #[tokio::test]
    async fn channel_bytes_arrive_in_order_with_one_eof() {
        let (a, b) = pair().await;
        let writer = a.shared().open_to_wire(11).unwrap();
        let reader = b.shared().open_from_wire(11).unwrap();

        for piece in [&b"one "[..], b"two ", b"three"] {
            writer.write(piece).await.unwrap();
        }
        writer.close();

        assert_eq!(reader.read_to_end().await, b"one two three");
        let mut scratch = [0u8; 4];
        assert_eq!(reader.read(&mut scratch).await, 0, "EOF must be sticky");
    }

    #[tokio::test]
    async fn channels_do_not_bleed_into_each_other() {
        let (a, b) = pair().await;
        let w1 = a.shared().open_to_wire(21).unwrap();
        let w2 = a.shared().open_to_wire(22).unwrap();
        let r1 = b.shared().open_from_wire(21).unwrap();
        let r2 = b.shared().open_from_wire(22).unwrap();

        for round in 0..8 {
            w1.write(format!("left-{round};").as_bytes()).await.unwrap();
            w2.write(format!("right-{round};").as_bytes()).await.unwrap();
        }
        w1.close();
        w2.close();

        let left = String::from_utf8(r1.read_to_end().await).unwrap();
        let right = String::from_utf8(r2.read_to_end().await).unwrap();
        assert_eq!(
            left,
            "left-0;left-1;left-2;left-3;left-4;left-5;left-6;left-7;"
        );
        assert_eq!(
            right,
            "right-0;right-1;right-2;right-3;right-4;right-5;right-6;right-7;"
        );
    }

    #[tokio::test]
    async fn a_payload_larger_than_one_chunk_still_arrives_whole() {
        let (a, b) = pair().await;
        let writer = a.shared().open_to_wire(31).unwrap();
        let reader = b.shared().open_from_wire(31).unwrap();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let send = tokio::spawn(async move {
            writer.write(&payload).await.unwrap();
            writer.close();
        });

        assert_eq!(reader.read_to_end().await, expected);
        send.await.unwrap();
    }

    #[tokio::test]
    async fn peer_with_wrong_preamble_is_rejected() {
        let (ours, theirs) = tokio::io::duplex(64);
        let imposter = tokio::spawn(async move {
            let mut theirs = theirs;
            theirs.write_all(b"NOTRIGHT!").await.unwrap();
            theirs
        });

        let err = Transport::connect(ours, test_config()).await.unwrap_err();
        assert!(matches!(err, TransportError::PreambleMismatch(_)));
        drop(imposter.await.unwrap());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let config = TransportConfig::new().with_connect_timeout(Duration::from_millis(50));

        let err = Transport::connect(ours, config).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectTimeout));
    }

    #[tokio::test]
    async fn terminate_unblocks_the_remote_reader() {
        let (a, b) = pair().await;
        let _writer = a.shared().open_to_wire(41).unwrap();
        let reader = b.shared().open_from_wire(41).unwrap();

        let blocked = tokio::spawn(async move {
            let mut scratch = [0u8; 8];
            reader.read(&mut scratch).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        a.terminate().await;

        // The dead pipe ends b's router, which force-closes b's channels.
        assert_eq!(blocked.await.unwrap(), 0);
        b.terminate().await;
    }
}
