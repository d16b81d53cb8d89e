//! Inbound router: appends wire frames into registered channels.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use super::MuxShared;
use super::codec::FrameCodec;

/// Single reader loop for one connection.
///
/// End-of-channel frames close and unregister their channel; data frames
/// append to the channel's buffer, blocking on a full one. That stall is
/// the inbound backpressure path. Frames for unknown ids are dropped with
/// a log line. On exit every remaining channel is force-closed so blocked
/// readers and writers observe end-of-stream instead of hanging.
pub(crate) async fn run<R>(mut frames: FramedRead<R, FrameCodec>, shared: Arc<MuxShared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::error!(error = %e, "read failure on pipe");
                break;
            }
            None => {
                tracing::debug!("pipe closed by peer");
                break;
            }
        };

        if frame.is_end_of_channel() {
            match shared.registry.unregister(frame.channel_id) {
                Some(channel) => channel.buffer().finish(),
                None => tracing::trace!(
                    channel = frame.channel_id,
                    "end-of-channel for unknown id"
                ),
            }
            continue;
        }

        match shared.registry.lookup(frame.channel_id) {
            Some(channel) => {
                let write = channel.buffer().write(&frame.payload);
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    result = write => {
                        if result.is_err() {
                            tracing::trace!(
                                channel = frame.channel_id,
                                "dropping bytes for a closed channel"
                            );
                        }
                    }
                }
            }
            None => tracing::warn!(
                channel = frame.channel_id,
                len = frame.payload.len(),
                "frame for unknown channel, dropping"
            ),
        }
    }

    tracing::debug!("inbound router exiting, force-closing remaining channels");
    shared.teardown();
}
