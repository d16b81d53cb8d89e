//! Outbound pump: drains to-wire channels into frames on the pipe.

use std::sync::Arc;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;

use super::MuxShared;
use super::buffer::Drained;
use super::codec::{Frame, FrameCodec};

/// Single writer loop for one connection.
///
/// Wakes on the shared signal or the fallback tick, then scans every
/// to-wire channel once per pass, round-robin from just past the last
/// channel served so a busy channel cannot starve the rest. Each pass is
/// followed by a flush; passes repeat until one moves nothing.
pub(crate) async fn run<W>(mut sink: FramedWrite<W, FrameCodec>, shared: Arc<MuxShared>)
where
    W: AsyncWrite + Unpin,
{
    let chunk_size = shared.config.chunk_size;
    let mut last_served: Option<i64> = None;

    'outer: loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break 'outer,
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(shared.config.pump_interval) => {}
        }

        loop {
            let mut moved = false;
            for id in scan_order(shared.registry.to_wire_ids(), last_served) {
                let Some(channel) = shared.registry.lookup(id) else {
                    continue;
                };
                match channel.buffer().try_drain(chunk_size) {
                    Drained::Data(bytes) => {
                        if let Err(e) = sink.feed(Frame::data(id, bytes)).await {
                            tracing::error!(error = %e, "write failure on pipe, shutting down");
                            shared.teardown();
                            return;
                        }
                        moved = true;
                        last_served = Some(id);
                    }
                    Drained::Finished => {
                        // Unregister first so the marker goes out exactly once.
                        shared.registry.unregister(id);
                        tracing::trace!(channel = id, "channel drained, sending end-of-channel");
                        if let Err(e) = sink.feed(Frame::end_of_channel(id)).await {
                            tracing::error!(error = %e, "write failure on pipe, shutting down");
                            shared.teardown();
                            return;
                        }
                        moved = true;
                        last_served = Some(id);
                    }
                    Drained::Empty => {}
                }
            }

            if let Err(e) = sink.flush().await {
                tracing::error!(error = %e, "flush failure on pipe, shutting down");
                shared.teardown();
                return;
            }
            if !moved {
                break;
            }
            if shared.shutdown.is_cancelled() {
                break 'outer;
            }
        }
    }

    let _ = sink.flush().await;
    tracing::debug!("outbound pump exiting");
}

/// Rotate the sorted id list so the scan starts just after `last_served`.
fn scan_order(mut ids: Vec<i64>, last_served: Option<i64>) -> Vec<i64> {
    if let Some(last) = last_served {
        let pivot = ids.partition_point(|&id| id <= last);
        ids.rotate_left(pivot);
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_starts_just_after_the_last_channel_served() {
        assert_eq!(scan_order(vec![1, 3, 5, 9], Some(3)), vec![5, 9, 1, 3]);
        assert_eq!(scan_order(vec![1, 3, 5, 9], Some(9)), vec![1, 3, 5, 9]);
        assert_eq!(scan_order(vec![1, 3, 5, 9], None), vec![1, 3, 5, 9]);
    }

    #[test]
    fn scan_handles_a_served_channel_that_is_gone() {
        // Channel 4 was unregistered between passes.
        assert_eq!(scan_order(vec![1, 3, 5, 9], Some(4)), vec![5, 9, 1, 3]);
    }
}
