//! Bounded byte queue backing one channel.
//!
//! One logical writer fills the queue, one logical reader drains it; both
//! block on the buffer's own notifies when it is full or empty. This
//! per-channel backpressure is the only flow control on the connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::ChannelClosed;

/// Result of a non-blocking drain attempt by the outbound pump.
#[derive(Debug)]
pub(crate) enum Drained {
    /// Nothing buffered yet; the channel stays registered.
    Empty,
    /// Up to the requested chunk of buffered bytes.
    Data(Bytes),
    /// The writer is done and the queue is empty: emit end-of-channel.
    Finished,
}

struct State {
    data: VecDeque<u8>,
    capacity: usize,
    /// Writer closed; remaining data still drains, then readers see EOF.
    finished: bool,
    /// Force-closed at teardown; readers see EOF immediately, writers fail.
    aborted: bool,
}

pub(crate) struct ByteBuffer {
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
    /// Outbound pump wake, shared across every to-wire channel.
    wake: Option<Arc<Notify>>,
}

impl ByteBuffer {
    pub(crate) fn new(capacity: usize, wake: Option<Arc<Notify>>) -> Self {
        Self {
            state: Mutex::new(State {
                data: VecDeque::new(),
                capacity,
                finished: false,
                aborted: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            wake,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the short critical section below is a bug
        // in this module; recover the guard rather than wedging the pipe.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append all of `bytes`, blocking whenever the queue is full.
    pub(crate) async fn write(&self, mut bytes: &[u8]) -> Result<(), ChannelClosed> {
        while !bytes.is_empty() {
            {
                let mut state = self.lock();
                if state.finished || state.aborted {
                    return Err(ChannelClosed);
                }
                let free = state.capacity.saturating_sub(state.data.len());
                if free > 0 {
                    let n = free.min(bytes.len());
                    state.data.extend(&bytes[..n]);
                    bytes = &bytes[n..];
                    drop(state);
                    self.readable.notify_one();
                    if let Some(wake) = &self.wake {
                        wake.notify_one();
                    }
                    continue;
                }
            }
            self.writable.notified().await;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes. Returns 0 at end-of-stream.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        loop {
            {
                let mut state = self.lock();
                if state.aborted {
                    return 0;
                }
                if !state.data.is_empty() {
                    let n = state.data.len().min(buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = state.data.pop_front().unwrap_or_default();
                    }
                    drop(state);
                    self.writable.notify_one();
                    return n;
                }
                if state.finished {
                    return 0;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Take up to `max` buffered bytes as one chunk. Returns `None` at
    /// end-of-stream.
    pub(crate) async fn next_chunk(&self, max: usize) -> Option<Bytes> {
        loop {
            {
                let mut state = self.lock();
                if state.aborted {
                    return None;
                }
                if !state.data.is_empty() {
                    let n = state.data.len().min(max);
                    let chunk = Bytes::from(state.data.drain(..n).collect::<Vec<u8>>());
                    drop(state);
                    self.writable.notify_one();
                    return Some(chunk);
                }
                if state.finished {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Non-blocking drain for the outbound pump.
    pub(crate) fn try_drain(&self, max: usize) -> Drained {
        let mut state = self.lock();
        if !state.data.is_empty() {
            let n = state.data.len().min(max);
            let chunk = Bytes::from(state.data.drain(..n).collect::<Vec<u8>>());
            drop(state);
            self.writable.notify_one();
            return Drained::Data(chunk);
        }
        if state.finished || state.aborted {
            Drained::Finished
        } else {
            Drained::Empty
        }
    }

    /// Writer-side close: buffered data still drains, then readers see EOF.
    pub(crate) fn finish(&self) {
        {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            state.finished = true;
        }
        self.readable.notify_one();
        self.writable.notify_one();
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
    }

    /// Force-close at teardown: pending readers and writers unblock, any
    /// buffered data is discarded.
    pub(crate) fn abort(&self) {
        {
            let mut state = self.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.data.clear();
        }
        self.readable.notify_one();
        self.writable.notify_one();
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().data.len()
    }
}
