//! Single-writer FIFO that coalesces pending frames into one socket write
//! (§4.3). The connection actor owns one of these and drains it whenever
//! it has something to send; the actual `write_all`/`flush` happens one
//! level up, the way the teacher's `write_payload` builds one buffer and
//! issues one write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::Error;
use crate::protocol::request::Request;
use crate::protocol::version::ProtocolVersion;

/// Outcome handed back through a queue item's write-callback once the
/// coalesced buffer has been (or failed to be) flushed.
pub type WrittenSender = oneshot::Sender<Result<(), Error>>;

pub struct QueueItem {
    pub request: Request,
    pub stream_id: i16,
    pub custom_payload: Option<std::collections::HashMap<String, Vec<u8>>>,
    /// Shared with the operation handle; checked by `canBeWritten` so a
    /// cancelled request already sitting in the queue is dropped instead
    /// of serialized (§5 Cancellation).
    pub cancelled: Arc<AtomicBool>,
    pub written: WrittenSender,
}

pub struct WriteQueue {
    items: VecDeque<QueueItem>,
    coalescing_threshold: usize,
    sticky_error: bool,
}

fn cancelled_error() -> Error {
    Error::DriverInternalError("request cancelled or timed out before being written".to_string())
}

impl WriteQueue {
    pub fn new(coalescing_threshold: usize) -> Self {
        Self {
            items: VecDeque::new(),
            coalescing_threshold,
            sticky_error: false,
        }
    }

    /// Append an item; if the queue has already latched a socket error,
    /// fail it immediately instead of queuing (§4.3 step 5).
    pub fn push(&mut self, item: QueueItem) {
        if self.sticky_error {
            let _ = item
                .written
                .send(Err(Error::socket_closed(true, None)));
            return;
        }
        self.items.push_back(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drain items up to `coalescing_threshold` bytes, serializing each
    /// into one combined buffer and firing write-callbacks in enqueue
    /// order as each item is resolved (§4.3 steps 2-3).
    pub fn drain(&mut self, version: ProtocolVersion) -> Vec<u8> {
        let mut buf = Vec::new();
        while let Some(front) = self.items.front() {
            if !buf.is_empty() && buf.len() >= self.coalescing_threshold {
                break;
            }
            let item = self.items.pop_front().expect("front just checked");
            if item.cancelled.load(Ordering::Relaxed) {
                let _ = item.written.send(Err(cancelled_error()));
                continue;
            }
            match item.request.write(version, item.stream_id, item.custom_payload.as_ref()) {
                Ok(frame) => {
                    buf.extend_from_slice(&frame);
                    let _ = item.written.send(Ok(()));
                }
                Err(err) => {
                    let _ = item.written.send(Err(err));
                }
            }
        }
        buf
    }

    /// Latch a sticky socket error and fail every queued item with
    /// `requestNotWritten = true` (§4.3 step 5, §7 socket-error).
    pub fn fail_all(&mut self) {
        self.sticky_error = true;
        while let Some(item) = self.items.pop_front() {
            let _ = item.written.send(Err(Error::socket_closed(true, None)));
        }
    }
}
