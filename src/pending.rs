/// Outbound acknowledgement tracking.
///
/// Every MESSAGE/PRESENCE frame handed to the transport is recorded
/// here under its assigned `msgSerial`. ACK and NACK frames resolve the
/// recorded completions by serial range; connection loss without resume
/// rejects everything at once. Each completion fires exactly once.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ErrorInfo;

/// Outcome delivered to a publish caller.
pub type PublishResult = Result<(), ErrorInfo>;

pub type PublishSender = oneshot::Sender<PublishResult>;
pub type PublishReceiver = oneshot::Receiver<PublishResult>;

struct Pending {
    serial: i64,
    /// Messages carried by the frame; informational, one frame is one
    /// acknowledgement unit.
    message_count: u32,
    /// One sender per publish call coalesced into the frame.
    completions: Vec<PublishSender>,
}

impl Pending {
    fn resolve(self, result: PublishResult) {
        for completion in self.completions {
            let _ = completion.send(result.clone());
        }
    }
}

/// Serial assignment and ACK/NACK correlation for in-flight frames.
pub struct PendingMessageTracker {
    next_serial: i64,
    pending: VecDeque<Pending>,
}

impl Default for PendingMessageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingMessageTracker {
    pub fn new() -> Self {
        Self {
            next_serial: 0,
            pending: VecDeque::new(),
        }
    }

    /// Serial the next tracked frame will receive.
    pub fn next_serial(&self) -> i64 {
        self.next_serial
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Record a frame about to be sent; returns its serial and the
    /// completion the caller awaits.
    pub fn track(&mut self, message_count: u32) -> (i64, PublishReceiver) {
        let (tx, rx) = oneshot::channel();
        let serial = self.track_with(message_count, tx);
        (serial, rx)
    }

    /// Record a frame whose completion sender already exists (queued
    /// publishes carry their sender from the channel queue).
    pub fn track_with(&mut self, message_count: u32, completion: PublishSender) -> i64 {
        self.track_batch(message_count, vec![completion])
    }

    /// Record one frame that coalesces several publish calls; every
    /// completion resolves with the frame's single acknowledgement.
    pub fn track_batch(&mut self, message_count: u32, completions: Vec<PublishSender>) -> i64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.pending.push_back(Pending {
            serial,
            message_count,
            completions,
        });
        debug!(serial, message_count, "tracking outbound frame");
        serial
    }

    /// Resolve every frame whose serial falls in `[serial, serial+count)`.
    ///
    /// Frames older than the acknowledged range were skipped by the
    /// service; that is a protocol violation, so they are rejected (not
    /// silently dropped) and the gap is logged.
    pub fn on_ack(&mut self, serial: i64, count: u32) {
        let end = serial + count as i64;
        let mut acked = 0u32;

        while let Some(head) = self.pending.front() {
            if head.serial < serial {
                warn!(
                    expected = serial,
                    found = head.serial,
                    "ACK skipped over tracked serials; rejecting skipped frame"
                );
                let skipped = self.pending.pop_front().expect("head exists");
                skipped.resolve(Err(ErrorInfo::new(
                    80013,
                    500,
                    "message skipped by acknowledgement sequence",
                )));
                continue;
            }
            if head.serial >= end {
                break;
            }
            let done = self.pending.pop_front().expect("head exists");
            acked += 1;
            done.resolve(Ok(()));
        }

        if i64::from(acked) < end - serial {
            warn!(
                serial,
                count,
                resolved = acked,
                "ACK range not fully covered by tracked serials"
            );
        }
    }

    /// Reject every frame whose serial falls in `[serial, serial+count)`.
    pub fn on_nack(&mut self, serial: i64, count: u32, error: ErrorInfo) {
        let end = serial + count as i64;
        let mut nacked = 0u32;

        while let Some(head) = self.pending.front() {
            if head.serial >= end {
                break;
            }
            let rejected = self.pending.pop_front().expect("head exists");
            if rejected.serial < serial {
                warn!(
                    expected = serial,
                    found = rejected.serial,
                    "NACK skipped over tracked serials; rejecting skipped frame"
                );
            } else {
                nacked += 1;
            }
            rejected.resolve(Err(error.clone()));
        }

        if i64::from(nacked) < end - serial {
            warn!(
                serial,
                count,
                resolved = nacked,
                "NACK range not fully covered by tracked serials"
            );
        }
    }

    /// Reject every outstanding frame (resume failure, terminal close).
    pub fn fail_all(&mut self, error: ErrorInfo) {
        if !self.pending.is_empty() {
            debug!(outstanding = self.pending.len(), "rejecting all in-flight frames");
        }
        let drained: Vec<Pending> = self.pending.drain(..).collect();
        for pending in drained {
            pending.resolve(Err(error.clone()));
        }
    }

    /// Fresh (non-resumed) connection: serials restart at zero.
    pub fn reset(&mut self, error: ErrorInfo) {
        self.fail_all(error);
        self.next_serial = 0;
    }
}
