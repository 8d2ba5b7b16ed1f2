//! XEP-0198 stream management: counts stanzas in both directions and keeps
//! every sent stanza until the peer acknowledges it.
//!
//! Acknowledgements are consumed one queue entry per `<a/>`: each ack releases
//! the oldest unacknowledged stanza, whatever its `h` says. Together with a
//! request after every sent stanza this keeps the queue in step with the
//! peer; with batched requests the queue only shrinks by one per answer.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::error::SmError;
use crate::ns;
use crate::stanza::{Stanza, StanzaKind};

/// When to piggy-back an ack request on outbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    /// Send `<r/>` after every N-th stanza; `None` leaves requests to the caller.
    pub request_every: Option<u32>,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            request_every: Some(1),
        }
    }
}

impl AckPolicy {
    /// Whether the stanza with sequence number `seq` should be followed by a request.
    pub fn should_request(&self, seq: u32) -> bool {
        match self.request_every {
            Some(every) if every > 0 => seq % every == 0,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamManagement {
    sent: u32,
    received: u32,
    unacked: VecDeque<(u32, Stanza)>,
}

impl StreamManagement {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for any top-level element in the stream management namespace.
    pub fn is_management_frame(stanza: &Stanza) -> bool {
        stanza.namespace() == ns::STREAM_MANAGEMENT
    }

    /// `<enable/>`, optionally asking for a resumable session.
    pub fn enable_request(resume: bool) -> Stanza {
        let mut enable = Stanza::new("enable", ns::STREAM_MANAGEMENT);
        if resume {
            enable.set_attr("resume", "true");
        }
        enable
    }

    /// Records an outbound stanza, already written, and returns its sequence number.
    pub fn on_send(&mut self, stanza: Stanza) -> u32 {
        self.sent = self.sent.wrapping_add(1);
        self.unacked.push_back((self.sent, stanza));
        self.sent
    }

    /// Counts one inbound stanza.
    pub fn on_received(&mut self) {
        self.received = self.received.wrapping_add(1);
    }

    /// The `<a h='…'/>` answering a peer's `<r/>`.
    pub fn handle_request(&self) -> Stanza {
        let mut ack = Stanza::new("a", ns::STREAM_MANAGEMENT);
        ack.set_attr("h", self.received.to_string());
        ack
    }

    /// Releases the oldest unacknowledged stanza. `h` is logged, not used for
    /// accounting.
    pub fn on_ack_received(&mut self, h: u32) -> Option<(u32, Stanza)> {
        match self.unacked.pop_front() {
            Some(entry) => {
                debug!(h, seq = entry.0, remaining = self.unacked.len(), "Stanza acknowledged");
                Some(entry)
            }
            None => {
                warn!(h, sent = self.sent, "Ack received with nothing outstanding");
                None
            }
        }
    }

    /// `<r/>`. Does not touch the queue.
    pub fn request_ack(&self) -> Stanza {
        Stanza::new("r", ns::STREAM_MANAGEMENT)
    }

    /// Routes an inbound management frame. Returns the reply to send, if any.
    pub fn handle_frame(&mut self, frame: &Stanza) -> Result<Option<Stanza>, SmError> {
        match frame.kind() {
            StanzaKind::SmRequest => Ok(Some(self.handle_request())),
            StanzaKind::SmAck => {
                let h = frame
                    .attr("h")
                    .ok_or_else(|| SmError::InvalidAck("missing 'h' attribute".into()))?;
                let h = h.parse::<u32>().map_err(|_| {
                    warn!(h, "Ack with a non-numeric count");
                    SmError::InvalidAck(format!("'h' is not a counter: {}", h))
                })?;
                self.on_ack_received(h);
                Ok(None)
            }
            _ => {
                debug!(name = frame.name(), "Ignoring stream management frame");
                Ok(None)
            }
        }
    }

    pub fn has_unacked(&self) -> bool {
        !self.unacked.is_empty()
    }

    /// Takes the oldest unacknowledged stanza, e.g. to resend it on a new stream.
    pub fn pop_unacked(&mut self) -> Option<(u32, Stanza)> {
        self.unacked.pop_front()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn sent_count(&self) -> u32 {
        self.sent
    }

    pub fn received_count(&self) -> u32 {
        self.received
    }
}
