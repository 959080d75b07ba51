use std::net::SocketAddr;
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::config::MessagingConfig;
use crate::datagram::Datagram;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::send_pipeline::EgressSink;

#[derive(Debug, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// the fragment was accepted, but the message is not complete yet
    InProgress,
    /// the final fragment was accepted, this is the reassembled message
    Complete(Bytes),
    /// the fragment did not contribute to the message (stale, duplicate or out of order)
    Ignored,
}

/// Reassembles a single inbound message from fragments that arrive strictly in order: a
///  fragment that does not start exactly at the accepted length is never buffered, it triggers
///  a (throttled) resend request instead.
pub struct ReceiveSupervisor {
    config: Arc<MessagingConfig>,
    message_id: u32,
    peer_addr: SocketAddr,

    fragments: Vec<Bytes>,
    accepted_len: u32,

    done: bool,
    last_activity: Instant,
    last_resend_request: Option<Instant>,
    next_think: Instant,
}

impl ReceiveSupervisor {
    pub fn new(config: Arc<MessagingConfig>, message_id: u32, peer_addr: SocketAddr, now: Instant) -> ReceiveSupervisor {
        let next_think = now + config.receive_timeout;
        ReceiveSupervisor {
            config,
            message_id,
            peer_addr,
            fragments: Vec::new(),
            accepted_len: 0,
            done: false,
            last_activity: now,
            last_resend_request: None,
            next_think,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn accepted_len(&self) -> u32 {
        self.accepted_len
    }

    pub fn on_data_part(&mut self, position: u32, data: Bytes, is_last: bool, egress: &mut dyn EgressSink, now: Instant) -> ReceiveStatus {
        if self.done {
            return ReceiveStatus::Ignored;
        }
        self.last_activity = now;

        if position < self.accepted_len {
            trace!("message {}: stale fragment at {} (accepted {}) - ignoring", self.message_id, position, self.accepted_len);
            return ReceiveStatus::Ignored;
        }

        if position > self.accepted_len {
            let throttled = self.last_resend_request
                .map(|t| now.saturating_duration_since(t) <= self.config.resend_request_throttle)
                .unwrap_or(false);
            if throttled {
                trace!("message {}: fragment at {} out of order - resend request throttled", self.message_id, position);
            }
            else {
                debug!("message {}: fragment at {} out of order, requesting resend from {}", self.message_id, position, self.accepted_len);
                self.last_resend_request = Some(now);
                egress.enqueue(self.peer_addr, &Datagram::DataResend { message_id: self.message_id, position: self.accepted_len });
            }
            return ReceiveStatus::Ignored;
        }

        let data_len: u32 = data.len().prechecked_cast();
        let Some(new_len) = self.accepted_len.checked_add(data_len) else {
            warn!("message {}: fragment at {} would overflow the message length - ignoring", self.message_id, position);
            return ReceiveStatus::Ignored;
        };

        self.accepted_len = new_len;
        if !data.is_empty() {
            self.fragments.push(data);
        }
        trace!("message {}: accepted fragment at {}, acknowledging {}", self.message_id, position, self.accepted_len);
        egress.enqueue(self.peer_addr, &Datagram::DataAck { message_id: self.message_id, position: self.accepted_len });

        if is_last {
            debug!("message {} from {:?} complete ({} bytes)", self.message_id, self.peer_addr, self.accepted_len);
            self.done = true;
            return ReceiveStatus::Complete(self.assemble());
        }
        ReceiveStatus::InProgress
    }

    fn assemble(&mut self) -> Bytes {
        if self.fragments.len() == 1 {
            return self.fragments.pop().unwrap_or_default();
        }

        let mut result = BytesMut::with_capacity(self.accepted_len.safe_cast());
        for fragment in self.fragments.drain(..) {
            result.extend_from_slice(&fragment);
        }
        result.freeze()
    }

    /// The periodic think-step, returning `true` if the receive timed out and was abandoned
    pub fn on_tick(&mut self, now: Instant) -> bool {
        if self.done {
            return false;
        }
        if now < self.next_think {
            return false;
        }
        self.next_think = now + self.config.receive_timeout;

        let silence = now.saturating_duration_since(self.last_activity);
        if silence > self.config.receive_timeout {
            debug!("message {}: no fragment from {:?} for {:?} - abandoning receive", self.message_id, self.peer_addr, silence);
            self.abandon();
            return true;
        }
        false
    }

    pub fn abandon(&mut self) {
        self.done = true;
        self.fragments.clear();
    }
}
