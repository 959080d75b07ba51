use std::cmp::{max, min};
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::MessagingConfig;
use crate::datagram::{DataPart, Datagram};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::send_pipeline::EgressSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    RemoteNotResponding,
}

/// Owns the lifecycle of a single outbound message: fragmenting it, sending a window of
///  fragments at a time, re-sending on request or on silence, and detecting completion or death.
///
/// NB: There is no RTT estimation or backoff - retransmission is purely timeout based
pub struct SendSupervisor {
    config: Arc<MessagingConfig>,
    message_id: u32,
    peer_addr: SocketAddr,
    payload: Bytes,

    /// the highest position acknowledged by the receiver
    last_confirmed_pos: u32,
    /// the position after the highest fragment that was sent
    next_send_pos: u32,
    /// the payload length, once the final fragment was sent - an ack for this position
    ///  means the message is complete
    last_part_pos: Option<u32>,

    done: bool,
    last_activity: Instant,
    next_think: Instant,
}

impl SendSupervisor {
    /// NB: The payload's length must fit into a u32
    pub fn new(
        config: Arc<MessagingConfig>,
        message_id: u32,
        peer_addr: SocketAddr,
        payload: Bytes,
        egress: &mut dyn EgressSink,
        now: Instant,
    ) -> SendSupervisor {
        let next_think = now + config.send_think_interval();

        let mut result = SendSupervisor {
            config,
            message_id,
            peer_addr,
            payload,
            last_confirmed_pos: 0,
            next_send_pos: 0,
            last_part_pos: None,
            done: false,
            last_activity: now,
            next_think,
        };
        result.send_burst(0, egress);
        result
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn payload_len(&self) -> u32 {
        self.payload.len().prechecked_cast()
    }

    /// Send up to a window's worth of fragments starting at `start`, stopping after the final
    ///  fragment.
    fn send_burst(&mut self, start: u32, egress: &mut dyn EgressSink) {
        let payload_len = self.payload_len();
        // an empty message still has a single (empty) fragment at position 0
        if start > payload_len || (start == payload_len && payload_len > 0) {
            debug!("message {}: no data to send at position {} (length {}) - ignoring", self.message_id, start, payload_len);
            return;
        }

        let mut position: usize = start.safe_cast();
        for _ in 0..self.config.send_window_fragments {
            let end = min(position + self.config.mtu, self.payload.len());
            let is_last = end == self.payload.len();

            let datagram = Datagram::DataPart(DataPart {
                message_id: self.message_id,
                position: position.prechecked_cast(),
                is_last,
                data: self.payload.slice(position..end),
            });

            trace!("message {}: sending fragment {}..{} to {:?}", self.message_id, position, end, self.peer_addr);
            if !egress.enqueue(self.peer_addr, &datagram) {
                debug!("message {}: egress queue full, continuing after the next timeout", self.message_id);
                return;
            }

            self.next_send_pos = max(self.next_send_pos, end.prechecked_cast());
            if is_last {
                self.last_part_pos = Some(payload_len);
                return;
            }
            position = end;
        }
    }

    pub fn on_ack(&mut self, position: u32, egress: &mut dyn EgressSink, now: Instant) -> Option<SendOutcome> {
        if self.done {
            return None;
        }
        if position > self.next_send_pos {
            debug!("message {}: ack for position {} beyond sent data {} - ignoring", self.message_id, position, self.next_send_pos);
            return None;
        }
        self.last_activity = now;

        if self.last_part_pos == Some(position) {
            debug!("message {} to {:?} delivered ({} bytes)", self.message_id, self.peer_addr, position);
            self.done = true;
            return Some(SendOutcome::Delivered);
        }

        trace!("message {}: received ack for position {}", self.message_id, position);
        self.last_confirmed_pos = max(self.last_confirmed_pos, position);
        if position >= self.next_send_pos {
            // the receiver consumed everything sent so far: slide the window
            self.send_burst(position, egress);
        }
        None
    }

    pub fn on_resend_request(&mut self, position: u32, egress: &mut dyn EgressSink, now: Instant) {
        if self.done {
            return;
        }
        if position > self.next_send_pos {
            debug!("message {}: resend request for position {} beyond sent data {} - ignoring", self.message_id, position, self.next_send_pos);
            return;
        }
        self.last_activity = now;

        trace!("message {}: resend requested from position {}", self.message_id, position);
        self.send_burst(position, egress);
    }

    /// The periodic think-step; it does nothing unless the think interval has elapsed since the
    ///  previous one
    pub fn on_tick(&mut self, now: Instant, egress: &mut dyn EgressSink) -> Option<SendOutcome> {
        if self.done || now < self.next_think {
            return None;
        }
        self.next_think = now + self.config.send_think_interval();

        let silence = now.saturating_duration_since(self.last_activity);
        if silence > self.config.death_interval {
            debug!("message {}: no response from {:?} for {:?} - giving up", self.message_id, self.peer_addr, silence);
            self.done = true;
            return Some(SendOutcome::RemoteNotResponding);
        }
        if silence > self.config.resend_interval {
            debug!("message {}: no response from {:?} for {:?} - re-sending from position {}", self.message_id, self.peer_addr, silence, self.last_confirmed_pos);
            self.send_burst(self.last_confirmed_pos, egress);
        }
        None
    }

    /// Stop all further activity, e.g. because the end point is closing
    pub fn abandon(&mut self) {
        debug!("message {}: abandoning send", self.message_id);
        self.done = true;
    }
}
