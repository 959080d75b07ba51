use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use crate::datagram::MAX_MTU;
use crate::send_pipeline::DatagramSocket;

#[derive(Clone, Debug)]
pub struct MessagingConfig {
    /// This is the maximum number of payload bytes per fragment. A fragment's header is added on
    ///  top of this, and the sum must be supported by all network connections between peers since
    ///  fragments must not be fragmented at the IP level. It can not exceed [MAX_MTU].
    pub mtu: usize,

    /// The maximum number of fragments sent ahead of acknowledgement
    pub send_window_fragments: usize,

    /// Silence from the receiver after which the sender retransmits from the last acknowledged
    ///  position
    pub resend_interval: Duration,
    /// Silence from the receiver after which a send is given up
    pub death_interval: Duration,

    /// Silence from the sender after which a partially received message is discarded
    pub receive_timeout: Duration,
    /// Minimum time between two resend requests for the same message
    pub resend_request_throttle: Duration,

    /// The interval of the end point's scheduler. Each tick flushes and processes up to
    ///  `io_batch_size` datagrams in each direction and drives all supervisors' timeouts.
    pub tick_interval: Duration,
    pub io_batch_size: usize,

    /// Datagrams waiting to be sent - both raw and message fragments. This is the backpressure
    ///  valve for send storms: beyond this, raw sends are rejected and fragment bursts truncated
    pub max_egress_queue_len: usize,
    /// Received datagrams waiting to be processed; datagrams beyond this are dropped
    pub max_ingress_queue_len: usize,

    /// New messages are dropped while this many messages are being received
    pub max_concurrent_receives: usize,

    /// The number of finished message ids that are remembered for de-duplication and for
    ///  re-sending lost final acks
    pub completed_id_capacity: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        MessagingConfig {
            mtu: MAX_MTU,
            send_window_fragments: 100,
            resend_interval: Duration::from_millis(400),
            death_interval: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(10),
            resend_request_throttle: Duration::from_millis(60),
            tick_interval: Duration::from_millis(1),
            io_batch_size: 20,
            max_egress_queue_len: 10_000,
            max_ingress_queue_len: 10_000,
            max_concurrent_receives: 2_000,
            completed_id_capacity: 10_000,
        }
    }
}

impl MessagingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu == 0 {
            bail!("MTU must not be 0");
        }
        if self.mtu > MAX_MTU {
            bail!("Cannot increase the MTU above {}, was {}", MAX_MTU, self.mtu);
        }
        if self.send_window_fragments == 0 {
            bail!("send window must hold at least one fragment");
        }
        if self.resend_interval >= self.death_interval {
            bail!("resend interval {:?} must be shorter than the death interval {:?}", self.resend_interval, self.death_interval);
        }
        if self.resend_request_throttle >= self.receive_timeout {
            bail!("resend request throttle {:?} must be shorter than the receive timeout {:?}", self.resend_request_throttle, self.receive_timeout);
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        if self.io_batch_size == 0 || self.max_egress_queue_len == 0 || self.max_ingress_queue_len == 0 {
            bail!("I/O batch size and queue lengths must not be zero");
        }
        if self.completed_id_capacity == 0 {
            bail!("completed id capacity must not be zero");
        }
        Ok(())
    }

    /// The interval at which send supervisors check for silence
    pub fn send_think_interval(&self) -> Duration {
        self.resend_interval.min(self.death_interval)
    }
}

pub struct BindOptions {
    /// port 0 means 'any free port'
    pub addr: SocketAddr,
    /// Use an already bound socket instead of binding a new one; `addr` is ignored in this case
    pub existing_socket: Option<Arc<dyn DatagramSocket>>,
}

impl BindOptions {
    pub fn new(addr: SocketAddr) -> BindOptions {
        BindOptions {
            addr,
            existing_socket: None,
        }
    }

    pub fn with_socket(socket: Arc<dyn DatagramSocket>) -> BindOptions {
        BindOptions {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            existing_socket: Some(socket),
        }
    }
}

impl Default for BindOptions {
    fn default() -> Self {
        BindOptions::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }
}
