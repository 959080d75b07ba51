use std::collections::VecDeque;
use std::net::SocketAddr;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};
use crate::datagram::{Datagram, MAX_DATAGRAM_LEN};
use crate::error::MessagingError;

/// This is an abstraction for the datagram endpoint, introduced to allow wrapping or replacing
///  the actual UDP socket (e.g. for simulating lossy networks)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize> {
        UdpSocket::send_to(self, buf, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// This is how supervisors transmit. They never touch the socket directly, so all I/O goes
///  through the end point's egress queue.
#[cfg_attr(test, automock)]
pub trait EgressSink {
    /// returns `false` if the datagram was dropped because of backpressure
    fn enqueue(&mut self, to: SocketAddr, datagram: &Datagram) -> bool;
}

/// A scratch block is shared by many encoded datagrams, so encoding does not allocate per
///  datagram
const SCRATCH_BLOCK_LEN: usize = 64 * MAX_DATAGRAM_LEN;

struct QueuedDatagram {
    to: SocketAddr,
    buf: Bytes,
    on_sent: Option<oneshot::Sender<Result<(), MessagingError>>>,
}

/// The bounded queue of datagrams waiting to be sent
pub struct EgressQueue {
    max_len: usize,
    scratch: BytesMut,
    queue: VecDeque<QueuedDatagram>,
}

impl EgressQueue {
    pub fn new(max_len: usize) -> EgressQueue {
        EgressQueue {
            max_len,
            scratch: BytesMut::with_capacity(SCRATCH_BLOCK_LEN),
            queue: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.max_len
    }

    /// Queue an already serialized datagram. `on_sent` is notified when the datagram was handed
    ///  to the socket.
    ///
    /// NB: The caller is responsible for checking [EgressQueue::is_full] first
    pub fn enqueue_raw(&mut self, to: SocketAddr, buf: Bytes, on_sent: Option<oneshot::Sender<Result<(), MessagingError>>>) {
        debug_assert!(!self.is_full());
        self.queue.push_back(QueuedDatagram { to, buf, on_sent });
    }

    /// Hand up to `max_batch` queued datagrams to the socket, returning the number of datagrams
    ///  sent
    pub async fn flush(&mut self, socket: &dyn DatagramSocket, max_batch: usize) -> usize {
        let mut num_sent = 0;
        while num_sent < max_batch {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            num_sent += 1;

            trace!("sending {} bytes to {:?}", queued.buf.len(), queued.to);
            let result = match socket.send_to(&queued.buf, queued.to).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    error!("error sending datagram to {:?}: {}", queued.to, e);
                    Err(MessagingError::Send(e))
                }
            };

            if let Some(on_sent) = queued.on_sent {
                let _ = on_sent.send(result);
            }
        }
        num_sent
    }

    #[cfg(test)]
    pub fn queued_datagrams(&self) -> Vec<(SocketAddr, Datagram)> {
        self.queue.iter()
            .map(|q| {
                let mut buf = q.buf.clone();
                (q.to, Datagram::deser(&mut buf).expect("queued datagram should be valid"))
            })
            .collect()
    }

    #[cfg(test)]
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl EgressSink for EgressQueue {
    fn enqueue(&mut self, to: SocketAddr, datagram: &Datagram) -> bool {
        if self.is_full() {
            debug!("egress queue is full - dropping datagram for message {} to {:?}", datagram.message_id(), to);
            return false;
        }

        if self.scratch.capacity() < MAX_DATAGRAM_LEN {
            // this reclaims the block if all datagrams encoded into it were sent in the meantime
            self.scratch.reserve(SCRATCH_BLOCK_LEN);
        }
        datagram.ser(&mut self.scratch);
        let buf = self.scratch.split().freeze();

        self.queue.push_back(QueuedDatagram { to, buf, on_sent: None });
        true
    }
}
