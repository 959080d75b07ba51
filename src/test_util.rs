use std::net::{SocketAddr, SocketAddrV4, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::trace;
use crate::datagram::{DataPart, Datagram};
use crate::send_pipeline::{DatagramSocket, EgressSink};

/// convenience for unit tests that need some peer address but do not do actual I/O
pub fn peer() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 4711))
}

/// Records everything enqueued, never applying backpressure
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Vec<(SocketAddr, Datagram)>,
}

impl RecordingSink {
    pub fn clear(&mut self) {
        self.sent.clear();
    }

    pub fn data_parts(&self) -> Vec<DataPart> {
        self.sent.iter()
            .filter_map(|(_, d)| match d {
                Datagram::DataPart(part) => Some(part.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn positions(&self) -> Vec<u32> {
        self.data_parts().into_iter()
            .map(|p| p.position)
            .collect()
    }
}

impl EgressSink for RecordingSink {
    fn enqueue(&mut self, to: SocketAddr, datagram: &Datagram) -> bool {
        self.sent.push((to, datagram.clone()));
        true
    }
}

/// A UDP socket that drops a given fraction of outgoing datagrams and delays the rest
pub struct LossySocket {
    inner: Arc<UdpSocket>,
    loss_rate: f64,
    latency: Duration,
}

impl LossySocket {
    pub async fn bind_localhost(loss_rate: f64, latency: Duration) -> anyhow::Result<LossySocket> {
        let inner = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
        Ok(LossySocket {
            inner: Arc::new(inner),
            loss_rate,
            latency,
        })
    }
}

#[async_trait]
impl DatagramSocket for LossySocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize> {
        let is_dropped = rand::rng().random_bool(self.loss_rate);
        if is_dropped {
            trace!("simulating loss of {} bytes to {:?}", buf.len(), to);
            return Ok(buf.len());
        }

        if self.latency.is_zero() {
            return self.inner.send_to(buf, to).await;
        }

        let inner = self.inner.clone();
        let latency = self.latency;
        let delayed = buf.to_vec();
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let _ = inner.send_to(&delayed, to).await;
        });
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
