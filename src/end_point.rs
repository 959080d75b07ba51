use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;
use crate::completed_ids::CompletedIdCache;
use crate::config::{BindOptions, MessagingConfig};
use crate::datagram::{DataPart, Datagram, MAX_DATAGRAM_LEN};
use crate::error::MessagingError;
use crate::safe_converter::PrecheckedCast;
use crate::receive_supervisor::{ReceiveStatus, ReceiveSupervisor};
use crate::send_pipeline::{DatagramSocket, EgressQueue, EgressSink};
use crate::send_supervisor::{SendOutcome, SendSupervisor};
use crate::util::random::{Random, RngRandom};

/// Datagrams longer than any valid datagram are truncated on receipt and subsequently rejected
///  by the decoder
const RECEIVE_BUF_LEN: usize = 2 * MAX_DATAGRAM_LEN;

/// A completely received message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    pub sender: SocketAddr,
}

type Reply = oneshot::Sender<Result<(), MessagingError>>;

enum Command {
    SendRaw { to: SocketAddr, buf: Bytes, reply: Reply },
    SendMessage { to: SocketAddr, payload: Bytes, reply: Reply },
    Close { reply: oneshot::Sender<()> },
}

/// The application's handle for a bound socket that sends and receives messages reliably.
///
/// All protocol state is owned by a driver task that is spawned by [EndPoint::bind]; this handle
///  only passes requests to it. Dropping the handle shuts the driver down.
pub struct EndPoint {
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
}

impl EndPoint {
    /// Bind a socket (or take over the socket passed in the options), spawning the tasks that
    ///  drive it. Completely received messages are delivered through the returned receiver,
    ///  exactly once each.
    ///
    /// NB: This must be called in the context of a tokio runtime
    pub async fn bind(options: BindOptions, config: MessagingConfig) -> Result<(EndPoint, mpsc::UnboundedReceiver<ReceivedMessage>), MessagingError> {
        config.validate()
            .map_err(|e| MessagingError::Config(e.to_string()))?;
        let config = Arc::new(config);

        let socket: Arc<dyn DatagramSocket> = match options.existing_socket {
            Some(socket) => socket,
            None => Arc::new(UdpSocket::bind(options.addr).await.map_err(MessagingError::Bind)?),
        };
        let local_addr = socket.local_addr().map_err(MessagingError::Bind)?;
        info!("bound socket to {:?}", local_addr);

        let (ingress_sender, ingress_receiver) = mpsc::channel(config.max_ingress_queue_len);
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (message_sender, message_receiver) = mpsc::unbounded_channel();

        let receive_loop = tokio::spawn(receive_loop(socket.clone(), ingress_sender));

        let mut driver = Driver::new(config, socket, Box::new(RngRandom {}), message_sender, ingress_receiver);
        driver.receive_loop = Some(receive_loop);
        tokio::spawn(driver.run(command_receiver));

        let end_point = EndPoint {
            local_addr,
            commands: command_sender,
        };
        Ok((end_point, message_receiver))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a single raw datagram without any reliability guarantees. This resolves when the
    ///  datagram was handed to the socket.
    pub async fn send(&self, buf: impl Into<Bytes>, to: SocketAddr) -> Result<(), MessagingError> {
        let (reply, result) = oneshot::channel();
        self.commands.send(Command::SendRaw { to, buf: buf.into(), reply })
            .map_err(|_| MessagingError::Closed)?;
        result.await
            .map_err(|_| MessagingError::Closed)?
    }

    /// Send a message reliably, fragmenting it as necessary. This resolves when the receiver
    ///  confirmed the entire message (or when the end point is closed), and fails if the
    ///  receiver stops responding.
    pub async fn send_message(&self, payload: impl Into<Bytes>, to: SocketAddr) -> Result<(), MessagingError> {
        let payload = payload.into();
        if payload.len() > u32::MAX as usize {
            warn!("message of {} bytes exceeds the maximum message size", payload.len());
            return Err(MessagingError::MessageTooLarge(payload.len()));
        }

        let (reply, result) = oneshot::channel();
        self.commands.send(Command::SendMessage { to, payload, reply })
            .map_err(|_| MessagingError::Closed)?;
        result.await
            .map_err(|_| MessagingError::Closed)?
    }

    /// Abandon all sends and receives in progress, and release the socket
    pub async fn close(&self) -> Result<(), MessagingError> {
        let (reply, result) = oneshot::channel();
        self.commands.send(Command::Close { reply })
            .map_err(|_| MessagingError::Closed)?;
        result.await
            .map_err(|_| MessagingError::Closed)
    }
}

async fn receive_loop(socket: Arc<dyn DatagramSocket>, ingress: mpsc::Sender<(Bytes, SocketAddr)>) {
    info!("starting receive loop");

    let mut buf = vec![0u8; RECEIVE_BUF_LEN];
    loop {
        let (num_read, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                error!("socket error: {}", e);
                continue;
            }
        };

        let datagram = Bytes::copy_from_slice(&buf[..num_read]);
        match ingress.try_send((datagram, from)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("ingress queue is full - dropping datagram from {:?}", from);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("end point closed - stopping receive loop");
                return;
            }
        }
    }
}

struct ActiveSend {
    supervisor: SendSupervisor,
    reply: Reply,
}

/// Owner of all protocol state, running on a single task
struct Driver {
    config: Arc<MessagingConfig>,
    socket: Arc<dyn DatagramSocket>,
    random: Box<dyn Random>,

    egress: EgressQueue,
    ingress: mpsc::Receiver<(Bytes, SocketAddr)>,
    received_messages: mpsc::UnboundedSender<ReceivedMessage>,

    send_supervisors: FxHashMap<u32, ActiveSend>,
    receive_supervisors: FxHashMap<u32, ReceiveSupervisor>,
    completed_ids: CompletedIdCache,

    receive_loop: Option<JoinHandle<()>>,
}

impl Driver {
    fn new(
        config: Arc<MessagingConfig>,
        socket: Arc<dyn DatagramSocket>,
        random: Box<dyn Random>,
        received_messages: mpsc::UnboundedSender<ReceivedMessage>,
        ingress: mpsc::Receiver<(Bytes, SocketAddr)>,
    ) -> Driver {
        Driver {
            egress: EgressQueue::new(config.max_egress_queue_len),
            completed_ids: CompletedIdCache::new(config.completed_id_capacity),
            config,
            socket,
            random,
            ingress,
            received_messages,
            send_supervisors: FxHashMap::default(),
            receive_supervisors: FxHashMap::default(),
            receive_loop: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut ticks = interval(self.config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                _ = ticks.tick() => {
                    self.on_tick().await;
                }
                command = commands.recv() => {
                    match command {
                        Some(Command::Close { reply }) => {
                            self.shutdown().await;
                            // release the socket before the caller is notified
                            drop(self);
                            let _ = reply.send(());
                            return;
                        }
                        Some(command) => {
                            self.on_command(command, Instant::now());
                        }
                        None => {
                            debug!("end point handle was dropped");
                            self.shutdown().await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        self.egress.flush(self.socket.as_ref(), self.config.io_batch_size).await;

        for _ in 0..self.config.io_batch_size {
            let Ok((buf, from)) = self.ingress.try_recv() else {
                break;
            };
            self.on_datagram(buf, from, Instant::now());
        }

        self.think(Instant::now());
    }

    fn on_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::SendRaw { to, buf, reply } => {
                if self.egress.is_full() {
                    warn!("egress queue is full - rejecting raw datagram to {:?}", to);
                    let _ = reply.send(Err(MessagingError::EgressQueueFull));
                    return;
                }
                trace!("queueing raw datagram of {} bytes to {:?}", buf.len(), to);
                self.egress.enqueue_raw(to, buf, Some(reply));
            }
            Command::SendMessage { to, payload, reply } => {
                let message_id = self.allocate_message_id();
                debug!("sending message {} ({} bytes) to {:?}", message_id, payload.len(), to);

                let supervisor = SendSupervisor::new(self.config.clone(), message_id, to, payload, &mut self.egress, now);
                self.send_supervisors.insert(message_id, ActiveSend { supervisor, reply });
            }
            Command::Close { .. } => {
                // handled by the caller because it terminates the driver
            }
        }
    }

    /// Draw random ids until one is neither in use nor recently completed. The id is recorded
    ///  in the completed-id cache right away so that it is not reused while it may still be
    ///  in flight.
    fn allocate_message_id(&mut self) -> u32 {
        loop {
            let candidate = self.random.next_u32();
            if candidate != 0 && !self.send_supervisors.contains_key(&candidate) && !self.completed_ids.contains(candidate) {
                self.completed_ids.insert(candidate, None);
                return candidate;
            }
            trace!("message id {} is not available - drawing another", candidate);
        }
    }

    fn on_datagram(&mut self, mut buf: Bytes, from: SocketAddr, now: Instant) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        let _entered = span.enter();

        trace!("received {} bytes from {:?}", buf.len(), from);

        let datagram = match Datagram::deser(&mut buf) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("dropping invalid datagram from {:?}: {}", from, e);
                return;
            }
        };

        match datagram {
            Datagram::DataPart(part) => self.on_data_part(part, from, now),
            Datagram::DataResend { message_id, position } => {
                match self.send_supervisors.get_mut(&message_id) {
                    Some(active) => active.supervisor.on_resend_request(position, &mut self.egress, now),
                    None => trace!("resend request for unknown message {} from {:?} - dropping", message_id, from),
                }
            }
            Datagram::DataAck { message_id, position } => {
                let outcome = match self.send_supervisors.get_mut(&message_id) {
                    Some(active) => active.supervisor.on_ack(position, &mut self.egress, now),
                    None => {
                        trace!("ack for unknown message {} from {:?} - dropping", message_id, from);
                        return;
                    }
                };
                if let Some(outcome) = outcome {
                    self.finish_send(message_id, outcome);
                }
            }
        }
    }

    fn on_data_part(&mut self, part: DataPart, from: SocketAddr, now: Instant) {
        let message_id = part.message_id;

        if !self.receive_supervisors.contains_key(&message_id) {
            if self.completed_ids.contains(message_id) {
                if let Some(final_len) = self.completed_ids.final_len(message_id) {
                    trace!("fragment for completed message {} - re-sending final ack", message_id);
                    self.egress.enqueue(from, &Datagram::DataAck { message_id, position: final_len });
                }
                else {
                    trace!("fragment for completed message {} without a recorded length - dropping", message_id);
                }
                return;
            }
            if part.position != 0 {
                trace!("fragment at position {} for unknown message {} - dropping", part.position, message_id);
                return;
            }
            if self.receive_supervisors.len() >= self.config.max_concurrent_receives {
                warn!("{} messages are being received concurrently - dropping new message {} from {:?}", self.receive_supervisors.len(), message_id, from);
                return;
            }

            debug!("starting to receive message {} from {:?}", message_id, from);
            self.receive_supervisors.insert(message_id, ReceiveSupervisor::new(self.config.clone(), message_id, from, now));
        }

        let Some(supervisor) = self.receive_supervisors.get_mut(&message_id) else {
            return;
        };
        if let ReceiveStatus::Complete(payload) = supervisor.on_data_part(part.position, part.data, part.is_last, &mut self.egress, now) {
            let sender = supervisor.peer_addr();
            self.receive_supervisors.remove(&message_id);

            self.completed_ids.insert(message_id, Some(payload.len().prechecked_cast()));
            if self.received_messages.send(ReceivedMessage { payload, sender }).is_err() {
                debug!("application stopped listening - discarding message {}", message_id);
            }
        }
    }

    fn think(&mut self, now: Instant) {
        let mut finished_sends = Vec::new();
        for (&message_id, active) in self.send_supervisors.iter_mut() {
            if let Some(outcome) = active.supervisor.on_tick(now, &mut self.egress) {
                finished_sends.push((message_id, outcome));
            }
        }
        for (message_id, outcome) in finished_sends {
            self.finish_send(message_id, outcome);
        }

        self.receive_supervisors.retain(|_, supervisor| !supervisor.on_tick(now));
    }

    fn finish_send(&mut self, message_id: u32, outcome: SendOutcome) {
        let Some(active) = self.send_supervisors.remove(&message_id) else {
            return;
        };
        let result = match outcome {
            SendOutcome::Delivered => Ok(()),
            SendOutcome::RemoteNotResponding => Err(MessagingError::RemoteNotResponding),
        };
        let _ = active.reply.send(result);
    }

    /// Abandon everything: pending message sends resolve successfully, partial receives are
    ///  discarded
    async fn shutdown(&mut self) {
        info!("closing end point: abandoning {} sends and {} receives", self.send_supervisors.len(), self.receive_supervisors.len());

        if let Some(receive_loop) = self.receive_loop.take() {
            receive_loop.abort();
            // the aborted task drops its socket reference before the join handle resolves
            let _ = receive_loop.await;
        }

        for (_, mut active) in self.send_supervisors.drain() {
            active.supervisor.abandon();
            let _ = active.reply.send(Ok(()));
        }
        for (_, mut supervisor) in self.receive_supervisors.drain() {
            supervisor.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use bytes::BytesMut;
    use rstest::rstest;
    use tokio::time::timeout;
    use crate::send_pipeline::MockDatagramSocket;
    use crate::test_util::{peer, LossySocket};
    use crate::util::random::MockRandom;

    fn localhost() -> BindOptions {
        BindOptions::new(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }

    fn test_driver(config: MessagingConfig, random: MockRandom) -> (Driver, mpsc::UnboundedReceiver<ReceivedMessage>) {
        let (message_sender, message_receiver) = mpsc::unbounded_channel();
        let (_, ingress_receiver) = mpsc::channel(1);
        let driver = Driver::new(Arc::new(config), Arc::new(MockDatagramSocket::new()), Box::new(random), message_sender, ingress_receiver);
        (driver, message_receiver)
    }

    fn encoded(datagram: &Datagram) -> Bytes {
        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        buf.freeze()
    }

    fn part(message_id: u32, position: u32, is_last: bool, data: &'static [u8]) -> Bytes {
        encoded(&Datagram::DataPart(DataPart {
            message_id,
            position,
            is_last,
            data: Bytes::from_static(data),
        }))
    }

    fn ack(message_id: u32, position: u32) -> Datagram {
        Datagram::DataAck { message_id, position }
    }

    #[test]
    fn test_dispatch_receive_and_reack() {
        let now = Instant::now();
        let (mut driver, mut messages) = test_driver(MessagingConfig::default(), MockRandom::new());

        driver.on_datagram(part(5, 0, false, b"ab"), peer(), now);
        driver.on_datagram(part(5, 2, true, b"c"), peer(), now);
        assert_eq!(messages.try_recv().unwrap(), ReceivedMessage { payload: Bytes::from_static(b"abc"), sender: peer() });
        assert!(driver.receive_supervisors.is_empty());
        assert_eq!(driver.completed_ids.final_len(5), Some(3));
        assert_eq!(driver.egress.queued_datagrams(), vec![(peer(), ack(5, 2)), (peer(), ack(5, 3))]);
        driver.egress.clear();

        // the final ack got lost, the sender re-sends
        driver.on_datagram(part(5, 2, true, b"c"), peer(), now);
        driver.on_datagram(part(5, 0, false, b"ab"), peer(), now);
        assert_eq!(driver.egress.queued_datagrams(), vec![(peer(), ack(5, 3)), (peer(), ack(5, 3))]);
        assert!(messages.try_recv().is_err());
        assert!(driver.receive_supervisors.is_empty());
    }

    #[test]
    fn test_dispatch_zero_length_reack() {
        let now = Instant::now();
        let (mut driver, mut messages) = test_driver(MessagingConfig::default(), MockRandom::new());

        driver.on_datagram(part(5, 0, true, b""), peer(), now);
        assert_eq!(messages.try_recv().unwrap().payload, Bytes::new());
        driver.egress.clear();

        driver.on_datagram(part(5, 0, true, b""), peer(), now);
        assert_eq!(driver.egress.queued_datagrams(), vec![(peer(), ack(5, 0))]);
        assert!(messages.try_recv().is_err());
    }

    #[rstest]
    #[case::unknown_non_zero_position(part(9, 10, false, b"x"))]
    #[case::foreign_protocol(Bytes::from_static(b"\x12\x34\x56\x78\x02\0\0\0\x01\0\0\0\x01"))]
    #[case::truncated(Bytes::from_static(&[0x55, 0x44, 0x4d]))]
    #[case::unknown_kind(Bytes::from(vec![0x55, 0x44, 0x4d, 0x31, 9, 0, 0, 0, 1, 0, 0, 0, 0]))]
    #[case::ack_for_unknown_message(encoded(&ack(9, 10)))]
    #[case::resend_for_unknown_message(encoded(&Datagram::DataResend { message_id: 9, position: 0 }))]
    fn test_dispatch_dropped(#[case] datagram: Bytes) {
        let (mut driver, mut messages) = test_driver(MessagingConfig::default(), MockRandom::new());

        driver.on_datagram(datagram, peer(), Instant::now());

        assert!(driver.egress.is_empty());
        assert!(driver.receive_supervisors.is_empty());
        assert!(driver.completed_ids.is_empty());
        assert!(messages.try_recv().is_err());
    }

    #[test]
    fn test_dispatch_concurrent_receive_cap() {
        let now = Instant::now();
        let config = MessagingConfig {
            max_concurrent_receives: 2,
            ..Default::default()
        };
        let (mut driver, _messages) = test_driver(config, MockRandom::new());

        for message_id in 1..=3 {
            driver.on_datagram(part(message_id, 0, false, b"a"), peer(), now);
        }
        assert_eq!(driver.receive_supervisors.len(), 2);
        assert!(!driver.receive_supervisors.contains_key(&3));

        // active receives are still served at the cap
        driver.on_datagram(part(1, 1, true, b"b"), peer(), now);
        assert_eq!(driver.receive_supervisors.len(), 1);
        driver.on_datagram(part(3, 0, false, b"a"), peer(), now);
        assert!(driver.receive_supervisors.contains_key(&3));
    }

    #[test]
    fn test_receive_timeout_removes_supervisor() {
        let start = Instant::now();
        let (mut driver, _messages) = test_driver(MessagingConfig::default(), MockRandom::new());

        driver.on_datagram(part(1, 0, false, b"a"), peer(), start);
        driver.think(start + Duration::from_secs(5));
        assert_eq!(driver.receive_supervisors.len(), 1);

        driver.think(start + Duration::from_secs(11));
        assert!(driver.receive_supervisors.is_empty());
        assert!(!driver.completed_ids.contains(1));
    }

    #[test]
    fn test_message_id_allocation_skips_unavailable() {
        let mut random = MockRandom::new();
        let mut draws = vec![0, 7, 8, 7, 9].into_iter();
        random.expect_next_u32()
            .returning(move || draws.next().unwrap());

        let (mut driver, _messages) = test_driver(MessagingConfig::default(), random);
        driver.completed_ids.insert(8, Some(1));

        assert_eq!(driver.allocate_message_id(), 7);
        assert_eq!(driver.allocate_message_id(), 9);
        assert!(driver.completed_ids.contains(7));
        assert!(driver.completed_ids.contains(9));
    }

    #[test]
    fn test_send_message_lifecycle() {
        let now = Instant::now();
        let mut random = MockRandom::new();
        random.expect_next_u32().return_const(42u32);
        let (mut driver, _messages) = test_driver(MessagingConfig::default(), random);

        let (reply, mut result) = oneshot::channel();
        driver.on_command(Command::SendMessage { to: peer(), payload: Bytes::from_static(b"hello"), reply }, now);
        assert_eq!(driver.egress.queued_datagrams(), vec![(peer(), Datagram::DataPart(DataPart {
            message_id: 42,
            position: 0,
            is_last: true,
            data: Bytes::from_static(b"hello"),
        }))]);
        assert!(result.try_recv().is_err());

        driver.on_datagram(encoded(&ack(42, 5)), peer(), now);
        assert!(matches!(result.try_recv(), Ok(Ok(()))));
        assert!(driver.send_supervisors.is_empty());
    }

    #[test]
    fn test_send_message_death() {
        let start = Instant::now();
        let mut random = MockRandom::new();
        random.expect_next_u32().return_const(42u32);
        let (mut driver, _messages) = test_driver(MessagingConfig::default(), random);

        let (reply, mut result) = oneshot::channel();
        driver.on_command(Command::SendMessage { to: peer(), payload: Bytes::from_static(b"hello"), reply }, start);

        for millis in (400..=10_000).step_by(400) {
            driver.think(start + Duration::from_millis(millis));
            assert!(result.try_recv().is_err());
        }
        driver.think(start + Duration::from_millis(10_400));
        assert!(matches!(result.try_recv(), Ok(Err(MessagingError::RemoteNotResponding))));
        assert!(driver.send_supervisors.is_empty());
    }

    #[test]
    fn test_raw_send_backpressure() {
        let config = MessagingConfig {
            max_egress_queue_len: 2,
            ..Default::default()
        };
        let (mut driver, _messages) = test_driver(config, MockRandom::new());

        let mut results = Vec::new();
        for _ in 0..3 {
            let (reply, result) = oneshot::channel();
            driver.on_command(Command::SendRaw { to: peer(), buf: Bytes::from_static(b"x"), reply }, Instant::now());
            results.push(result);
        }
        assert_eq!(driver.egress.len(), 2);
        assert!(matches!(results[2].try_recv(), Ok(Err(MessagingError::EgressQueueFull))));
    }

    #[tokio::test]
    async fn test_shutdown_resolves_sends() {
        let mut random = MockRandom::new();
        random.expect_next_u32().return_const(42u32);
        let (mut driver, _messages) = test_driver(MessagingConfig::default(), random);

        let (reply, mut result) = oneshot::channel();
        driver.on_command(Command::SendMessage { to: peer(), payload: Bytes::from_static(b"hello"), reply }, Instant::now());
        driver.on_datagram(part(1, 0, false, b"a"), peer(), Instant::now());

        driver.shutdown().await;
        assert!(matches!(result.try_recv(), Ok(Ok(()))));
        assert!(driver.send_supervisors.is_empty());
        assert!(driver.receive_supervisors.is_empty());
    }

    async fn bind_localhost(config: MessagingConfig) -> (EndPoint, mpsc::UnboundedReceiver<ReceivedMessage>) {
        EndPoint::bind(localhost(), config).await.unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_small_messages() {
        let (a, mut a_messages) = bind_localhost(MessagingConfig::default()).await;
        let (b, mut b_messages) = bind_localhost(MessagingConfig::default()).await;

        let (to_b, to_a) = tokio::join!(
            a.send_message(Bytes::from_static(b"ABC"), b.local_addr()),
            b.send_message(Bytes::from_static(b"CDE"), a.local_addr()),
        );
        to_b.unwrap();
        to_a.unwrap();

        assert_eq!(b_messages.recv().await.unwrap(), ReceivedMessage { payload: Bytes::from_static(b"ABC"), sender: a.local_addr() });
        assert_eq!(a_messages.recv().await.unwrap(), ReceivedMessage { payload: Bytes::from_static(b"CDE"), sender: b.local_addr() });
    }

    #[rstest]
    #[case::empty(0)]
    #[case::exact_mtu(1400)]
    #[case::two_times_u16(2 * 65535)]
    #[case::one_megabyte(1024 * 1024)]
    #[tokio::test]
    async fn test_big_messages(#[case] len: usize) {
        let (a, mut a_messages) = bind_localhost(MessagingConfig::default()).await;
        let (b, mut b_messages) = bind_localhost(MessagingConfig::default()).await;

        let payload: Bytes = (0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>().into();

        let (to_b, to_a) = tokio::join!(
            a.send_message(payload.clone(), b.local_addr()),
            b.send_message(payload.clone(), a.local_addr()),
        );
        to_b.unwrap();
        to_a.unwrap();

        assert_eq!(b_messages.recv().await.unwrap().payload, payload);
        assert_eq!(a_messages.recv().await.unwrap().payload, payload);
    }

    #[tokio::test]
    async fn test_death_timeout() {
        let config = MessagingConfig {
            resend_interval: Duration::from_millis(50),
            death_interval: Duration::from_millis(300),
            ..Default::default()
        };
        let (a, _a_messages) = bind_localhost(config).await;
        // a bound socket that never answers
        let silent = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();

        let start = std::time::Instant::now();
        let result = a.send_message(Bytes::from_static(b"hello"), silent.local_addr().unwrap()).await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(MessagingError::RemoteNotResponding)));
        assert!(elapsed >= Duration::from_millis(300), "failed after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "failed after {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_close_resolves_pending_sends() {
        let (a, _a_messages) = bind_localhost(MessagingConfig::default()).await;
        let silent = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let (send_result, close_result) = tokio::join!(
            a.send_message(Bytes::from_static(b"hello"), silent_addr),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                a.close().await
            },
        );
        send_result.unwrap();
        close_result.unwrap();

        assert!(matches!(a.send_message(Bytes::from_static(b"x"), silent_addr).await, Err(MessagingError::Closed)));
        assert!(matches!(a.send(Bytes::from_static(b"x"), silent_addr).await, Err(MessagingError::Closed)));
        assert!(matches!(a.close().await, Err(MessagingError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_releases_socket() {
        let (mut a, _a_messages) = bind_localhost(MessagingConfig::default()).await;
        for _ in 0..100 {
            let addr = a.local_addr();
            a.close().await.unwrap();

            let (rebound, _messages) = EndPoint::bind(BindOptions::new(addr), MessagingConfig::default()).await
                .expect("the address should be free after close");
            assert_eq!(rebound.local_addr(), addr);
            a = rebound;
        }
    }

    #[tokio::test]
    async fn test_raw_send() {
        let (a, _a_messages) = bind_localhost(MessagingConfig::default()).await;
        let raw = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();

        a.send(Bytes::from_static(b"raw datagram"), raw.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 100];
        let (len, from) = timeout(Duration::from_secs(5), raw.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..len], b"raw datagram");
        assert_eq!(from, a.local_addr());
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let (a, _a_messages) = bind_localhost(MessagingConfig::default()).await;

        let result = EndPoint::bind(BindOptions::new(a.local_addr()), MessagingConfig::default()).await;
        assert!(matches!(result, Err(MessagingError::Bind(_))));
    }

    #[rstest]
    #[case::mtu_too_big(MessagingConfig { mtu: 1401, ..Default::default() })]
    #[case::resend_after_death(MessagingConfig { resend_interval: Duration::from_secs(20), ..Default::default() })]
    #[tokio::test]
    async fn test_bind_invalid_config(#[case] config: MessagingConfig) {
        let result = EndPoint::bind(localhost(), config).await;
        assert!(matches!(result, Err(MessagingError::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_existing_socket() {
        let socket = Arc::new(UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap());
        let socket_addr = socket.local_addr().unwrap();

        let (a, mut a_messages) = EndPoint::bind(BindOptions::with_socket(socket), MessagingConfig::default()).await.unwrap();
        assert_eq!(a.local_addr(), socket_addr);

        let (b, _b_messages) = bind_localhost(MessagingConfig::default()).await;
        b.send_message(Bytes::from_static(b"over existing socket"), socket_addr).await.unwrap();
        assert_eq!(a_messages.recv().await.unwrap().payload, Bytes::from_static(b"over existing socket"));
    }

    #[tokio::test]
    async fn test_new_receive_cap_over_network() {
        let config = MessagingConfig {
            max_concurrent_receives: 3,
            ..Default::default()
        };
        let (a, mut a_messages) = bind_localhost(config).await;
        let raw = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await.unwrap();

        // five unsolicited streams that are started but never finished
        for message_id in 1..=5 {
            raw.send_to(&part(message_id, 0, false, b"a"), a.local_addr()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for message_id in 1..=5 {
            raw.send_to(&part(message_id, 1, true, b"b"), a.local_addr()).await.unwrap();
        }

        let mut num_received = 0;
        while let Ok(Some(message)) = timeout(Duration::from_millis(500), a_messages.recv()).await {
            assert_eq!(message, ReceivedMessage { payload: Bytes::from_static(b"ab"), sender: raw.local_addr().unwrap() });
            num_received += 1;
        }
        assert_eq!(num_received, 3);

        let mut num_acks = 0;
        let mut buf = [0u8; 100];
        while let Ok(Ok((len, _))) = timeout(Duration::from_millis(100), raw.recv_from(&mut buf)).await {
            let mut datagram = Bytes::copy_from_slice(&buf[..len]);
            if let Ok(Datagram::DataAck { position: 2, .. }) = Datagram::deser(&mut datagram) {
                num_acks += 1;
            }
        }
        assert_eq!(num_acks, 3);
    }

    #[rstest]
    #[case::loss_15(0.15)]
    #[case::loss_30(0.30)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_lossy_network(#[case] loss_rate: f64) {
        const NUM_MESSAGES: u32 = 500;

        let config = || MessagingConfig {
            resend_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let a_socket = Arc::new(LossySocket::bind_localhost(loss_rate, Duration::from_millis(5)).await.unwrap());
        let b_socket = Arc::new(LossySocket::bind_localhost(loss_rate, Duration::from_millis(5)).await.unwrap());
        let (a, mut a_messages) = EndPoint::bind(BindOptions::with_socket(a_socket), config()).await.unwrap();
        let (b, mut b_messages) = EndPoint::bind(BindOptions::with_socket(b_socket), config()).await.unwrap();
        let a = Arc::new(a);
        let b = Arc::new(b);

        let mut sends = Vec::new();
        for i in 0..NUM_MESSAGES {
            let payload = Bytes::from(format!("{:04}", i).repeat(250));
            for (from, to) in [(a.clone(), b.local_addr()), (b.clone(), a.local_addr())] {
                let payload = payload.clone();
                sends.push(tokio::spawn(async move {
                    from.send_message(payload, to).await
                }));
            }
        }
        for send in sends {
            send.await.unwrap().unwrap();
        }

        for messages in [&mut a_messages, &mut b_messages] {
            let mut received = HashSet::new();
            for _ in 0..NUM_MESSAGES {
                let message = timeout(Duration::from_secs(5), messages.recv()).await.unwrap().unwrap();
                assert_eq!(message.payload.len(), 1000);
                assert!(received.insert(message.payload), "message received twice");
            }
            assert!(timeout(Duration::from_millis(200), messages.recv()).await.is_err(), "unexpected extra message");
        }
    }
}
