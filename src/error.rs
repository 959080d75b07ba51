use thiserror::Error;

/// Errors surfaced by the [crate::end_point::EndPoint] API. Malformed incoming traffic and
///  abandoned partial receives are never reported.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("could not bind socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("could not send datagram: {0}")]
    Send(#[source] std::io::Error),

    #[error("egress queue is full")]
    EgressQueueFull,

    #[error("remote end not responding")]
    RemoteNotResponding,

    #[error("message of {0} bytes exceeds the maximum message size")]
    MessageTooLarge(usize),

    #[error("end point is closed")]
    Closed,
}
