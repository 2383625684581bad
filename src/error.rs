#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("{0}")]
    InsufficientPermission(String),
    #[error("capture device error: {0}")]
    CaptureDevice(String),
    #[error("invalid configuration: {field}: {detail}")]
    Config { field: String, detail: String },
    #[error("malformed IPv6 fragment")]
    MalformedFragment,
    #[error("reassembled datagram would exceed the IPv6 payload limit")]
    OversizedDatagram,
    #[error("too many fragments for one datagram")]
    TooManyFragments,
    #[error("message is not DNS")]
    NonDns,
    #[error("serialization error: {0}")]
    Serialization(#[source] std::io::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}
