use smi_core::WireError;

/// Errors raised by the bus runtime. Transaction failures reported by the
/// memory side are not errors; they come back as `Status::Failed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("link closed by peer")]
    LinkClosed,

    #[error("response frame ended after {0} payload bytes")]
    TruncatedFrame(usize),

    #[error("burst of {0} bytes does not fit a single frame")]
    BurstTooLong(u64),

    #[error("burst source closed before the burst was complete")]
    SourceExhausted,

    #[error("frame does not fit a {0}-flit buffer")]
    FrameOverflow(usize),

    #[error("burst size {0} is not a power of two in 8..=4096")]
    BurstSize(u16),

    #[error("arbiter needs 1..=255 ports, got {0}")]
    PortCount(usize),

    #[error(transparent)]
    Wire(#[from] WireError),
}
