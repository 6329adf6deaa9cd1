use thiserror::Error;

/// Errors surfaced by core operations.
#[derive(Debug, Error)]
pub enum UsbError {
    #[error("invalid parameter")]
    InvalidParameter,

    #[error("device not connected")]
    DeviceNotConnected,

    #[error("malformed configuration descriptor")]
    InvalidConfiguration,

    #[error("transferred length did not match the request")]
    DataLengthMismatch,

    #[error("no free device addresses on the bus")]
    BusFull,

    #[error("device address {0} is already in use")]
    AddressInUse(u8),

    #[error("port did not come up enabled after reset")]
    PortNotReady,

    #[error("operation not supported by the host controller")]
    NotSupported,

    #[error("transfer has not reached the hardware yet")]
    TooEarly,

    #[error("transfer already left the hardware queue")]
    TooLate,

    #[error("transfer is still in flight")]
    ResourceInUse,

    #[error("transfer failed: {0}")]
    Transfer(TransferError),

    #[error("device enumeration failed after {tries} attempts: {source}")]
    EnumerationFailed {
        tries: u32,
        #[source]
        source: Box<UsbError>,
    },

    #[error("host controller fault: {0}")]
    Host(&'static str),
}

pub type Result<T, E = UsbError> = std::result::Result<T, E>;

/// Fine-grained reason a transfer did not complete normally. Stored on the
/// transfer itself so class drivers can distinguish, say, a stall from a CRC
/// error when the coarse status is the same I/O failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferError {
    None,
    NotStarted,
    Cancelled,
    /// The transfer's bookkeeping was corrupt when it was handed in.
    AllocatedIncorrectly,
    /// The transfer was resubmitted while still active.
    SubmittedWhileStillActive,
    /// A required field (buffer, length, direction, callback) was missing
    /// or out of range.
    IncorrectlyFilledOut,
    FailedToSubmit,
    /// The endpoint returned STALL; the halt condition must be cleared
    /// before the endpoint will move data again.
    Stalled,
    DataBuffer,
    Babble,
    Nak,
    CrcOrTimeout,
    Bitstuff,
    MissedMicroframe,
    /// The buffer does not satisfy the controller's alignment contract.
    BufferNotAligned,
    DeviceNotConnected,
    ShortPacket,
}

impl TransferError {
    /// Whether a hub's status-change pipe should simply resubmit after
    /// seeing this error. Bus-level noise clears on its own; everything
    /// else needs intervention first.
    pub fn is_transient_io(&self) -> bool {
        matches!(
            self,
            TransferError::DataBuffer
                | TransferError::Babble
                | TransferError::Nak
                | TransferError::CrcOrTimeout
                | TransferError::Bitstuff
                | TransferError::MissedMicroframe
                | TransferError::ShortPacket
        )
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransferError::None => "no error",
            TransferError::NotStarted => "not started",
            TransferError::Cancelled => "cancelled",
            TransferError::AllocatedIncorrectly => "allocated incorrectly",
            TransferError::SubmittedWhileStillActive => "submitted while still active",
            TransferError::IncorrectlyFilledOut => "incorrectly filled out",
            TransferError::FailedToSubmit => "failed to submit",
            TransferError::Stalled => "endpoint stalled",
            TransferError::DataBuffer => "data buffer error",
            TransferError::Babble => "babble error",
            TransferError::Nak => "NAK",
            TransferError::CrcOrTimeout => "CRC or timeout error",
            TransferError::Bitstuff => "bit stuff error",
            TransferError::MissedMicroframe => "missed microframe",
            TransferError::BufferNotAligned => "buffer not aligned",
            TransferError::DeviceNotConnected => "device not connected",
            TransferError::ShortPacket => "short packet",
        };
        f.write_str(name)
    }
}
