//! Stack-wide error types.

use core::fmt;

use crate::types::RCode;

/// The result type for all operations in this stack.
pub type Result<T> = core::result::Result<T, HeliosError>;

/// Errors surfaced by the Helios stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeliosError {
    /// The controller reported an unrecoverable error; only a hardware
    /// reset is accepted from here on.
    Unrecoverable,
    /// A bus reset happened mid-operation; retry on the new topology.
    Generation,
    /// The remote node (or the tlabel pool) stayed busy past the retry budget.
    Busy,
    /// Split-timeout expired before the response arrived.
    Timeout,
    /// Protocol-level response code from the remote node.
    Response(RCode),
    /// Allocation failed.
    NoMemory,
    /// Explicit cancel or bus-reset flush.
    Cancelled,
    /// CRC-16 mismatch in a ROM block.
    CrcMismatch,
    /// Self-ID stream violated a structural invariant.
    SelfIdInconsistent,
    /// A register read did not match what was just requested.
    RegisterInconsistent,
    /// Invalid argument from the caller.
    BadCall,
    /// The operation is not implemented on this hardware.
    NotSupported,
    /// Packet could not be handed to the transmit FIFO.
    SendError,
    /// The hardware is disabled.
    Disabled,
}

impl fmt::Display for HeliosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeliosError::Unrecoverable => write!(f, "unrecoverable hardware error"),
            HeliosError::Generation => write!(f, "bus generation changed"),
            HeliosError::Busy => write!(f, "busy"),
            HeliosError::Timeout => write!(f, "timeout"),
            HeliosError::Response(rcode) => write!(f, "response error: {:?}", rcode),
            HeliosError::NoMemory => write!(f, "allocation failed"),
            HeliosError::Cancelled => write!(f, "cancelled"),
            HeliosError::CrcMismatch => write!(f, "CRC-16 mismatch"),
            HeliosError::SelfIdInconsistent => write!(f, "inconsistent self-ID stream"),
            HeliosError::RegisterInconsistent => write!(f, "register readback mismatch"),
            HeliosError::BadCall => write!(f, "invalid argument"),
            HeliosError::NotSupported => write!(f, "operation not supported"),
            HeliosError::SendError => write!(f, "transmit failed"),
            HeliosError::Disabled => write!(f, "hardware disabled"),
        }
    }
}

impl From<RCode> for HeliosError {
    fn from(rcode: RCode) -> Self {
        match rcode {
            RCode::Busy => HeliosError::Busy,
            RCode::Generation => HeliosError::Generation,
            RCode::Cancelled => HeliosError::Cancelled,
            RCode::Timeout => HeliosError::Timeout,
            RCode::SendError => HeliosError::SendError,
            other => HeliosError::Response(other),
        }
    }
}
