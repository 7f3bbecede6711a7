//! Gateway error types

use flapchain_protocol::{ErrorCategories, FrameError, PropertyError, SizeError};

/// Errors from a chain transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GatewayError {
    /// The chain did not answer in time
    Timeout,
    /// A received frame failed its checksum
    ChecksumMismatch,
    /// A received frame has malformed byte stuffing
    CobsDecodeError,
    /// The header came back with bad parity or changed fields
    HeaderMismatch,
    /// A broadcast payload came back altered
    PayloadMismatch,
    /// A value does not match its declared size
    SizeMismatch,
    /// The property is unknown or cannot travel in this direction
    NotSupported,
    /// A property handler failed
    Handler,
    /// Nodes reported errors in these categories
    NodeFailure(ErrorCategories),
    InvalidArgument,
    BufferTooSmall,
    /// The byte transport failed
    Transport,
}

impl GatewayError {
    /// True for capability errors that no retry can fix
    pub const fn is_not_supported(&self) -> bool {
        match self {
            GatewayError::NotSupported => true,
            GatewayError::NodeFailure(categories) => categories.only_not_supported(),
            _ => false,
        }
    }

    /// False for errors that repeat identically on another attempt
    pub const fn is_retryable(&self) -> bool {
        !self.is_not_supported()
            && !matches!(
                self,
                GatewayError::InvalidArgument | GatewayError::BufferTooSmall
            )
    }
}

impl From<FrameError> for GatewayError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::InvalidChecksum => GatewayError::ChecksumMismatch,
            FrameError::PayloadTooLarge => GatewayError::BufferTooSmall,
            FrameError::Cobs(_) | FrameError::Overflow => GatewayError::CobsDecodeError,
        }
    }
}

impl From<SizeError> for GatewayError {
    fn from(_: SizeError) -> Self {
        GatewayError::SizeMismatch
    }
}

impl From<PropertyError> for GatewayError {
    fn from(e: PropertyError) -> Self {
        match e {
            PropertyError::NotSupported => GatewayError::NotSupported,
            PropertyError::Handler(_) => GatewayError::Handler,
            PropertyError::Size(e) => e.into(),
        }
    }
}

impl core::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            GatewayError::Timeout => write!(f, "chain timeout"),
            GatewayError::ChecksumMismatch => write!(f, "frame checksum mismatch"),
            GatewayError::CobsDecodeError => write!(f, "frame decoding failed"),
            GatewayError::HeaderMismatch => write!(f, "header corrupted"),
            GatewayError::PayloadMismatch => write!(f, "broadcast payload corrupted"),
            GatewayError::SizeMismatch => write!(f, "property size mismatch"),
            GatewayError::NotSupported => write!(f, "property not supported"),
            GatewayError::Handler => write!(f, "property handler failed"),
            GatewayError::NodeFailure(c) => write!(f, "node errors reported (0x{:x})", c.bits()),
            GatewayError::InvalidArgument => write!(f, "invalid argument"),
            GatewayError::BufferTooSmall => write!(f, "buffer too small"),
            GatewayError::Transport => write!(f, "transport error"),
        }
    }
}
