//! Node error taxonomy
//!
//! Nodes keep the fine-grained [`NodeError`] and the [`NodeState`] it
//! happened in for diagnostics. Only the coarse [`ErrorCategories`] ride
//! along in sync headers.

/// Protocol state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NodeState {
    /// Waiting for the next header
    RxHeader = 1,
    /// Discarding bus traffic until the recovery delay has passed
    Error = 2,
    /// Counting down to this node's turn
    DecrementCount = 3,
    /// Sending this node's property frame
    TxProperty = 4,
    /// Receiving or relaying a property frame
    RxProperty = 5,
    /// Applying a received property value
    CommitProperty = 6,
}

impl NodeState {
    /// Human-readable state name
    pub const fn name(self) -> &'static str {
        match self {
            NodeState::RxHeader => "Receive Header",
            NodeState::Error => "Error",
            NodeState::DecrementCount => "Decrement Node Count",
            NodeState::TxProperty => "Transmit Property",
            NodeState::RxProperty => "Receive Property",
            NodeState::CommitProperty => "Commit Property",
        }
    }

    /// Decode a state from its wire byte, `0` meaning "no state recorded"
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(NodeState::RxHeader),
            2 => Some(NodeState::Error),
            3 => Some(NodeState::DecrementCount),
            4 => Some(NodeState::TxProperty),
            5 => Some(NodeState::RxProperty),
            6 => Some(NodeState::CommitProperty),
            _ => None,
        }
    }
}

/// Errors a node records locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NodeError {
    #[default]
    None = 0,
    /// Header fields that cannot occur, e.g. a write addressed to no node
    InvalidState = 1,
    HeaderParity = 2,
    EncodeFailure = 3,
    DecodeFailure = 4,
    ChecksumMismatch = 5,
    Timeout = 6,
    SetCallbackFailed = 7,
    GetCallbackFailed = 8,
    ReadNotSupported = 9,
    WriteNotSupported = 10,
    PropertyNotSupported = 11,
}

impl NodeError {
    /// Category reported on the wire for this error
    pub const fn category(self) -> ErrorCategories {
        match self {
            NodeError::None => ErrorCategories::NONE,
            NodeError::InvalidState
            | NodeError::HeaderParity
            | NodeError::EncodeFailure
            | NodeError::DecodeFailure
            | NodeError::ChecksumMismatch
            | NodeError::Timeout => ErrorCategories::TRANSMISSION,
            NodeError::SetCallbackFailed | NodeError::GetCallbackFailed => {
                ErrorCategories::HANDLER
            }
            NodeError::ReadNotSupported
            | NodeError::WriteNotSupported
            | NodeError::PropertyNotSupported => ErrorCategories::NOT_SUPPORTED,
        }
    }

    /// Human-readable error name
    pub const fn name(self) -> &'static str {
        match self {
            NodeError::None => "None",
            NodeError::InvalidState => "Invalid State",
            NodeError::HeaderParity => "Header Parity",
            NodeError::EncodeFailure => "COBS Encoding",
            NodeError::DecodeFailure => "COBS Decoding",
            NodeError::ChecksumMismatch => "Checksum",
            NodeError::Timeout => "Timeout",
            NodeError::SetCallbackFailed => "Set Callback",
            NodeError::GetCallbackFailed => "Get Callback",
            NodeError::ReadNotSupported => "Read Not Supported",
            NodeError::WriteNotSupported => "Write Not Supported",
            NodeError::PropertyNotSupported => "Property Not Supported",
        }
    }

    /// Decode an error from its wire byte
    ///
    /// Unknown values are reported as [`NodeError::InvalidState`] so a
    /// corrupted answer is never mistaken for a healthy node.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeError::None,
            2 => NodeError::HeaderParity,
            3 => NodeError::EncodeFailure,
            4 => NodeError::DecodeFailure,
            5 => NodeError::ChecksumMismatch,
            6 => NodeError::Timeout,
            7 => NodeError::SetCallbackFailed,
            8 => NodeError::GetCallbackFailed,
            9 => NodeError::ReadNotSupported,
            10 => NodeError::WriteNotSupported,
            11 => NodeError::PropertyNotSupported,
            _ => NodeError::InvalidState,
        }
    }

    pub const fn is_none(self) -> bool {
        matches!(self, NodeError::None)
    }
}

impl core::fmt::Display for NodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of error categories carried in the low nibble of a sync header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorCategories(u8);

impl ErrorCategories {
    pub const NONE: Self = Self(0);
    pub const OTHER: Self = Self(1 << 0);
    pub const TRANSMISSION: Self = Self(1 << 1);
    pub const HANDLER: Self = Self(1 << 2);
    pub const NOT_SUPPORTED: Self = Self(1 << 3);

    /// Build from the raw nibble, ignoring the upper bits
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0F)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True when every reported category is [`ErrorCategories::NOT_SUPPORTED`]
    pub const fn only_not_supported(self) -> bool {
        self.0 == Self::NOT_SUPPORTED.0
    }
}

impl core::ops::BitOr for ErrorCategories {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl core::ops::BitOrAssign for ErrorCategories {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}
