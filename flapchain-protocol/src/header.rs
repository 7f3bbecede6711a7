//! Header bit packing
//!
//! Action header (3 bytes):
//! ```text
//! ┌────────────┬──────┬───────────────┬───────────────┬─────────────────┬────────┐
//! │ ACTION 2b  │ FLAG │ PROPERTY 7b   │ NODE_CNT lo 6b│ NODE_CNT hi 7b  │ PARITY │
//! │ byte0 7..6 │ b0 5 │ b0 4..0,b1 7..6│ byte1 5..0   │ byte2 7..1      │ b2 0   │
//! └────────────┴──────┴───────────────┴───────────────┴─────────────────┴────────┘
//! ```
//! The node count is split so that the low part travels in byte 1: a node
//! must forward byte 1 with its updated count before byte 2 has arrived.
//!
//! Sync header (1 byte):
//! ```text
//! ┌────────────┬──────────────┬──────────────────┐
//! │ ACTION 2b  │ SYNC_TYPE 2b │ ERROR CATEGORY 4b│
//! └────────────┴──────────────┴──────────────────┘
//! ```

use crate::error::ErrorCategories;
use crate::property::PropertyId;
use crate::{ACTION_HEADER_SIZE, SYNC_HEADER_SIZE};

/// Largest node count representable in a header
pub const NODE_COUNT_MAX: u16 = 0x1FFF;

const NODE_COUNT_LOW_BITS: u16 = 6;

/// Errors from decoding a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaderError {
    /// Even parity over the action header does not hold
    Parity,
    /// Header shape does not match its action
    UnexpectedAction,
    /// Not enough bytes for the header shape
    Incomplete,
}

impl core::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HeaderError::Parity => write!(f, "header parity invalid"),
            HeaderError::UnexpectedAction => write!(f, "unexpected header action"),
            HeaderError::Incomplete => write!(f, "header incomplete"),
        }
    }
}

/// Transaction selector in the two leading bits of every header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    /// Collect one property from every node
    Read = 0,
    /// Send a distinct value to every node
    Write = 1,
    /// Send the same value to every node
    Broadcast = 2,
    /// Single-byte acknowledge or commit
    Sync = 3,
}

impl Action {
    /// Action encoded in the first byte of a header
    pub const fn from_first_byte(byte: u8) -> Self {
        match byte >> 6 {
            0 => Action::Read,
            1 => Action::Write,
            2 => Action::Broadcast,
            _ => Action::Sync,
        }
    }
}

/// Sync header kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncType {
    /// Every node ORs its error category into the header
    Ack = 0,
    /// Every node applies its staged write
    Commit = 1,
    Reserved1 = 2,
    Reserved2 = 3,
}

impl SyncType {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => SyncType::Ack,
            1 => SyncType::Commit,
            2 => SyncType::Reserved1,
            _ => SyncType::Reserved2,
        }
    }
}

/// Field-level access to raw header bytes
///
/// Nodes patch headers byte by byte while forwarding them, so the accessors
/// work on partially received headers too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawHeader(pub [u8; ACTION_HEADER_SIZE]);

impl RawHeader {
    pub const fn new() -> Self {
        Self([0; ACTION_HEADER_SIZE])
    }

    pub const fn action(&self) -> Action {
        Action::from_first_byte(self.0[0])
    }

    pub fn set_action(&mut self, action: Action) {
        self.0[0] = (self.0[0] & 0x3F) | ((action as u8) << 6);
    }

    /// Staged-write bit for writes, read-error bit for reads
    pub const fn flag(&self) -> bool {
        self.0[0] & 0x20 != 0
    }

    pub fn set_flag(&mut self, flag: bool) {
        self.0[0] = (self.0[0] & !0x20) | ((flag as u8) << 5);
    }

    pub const fn property(&self) -> PropertyId {
        PropertyId(((self.0[0] & 0x1F) << 2) | (self.0[1] >> 6))
    }

    pub fn set_property(&mut self, property: PropertyId) {
        let id = property.0 & 0x7F;
        self.0[0] = (self.0[0] & 0xE0) | (id >> 2);
        self.0[1] = (self.0[1] & 0x3F) | ((id & 0x03) << 6);
    }

    /// Node count bits carried in byte 1
    pub const fn node_count_low(&self) -> u16 {
        (self.0[1] & 0x3F) as u16
    }

    /// Node count bits carried in byte 2, already shifted into place
    pub const fn node_count_high(&self) -> u16 {
        ((self.0[2] >> 1) as u16) << NODE_COUNT_LOW_BITS
    }

    pub const fn node_count(&self) -> u16 {
        self.node_count_high() | self.node_count_low()
    }

    /// Store `count`, wrapping it into the 13-bit field
    pub fn set_node_count(&mut self, count: u16) {
        let count = count & NODE_COUNT_MAX;
        self.0[1] = (self.0[1] & 0xC0) | (count & 0x3F) as u8;
        self.0[2] = (self.0[2] & 0x01) | (((count >> NODE_COUNT_LOW_BITS) as u8) << 1);
    }

    /// True when the number of set bits over all three bytes is even
    pub const fn parity_valid(&self) -> bool {
        let ones = self.0[0].count_ones() + self.0[1].count_ones() + self.0[2].count_ones();
        ones % 2 == 0
    }

    /// Set the parity bit so that [`Self::parity_valid`] returns `valid`
    pub fn set_parity(&mut self, valid: bool) {
        if self.parity_valid() != valid {
            self.0[2] ^= 0x01;
        }
    }

    pub const fn sync_type(&self) -> SyncType {
        SyncType::from_bits(self.0[0] >> 4)
    }

    pub fn set_sync_type(&mut self, sync_type: SyncType) {
        self.0[0] = (self.0[0] & 0xCF) | ((sync_type as u8) << 4);
    }

    pub const fn sync_errors(&self) -> ErrorCategories {
        ErrorCategories::from_bits(self.0[0])
    }

    /// OR `errors` into the sync error nibble
    pub fn add_sync_errors(&mut self, errors: ErrorCategories) {
        self.0[0] |= errors.bits();
    }
}

/// Decoded 3-byte header for read, write and broadcast transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ActionHeader {
    pub action: Action,
    /// Staged write (write/broadcast) or read error present (read)
    pub flag: bool,
    pub property: PropertyId,
    pub node_count: u16,
}

impl ActionHeader {
    /// Create a header, returns `None` for [`Action::Sync`]
    pub fn new(action: Action, flag: bool, property: PropertyId, node_count: u16) -> Option<Self> {
        if action == Action::Sync {
            return None;
        }
        Some(Self {
            action,
            flag,
            property: PropertyId(property.0 & 0x7F),
            node_count: node_count & NODE_COUNT_MAX,
        })
    }

    /// Pack into wire bytes with valid parity
    pub fn pack(&self) -> [u8; ACTION_HEADER_SIZE] {
        let mut raw = RawHeader::new();
        raw.set_action(self.action);
        raw.set_flag(self.flag);
        raw.set_property(self.property);
        raw.set_node_count(self.node_count);
        raw.set_parity(true);
        raw.0
    }

    /// Unpack wire bytes, rejecting bad parity
    pub fn unpack(bytes: [u8; ACTION_HEADER_SIZE]) -> Result<Self, HeaderError> {
        let raw = RawHeader(bytes);
        if raw.action() == Action::Sync {
            return Err(HeaderError::UnexpectedAction);
        }
        if !raw.parity_valid() {
            return Err(HeaderError::Parity);
        }
        Ok(Self {
            action: raw.action(),
            flag: raw.flag(),
            property: raw.property(),
            node_count: raw.node_count(),
        })
    }
}

/// Decoded 1-byte sync header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncHeader {
    pub sync_type: SyncType,
    pub errors: ErrorCategories,
}

impl SyncHeader {
    pub const fn new(sync_type: SyncType) -> Self {
        Self {
            sync_type,
            errors: ErrorCategories::NONE,
        }
    }

    pub fn pack(&self) -> u8 {
        let mut raw = RawHeader::new();
        raw.set_action(Action::Sync);
        raw.set_sync_type(self.sync_type);
        raw.add_sync_errors(self.errors);
        raw.0[0]
    }

    pub fn unpack(byte: u8) -> Result<Self, HeaderError> {
        let raw = RawHeader([byte, 0, 0]);
        if raw.action() != Action::Sync {
            return Err(HeaderError::UnexpectedAction);
        }
        Ok(Self {
            sync_type: raw.sync_type(),
            errors: raw.sync_errors(),
        })
    }
}

/// Either header shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Header {
    Action(ActionHeader),
    Sync(SyncHeader),
}

impl Header {
    /// Number of wire bytes for a header starting with `first_byte`
    pub const fn wire_len(first_byte: u8) -> usize {
        match Action::from_first_byte(first_byte) {
            Action::Sync => SYNC_HEADER_SIZE,
            _ => ACTION_HEADER_SIZE,
        }
    }

    /// Decode a header from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        let first = *bytes.first().ok_or(HeaderError::Incomplete)?;
        if Action::from_first_byte(first) == Action::Sync {
            return SyncHeader::unpack(first).map(Header::Sync);
        }
        let raw: [u8; ACTION_HEADER_SIZE] = bytes
            .get(..ACTION_HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(HeaderError::Incomplete)?;
        ActionHeader::unpack(raw).map(Header::Action)
    }

    /// Encode into `buf`, returning the number of bytes written
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, HeaderError> {
        match self {
            Header::Action(header) => {
                let out = buf
                    .get_mut(..ACTION_HEADER_SIZE)
                    .ok_or(HeaderError::Incomplete)?;
                out.copy_from_slice(&header.pack());
                Ok(ACTION_HEADER_SIZE)
            }
            Header::Sync(header) => {
                let out = buf.first_mut().ok_or(HeaderError::Incomplete)?;
                *out = header.pack();
                Ok(SYNC_HEADER_SIZE)
            }
        }
    }
}
