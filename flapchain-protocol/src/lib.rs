//! Flapchain Bus Protocol
//!
//! This crate defines the wire format shared by the gateway and every module
//! on a split-flap daisy chain. Modules have no addresses: the gateway talks
//! to the first module, every module talks to the next one, and the last
//! module talks back to the gateway.
//!
//! # Chain Topology
//!
//! ```text
//! ┌─────────┐ TX   ┌──────────┐    ┌──────────┐         ┌──────────┐
//! │ Gateway ├─────►│ Module 0 ├───►│ Module 1 ├── ... ─►│ Module N │
//! └────▲────┘      └──────────┘    └──────────┘         └────┬─────┘
//!      │ RX                                                  │
//!      └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Transaction Layout
//!
//! Every transaction starts with a header. Action headers are followed by
//! byte-stuffed property frames:
//! ```text
//! ┌──────────────┬───────────────────────┬─────┬───────────────────────┐
//! │ HEADER (3B)  │ COBS(DATA ++ CHECKSUM)│ 0x00│ ... one frame per node│
//! └──────────────┴───────────────────────┴─────┴───────────────────────┘
//! ```
//! Sync headers are a single byte and carry no frames.
//!
//! Node identity is purely positional: nodes count themselves in the header's
//! node count field as it ripples past.

#![no_std]
#![deny(unsafe_code)]

pub mod cobs;
pub mod error;
pub mod frame;
pub mod header;
pub mod property;
pub mod splitflap;

pub use cobs::CobsError;
pub use error::{ErrorCategories, NodeError, NodeState};
pub use frame::{
    checksum, checksum_valid, decode_frame, encode_frame, encode_placeholder, DecodedFrame,
    FrameAccumulator, FrameError, PayloadBuf, PropertyBuf,
};
pub use header::{Action, ActionHeader, Header, HeaderError, RawHeader, SyncHeader, SyncType};
pub use property::{
    Access, HandlerError, PropertyDef, PropertyError, PropertyId, PropertySet, PropertySize,
    PropertyTable, SizeError,
};

/// Largest property value, including a dynamic size prefix, carried by one frame
pub const PROPERTY_SIZE_MAX: usize = 254;

/// Largest byte-stuffed frame: property, checksum, stuffing overhead and terminator
pub const PAYLOAD_SIZE_MAX: usize = cobs::max_encoded_len(PROPERTY_SIZE_MAX + 1);

/// Size of an action header on the wire
pub const ACTION_HEADER_SIZE: usize = 3;

/// Size of a sync header on the wire
pub const SYNC_HEADER_SIZE: usize = 1;

/// Time a node waits for the next byte of a transaction before giving up
pub const TIMEOUT_MS: u32 = 25;

/// Extra time a node stays in error on top of [`TIMEOUT_MS`]
pub const RECOVERY_MARGIN_MS: u32 = 5;

/// Time a node spends in the error state before listening for headers again
///
/// Strictly longer than [`TIMEOUT_MS`] so that any upstream node waiting on
/// this one gives up first.
pub const RECOVERY_DELAY_MS: u32 = TIMEOUT_MS + RECOVERY_MARGIN_MS;
