//! Flapchain Hardware Abstraction Layer
//!
//! Byte transports the protocol crates run on. Modules and the gateway use
//! the same wire but very different execution models, so there is one trait
//! for each side.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │  flapchain-node      │      │  flapchain-gateway   │
//! │  (tick, never waits) │      │  (blocking driver)   │
//! └──────────┬───────────┘      └──────────┬───────────┘
//!            ▼                             ▼
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │  uart::NodeUart      │      │  uart::GatewayUart   │
//! └──────────────────────┘      └──────────────────────┘
//!            │                             │
//!            ▼                             ▼
//!   module firmware port            gateway board port
//! ```

#![no_std]
#![deny(unsafe_code)]

pub mod uart;

pub use uart::{DataBits, GatewayUart, NodeUart, Parity, StopBits, UartConfig};
