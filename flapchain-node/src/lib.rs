//! Flapchain Node
//!
//! Protocol engine run by every module on the chain. The module firmware
//! calls [`NodeEngine::tick`] from its main loop with the current time; the
//! engine forwards, relays, answers and commits property frames without
//! ever blocking.
//!
//! ```ignore
//! let mut engine = NodeEngine::new(splitflap::table());
//! loop {
//!     engine.tick(&mut port, &mut module, now_ms());
//!     if !engine.is_busy(&port) {
//!         // safe to do slow work here
//!     }
//! }
//! ```

#![no_std]
#![deny(unsafe_code)]

mod fmt;

pub mod engine;

pub use engine::NodeEngine;
