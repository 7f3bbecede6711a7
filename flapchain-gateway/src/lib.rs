//! Flapchain Gateway
//!
//! Gateway side of the split-flap chain: a blocking [`GatewayDriver`] that
//! runs one chain transaction per call, and a [`Display`] handle that keeps
//! a [`Collection`] of module values in sync with the chain from a worker
//! task.
//!
//! ```ignore
//! static DISPLAY: Display<CriticalSectionRawMutex, SplitflapModule, 64> = Display::new();
//!
//! #[embassy_executor::task]
//! async fn chain_task(driver: GatewayDriver<'static, SplitflapModule, Uart, Delay>) {
//!     DISPLAY.run(driver).await
//! }
//!
//! DISPLAY.mark_dirty(splitflap::CHARACTER_SET, SyncMethod::ReadAll);
//! DISPLAY.synchronize(Duration::from_secs(2)).await?;
//! ```

#![no_std]
#![deny(unsafe_code)]

mod fmt;

pub mod collection;
pub mod config;
pub mod display;
pub mod driver;
pub mod error;
pub mod model;

pub use collection::{Collection, ModuleEntry, Operation, SyncMethod};
pub use config::DriverConfig;
pub use display::Display;
pub use driver::GatewayDriver;
pub use error::GatewayError;
pub use model::ChainModel;
