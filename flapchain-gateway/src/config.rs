//! Driver configuration

use flapchain_hal::UartConfig;
use flapchain_protocol::RECOVERY_DELAY_MS;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Timing and retry settings of the [`GatewayDriver`](crate::GatewayDriver)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DriverConfig {
    /// Fixed part of every receive timeout
    pub base_timeout_ms: u32,
    /// Added to the receive timeout for every expected byte
    pub per_byte_timeout_ms: u32,
    /// Extra attempts of a failed broadcast before giving up
    pub write_retries: u8,
    /// Pause before a retry, long enough for every node to leave its error state
    pub recovery_delay_ms: u32,
}

impl DriverConfig {
    pub const fn new() -> Self {
        Self {
            base_timeout_ms: 1000,
            per_byte_timeout_ms: 1,
            write_retries: 3,
            recovery_delay_ms: RECOVERY_DELAY_MS,
        }
    }

    /// Defaults with the per-byte timeout derived from the line speed
    pub const fn for_uart(uart: &UartConfig) -> Self {
        let per_byte = uart.byte_time_us().div_ceil(1000);
        Self {
            per_byte_timeout_ms: if per_byte == 0 { 1 } else { per_byte },
            ..Self::new()
        }
    }

    /// Receive timeout for `bytes` expected bytes
    pub const fn rx_timeout_ms(&self, bytes: usize) -> u32 {
        self.base_timeout_ms
            .saturating_add((bytes as u32).saturating_mul(self.per_byte_timeout_ms))
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flapchain_hal::{Parity, StopBits};

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.write_retries, 3);
        assert_eq!(config.recovery_delay_ms, 30);
        assert_eq!(config.rx_timeout_ms(3), 1003);
    }

    #[test]
    fn test_for_slow_uart() {
        let uart = UartConfig {
            baudrate: 2400,
            parity: Parity::Even,
            stop_bits: StopBits::Two,
            ..UartConfig::CHAIN
        };
        // 12 bits at 2400 baud is 5 ms per byte
        assert_eq!(DriverConfig::for_uart(&uart).per_byte_timeout_ms, 5);
        assert_eq!(DriverConfig::for_uart(&UartConfig::CHAIN).per_byte_timeout_ms, 1);
    }
}
