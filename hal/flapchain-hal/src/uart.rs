//! UART serial communication abstractions

/// Non-blocking UART of a chain module
///
/// Every call returns immediately. The node engine checks
/// [`NodeUart::bytes_readable`] and [`NodeUart::bytes_writable`] before
/// moving data, so implementations can back this with plain ring buffers.
pub trait NodeUart {
    /// Read up to `buf.len()` received bytes, returning how many were read
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Queue up to `data.len()` bytes for transmission, returning how many were queued
    fn write(&mut self, data: &[u8]) -> usize;

    /// Number of received bytes waiting to be read
    fn bytes_readable(&self) -> usize;

    /// Free space in the transmit queue
    fn bytes_writable(&self) -> usize;

    /// True once every queued byte has left the shift register
    fn tx_buffer_empty(&self) -> bool;

    /// True while the line is active in either direction
    fn is_busy(&self) -> bool;

    /// Read a single byte if one is waiting
    fn read_byte(&mut self) -> Option<u8> {
        let mut buf = [0u8; 1];
        (self.read(&mut buf) == 1).then_some(buf[0])
    }

    /// Queue a single byte if there is room
    fn write_byte(&mut self, byte: u8) -> bool {
        self.write(&[byte]) == 1
    }
}

/// Blocking UART of the gateway
pub trait GatewayUart {
    /// Error type for transport failures
    type Error;

    /// Write data to the UART
    ///
    /// Blocks until all data has been queued or an error occurs.
    fn write_blocking(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Read into `buf`, waiting at most `timeout_ms` for the whole buffer
    ///
    /// Returns the number of bytes read, which is short on timeout.
    fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error>;

    /// Drop everything received so far
    fn flush_input(&mut self) -> Result<(), Self::Error>;

    /// Block until every written byte has been transmitted
    fn wait_tx_done(&mut self) -> Result<(), Self::Error>;

    /// Read a single byte
    ///
    /// Returns `Ok(None)` on timeout.
    fn read_byte(&mut self, timeout_ms: u32) -> Result<Option<u8>, Self::Error> {
        let mut buf = [0u8; 1];
        let n = self.read_timeout(&mut buf, timeout_ms)?;
        Ok((n == 1).then_some(buf[0]))
    }
}

/// UART configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UartConfig {
    /// Baud rate in bits per second
    pub baudrate: u32,
    /// Number of data bits (typically 8)
    pub data_bits: DataBits,
    /// Parity mode
    pub parity: Parity,
    /// Number of stop bits
    pub stop_bits: StopBits,
}

impl UartConfig {
    /// Chain line settings, 8N1
    pub const CHAIN: Self = Self {
        baudrate: 115_200,
        data_bits: DataBits::Eight,
        parity: Parity::None,
        stop_bits: StopBits::One,
    };

    /// Time one byte occupies the line, in microseconds, rounded up
    pub const fn byte_time_us(&self) -> u32 {
        let bits = 1 + self.data_bits.bits() + self.parity.bits() + self.stop_bits.bits();
        (bits * 1_000_000).div_ceil(self.baudrate)
    }
}

impl Default for UartConfig {
    fn default() -> Self {
        Self::CHAIN
    }
}

/// Number of data bits per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataBits {
    Seven,
    Eight,
    Nine,
}

impl DataBits {
    const fn bits(self) -> u32 {
        match self {
            DataBits::Seven => 7,
            DataBits::Eight => 8,
            DataBits::Nine => 9,
        }
    }
}

/// Parity mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    const fn bits(self) -> u32 {
        match self {
            Parity::None => 0,
            Parity::Even | Parity::Odd => 1,
        }
    }
}

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopBits {
    One,
    Two,
}

impl StopBits {
    const fn bits(self) -> u32 {
        match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}
