//! Chain port over the buffered USART
//!
//! The node engine polls through `&self` accessors, so received bytes are
//! staged in a local queue by [`ChainPort::service`] and outgoing bytes wait
//! in another until the driver buffer takes them.

use defmt::warn;
use embassy_stm32::pac;
use embassy_stm32::usart::BufferedUart;
use embedded_io::{Read, ReadReady, Write};
use flapchain_hal::NodeUart;
use heapless::Deque;

const QUEUE_SIZE: usize = 64;

pub struct ChainPort<'d> {
    uart: BufferedUart<'d>,
    rx: Deque<u8, QUEUE_SIZE>,
    tx: Deque<u8, QUEUE_SIZE>,
}

impl<'d> ChainPort<'d> {
    pub fn new(uart: BufferedUart<'d>) -> Self {
        Self {
            uart,
            rx: Deque::new(),
            tx: Deque::new(),
        }
    }

    /// Move bytes between the local queues and the USART driver
    pub fn service(&mut self) {
        while !self.rx.is_full() && self.uart.read_ready().unwrap_or(false) {
            let mut byte = [0u8; 1];
            match self.uart.read(&mut byte) {
                Ok(1) => {
                    let _ = self.rx.push_back(byte[0]);
                }
                Ok(_) => break,
                Err(e) => {
                    warn!("chain rx error: {:?}", e);
                    break;
                }
            }
        }

        while let Some(&byte) = self.tx.front() {
            match self.uart.write(&[byte]) {
                Ok(1) => {
                    self.tx.pop_front();
                }
                Ok(_) => break,
                Err(e) => {
                    warn!("chain tx error: {:?}", e);
                    break;
                }
            }
        }
    }

    /// The shift register has sent its last byte
    fn line_idle(&self) -> bool {
        pac::USART2.isr().read().tc()
    }
}

impl NodeUart for ChainPort<'_> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        for slot in buf.iter_mut() {
            match self.rx.pop_front() {
                Some(byte) => {
                    *slot = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut n = 0;
        for &byte in data {
            if self.tx.push_back(byte).is_err() {
                break;
            }
            n += 1;
        }
        n
    }

    fn bytes_readable(&self) -> usize {
        self.rx.len()
    }

    fn bytes_writable(&self) -> usize {
        QUEUE_SIZE - self.tx.len()
    }

    fn tx_buffer_empty(&self) -> bool {
        self.tx.is_empty() && self.line_idle()
    }

    fn is_busy(&self) -> bool {
        !self.rx.is_empty() || !self.tx_buffer_empty()
    }
}
