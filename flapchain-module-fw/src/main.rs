//! Flapchain Module Firmware
//!
//! Firmware for a split-flap module (STM32F042K6). USART2 carries the
//! chain: RX from the previous module, TX to the next one. Everything runs
//! in one cooperative loop so that the node engine is ticked continuously.

#![no_std]
#![no_main]

mod port;

use cortex_m::peripheral::SCB;
use defmt::*;
use embassy_executor::Spawner;
use embassy_futures::yield_now;
use embassy_stm32::bind_interrupts;
use embassy_stm32::peripherals::USART2;
use embassy_stm32::usart::{self, BufferedUart};
use embassy_time::Instant;
use flapchain_hal::UartConfig;
use flapchain_node::NodeEngine;
use flapchain_protocol::splitflap::{self, Command, ModuleInfo, ModuleType, SplitflapModule};
use {defmt_rtt as _, panic_probe as _};

use crate::port::ChainPort;

bind_interrupts!(struct Irqs {
    USART2 => usart::BufferedInterruptHandler<USART2>;
});

/// Values this module reports before the gateway configures it
fn initial_module() -> SplitflapModule {
    let mut module = SplitflapModule::new();
    let _ = module
        .firmware_version
        .version
        .push_str(env!("CARGO_PKG_VERSION"));
    module.module_info = ModuleInfo {
        column_end: false,
        module_type: ModuleType::Splitflap,
    };
    module
}

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    info!("Flapchain module firmware starting...");

    let p = embassy_stm32::init(Default::default());

    // Chain UART (PA3=RX from upstream, PA2=TX to downstream)
    let mut uart_config = usart::Config::default();
    uart_config.baudrate = UartConfig::CHAIN.baudrate;

    let mut tx_buf = [0u8; 128];
    let mut rx_buf = [0u8; 128];
    let uart = unwrap!(BufferedUart::new(
        p.USART2,
        p.PA3, // RX
        p.PA2, // TX
        &mut tx_buf,
        &mut rx_buf,
        Irqs,
        uart_config,
    ));

    let mut port = ChainPort::new(uart);
    let mut engine = NodeEngine::new(splitflap::table());
    let mut module = initial_module();

    info!("Chain node running");

    loop {
        port.service();
        let now_ms = Instant::now().as_millis() as u32;
        engine.tick(&mut port, &mut module, now_ms);
        port.service();

        // act on commands only between transactions
        if !engine.is_busy(&port) {
            match module.take_command() {
                Command::Reboot => {
                    info!("Reboot requested");
                    SCB::sys_reset();
                }
                Command::None => {}
            }
        }

        yield_now().await;
    }
}
