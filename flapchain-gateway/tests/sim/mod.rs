//! Simulated chain of real node engines
//!
//! Links are byte queues. Link 0 runs from the gateway to module 0, link
//! `i + 1` from module `i` onwards, and the last link back to the gateway.
//! Time only moves while the gateway waits, one millisecond at a time, and
//! every node is ticked until the chain is quiet before each step.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use flapchain_gateway::{DriverConfig, GatewayDriver};
use flapchain_hal::{GatewayUart, NodeUart};
use flapchain_node::NodeEngine;
use flapchain_protocol::splitflap::{self, CharacterSet, SplitflapModule};
use flapchain_protocol::{NodeState, PropertyTable};

const LINK_CAPACITY: usize = 1024;
const SETTLE_ROUNDS_MAX: usize = 10_000;

/// One-way wire between two chain members
#[derive(Default)]
pub struct Link {
    queue: VecDeque<u8>,
    /// Flip `mask` in the byte that is `skip` bytes ahead
    fault: Option<(usize, u8)>,
    pushed: usize,
}

impl Link {
    fn push(&mut self, mut byte: u8) {
        if let Some((skip, mask)) = self.fault {
            if skip == 0 {
                byte ^= mask;
                self.fault = None;
            } else {
                self.fault = Some((skip - 1, mask));
            }
        }
        self.pushed += 1;
        self.queue.push_back(byte);
    }
}

struct LinkPort<'l> {
    rx: &'l mut Link,
    tx: &'l mut Link,
}

impl NodeUart for LinkPort<'_> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.queue.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.bytes_writable());
        for &byte in &data[..n] {
            self.tx.push(byte);
        }
        n
    }

    fn bytes_readable(&self) -> usize {
        self.rx.queue.len()
    }

    fn bytes_writable(&self) -> usize {
        LINK_CAPACITY.saturating_sub(self.tx.queue.len())
    }

    fn tx_buffer_empty(&self) -> bool {
        true
    }

    fn is_busy(&self) -> bool {
        !self.rx.queue.is_empty()
    }
}

pub struct Chain {
    pub links: Vec<Link>,
    pub nodes: Vec<NodeEngine<'static, SplitflapModule>>,
    pub modules: Vec<SplitflapModule>,
    pub now_ms: u32,
}

impl Chain {
    pub fn new(modules: Vec<SplitflapModule>) -> Self {
        let links = (0..=modules.len()).map(|_| Link::default()).collect();
        let nodes = modules
            .iter()
            .map(|_| NodeEngine::new(splitflap::table()))
            .collect();
        Self {
            links,
            nodes,
            modules,
            now_ms: 0,
        }
    }

    pub fn states(&self) -> Vec<NodeState> {
        self.nodes.iter().map(|n| n.state()).collect()
    }

    fn fingerprint(&self) -> (Vec<(usize, usize)>, Vec<NodeState>) {
        let links = self.links.iter().map(|l| (l.queue.len(), l.pushed)).collect();
        (links, self.states())
    }

    fn tick_all(&mut self) {
        for i in 0..self.nodes.len() {
            let (upstream, downstream) = self.links.split_at_mut(i + 1);
            let mut port = LinkPort {
                rx: &mut upstream[i],
                tx: &mut downstream[0],
            };
            self.nodes[i].tick(&mut port, &mut self.modules[i], self.now_ms);
        }
    }

    /// Tick until nothing moves any more
    pub fn settle(&mut self) {
        for _ in 0..SETTLE_ROUNDS_MAX {
            let before = self.fingerprint();
            self.tick_all();
            if self.fingerprint() == before {
                return;
            }
        }
        panic!("chain never settled");
    }

    pub fn advance(&mut self, ms: u32) {
        for _ in 0..ms {
            self.now_ms += 1;
            self.settle();
        }
    }

    pub fn gateway_link(&mut self) -> &mut Link {
        let last = self.links.len() - 1;
        &mut self.links[last]
    }

    /// Corrupt one byte sent on link `link`, `skip` bytes from now
    pub fn inject_fault(&mut self, link: usize, skip: usize, mask: u8) {
        self.links[link].fault = Some((skip, mask));
    }

    /// Bytes the gateway has sent so far
    pub fn gateway_sent(&self) -> usize {
        self.links[0].pushed
    }
}

pub type SharedChain = Rc<RefCell<Chain>>;

pub struct SimUart(pub SharedChain);

impl GatewayUart for SimUart {
    type Error = Infallible;

    fn write_blocking(&mut self, data: &[u8]) -> Result<(), Infallible> {
        let mut chain = self.0.borrow_mut();
        for &byte in data {
            chain.links[0].push(byte);
        }
        chain.settle();
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Infallible> {
        let mut chain = self.0.borrow_mut();
        let mut n = 0;
        let mut waited = 0;
        loop {
            chain.settle();
            while n < buf.len() {
                match chain.gateway_link().queue.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n == buf.len() || waited >= timeout_ms {
                return Ok(n);
            }
            chain.advance(1);
            waited += 1;
        }
    }

    fn flush_input(&mut self) -> Result<(), Infallible> {
        let mut chain = self.0.borrow_mut();
        chain.settle();
        chain.gateway_link().queue.clear();
        Ok(())
    }

    fn wait_tx_done(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().settle();
        Ok(())
    }
}

pub struct SimDelay(pub SharedChain);

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.borrow_mut().advance(ns.div_ceil(1_000_000));
    }
}

pub type SimDriver = GatewayDriver<'static, SplitflapModule, SimUart, SimDelay>;

/// Chain of `modules` plus a gateway driver attached to it
pub fn setup(modules: Vec<SplitflapModule>) -> (SharedChain, SimDriver) {
    setup_with_table(modules, splitflap::table())
}

/// Like [`setup`], with the gateway using its own view of the properties
pub fn setup_with_table(
    modules: Vec<SplitflapModule>,
    table: PropertyTable<'static, SplitflapModule>,
) -> (SharedChain, SimDriver) {
    let chain = Rc::new(RefCell::new(Chain::new(modules)));
    let driver = GatewayDriver::new(
        table,
        SimUart(chain.clone()),
        SimDelay(chain.clone()),
        DriverConfig::default(),
    );
    (chain, driver)
}

pub fn module_with_chars(chars: &str) -> SplitflapModule {
    SplitflapModule {
        character_set: CharacterSet::from_chars(chars).unwrap(),
        ..SplitflapModule::new()
    }
}

pub fn blank_modules(count: usize) -> Vec<SplitflapModule> {
    (0..count).map(|_| SplitflapModule::new()).collect()
}
