//! Node protocol state machine
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!      ┌──────────┐ header  ┌────────────────┐ count>0 ┌────┴───────┐
//!  ───►│ RxHeader ├────────►│ DecrementCount ├────────►│ RxProperty │
//!      └──┬───▲───┘         └──┬──────────┬──┘◄────────┴────────────┘
//!  sync   │   │     read, 0    │          │ write, 0
//!  commit │   │   ┌────────────▼┐   ┌─────▼──────────┐
//!         │   └───┤ TxProperty  │   │ CommitProperty │◄──┐
//!         │       └─────────────┘   └────────────────┘   │
//!         └──────────────────────────────────────────────┘
//! ```
//! Every state except `RxHeader` is bounded by [`TIMEOUT_MS`]. Failures go
//! to `Error`, which swallows bus traffic for [`RECOVERY_DELAY_MS`].

use flapchain_hal::NodeUart;
use flapchain_protocol::header::NODE_COUNT_MAX;
use flapchain_protocol::{
    encode_frame, Action, DecodedFrame, FrameAccumulator, FrameError, NodeError, NodeState,
    PayloadBuf, PropertyBuf, PropertyError, PropertyId, PropertyTable, RawHeader, SyncType,
    RECOVERY_DELAY_MS, TIMEOUT_MS,
};
use heapless::Vec;

/// Distinct properties a node can hold back for one commit
pub const STAGED_SLOTS: usize = 4;

/// Received value waiting to be applied
#[derive(Debug, Clone)]
struct Slot {
    property: PropertyId,
    data: PropertyBuf,
}

/// Protocol engine of one chain module
///
/// The engine owns no I/O. Every call to [`NodeEngine::tick`] moves as many
/// bytes as the port allows and returns without waiting.
pub struct NodeEngine<'a, M> {
    table: PropertyTable<'a, M>,
    state: NodeState,
    since_ms: u32,
    data_cnt: usize,

    /// Header bytes as received, used for the parity check
    rx_header: RawHeader,
    /// Header bytes as forwarded
    tx_header: RawHeader,
    action: Action,
    staged_write: bool,
    property: PropertyId,
    node_cnt: u16,

    frame: FrameAccumulator,
    tx_frame: PayloadBuf,
    /// Value of the last kept frame, `None` for a placeholder
    payload: Option<PropertyBuf>,
    pending: Option<Slot>,
    staged: Vec<Slot, STAGED_SLOTS>,
    /// The commit in progress applies every staged slot
    committing: bool,

    last_error: NodeError,
    error_state: Option<NodeState>,
}

impl<'a, M> NodeEngine<'a, M> {
    pub fn new(table: PropertyTable<'a, M>) -> Self {
        Self {
            table,
            state: NodeState::RxHeader,
            since_ms: 0,
            data_cnt: 0,
            rx_header: RawHeader::new(),
            tx_header: RawHeader::new(),
            action: Action::Read,
            staged_write: false,
            property: PropertyId(0),
            node_cnt: 0,
            frame: FrameAccumulator::new(),
            tx_frame: PayloadBuf::new(),
            payload: None,
            pending: None,
            staged: Vec::new(),
            committing: false,
            last_error: NodeError::None,
            error_state: None,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Last recorded error, cleared once reported to the gateway
    pub fn last_error(&self) -> NodeError {
        self.last_error
    }

    /// State the last error occurred in
    pub fn error_state(&self) -> Option<NodeState> {
        self.error_state
    }

    /// True while a staged write waits for a commit
    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Number of properties waiting for a commit
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// True while a transaction is in progress or the port still has traffic
    pub fn is_busy<U: NodeUart>(&self, uart: &U) -> bool {
        self.state != NodeState::RxHeader || uart.is_busy()
    }

    /// Advance the state machine
    pub fn tick<U: NodeUart>(&mut self, uart: &mut U, module: &mut M, now_ms: u32) {
        match self.state {
            NodeState::RxHeader => self.rx_header(uart, now_ms),
            NodeState::Error => self.error(uart, now_ms),
            NodeState::DecrementCount => self.decrement_count(module, now_ms),
            NodeState::TxProperty => self.tx_property(uart, now_ms),
            NodeState::RxProperty => self.rx_property(uart, now_ms),
            NodeState::CommitProperty => self.commit_property(uart, module, now_ms),
        }
    }

    fn enter(&mut self, state: NodeState, now_ms: u32) {
        trace!("state {} -> {}", self.state.name(), state.name());
        self.state = state;
        self.since_ms = now_ms;
        self.data_cnt = 0;
        self.frame.reset();
    }

    fn elapsed(&self, now_ms: u32) -> u32 {
        now_ms.wrapping_sub(self.since_ms)
    }

    /// Remember `err` without leaving the current state
    fn record(&mut self, err: NodeError) {
        warn!("{} error in {} state", err.name(), self.state.name());
        self.last_error = err;
        self.error_state = Some(self.state);
    }

    fn fail(&mut self, err: NodeError, now_ms: u32) {
        self.record(err);
        self.enter(NodeState::Error, now_ms);
    }

    /// Node count change applied while forwarding a header
    fn count_delta(&self) -> i32 {
        match self.action {
            Action::Write => -1,
            _ => 1,
        }
    }

    fn rx_header<U: NodeUart>(&mut self, uart: &mut U, now_ms: u32) {
        while self.state == NodeState::RxHeader {
            let Some(byte) = read_if_writable(uart) else {
                if self.data_cnt > 0 && self.elapsed(now_ms) > TIMEOUT_MS {
                    self.fail(NodeError::Timeout, now_ms);
                }
                return;
            };
            self.since_ms = now_ms;

            let index = self.data_cnt;
            self.data_cnt += 1;
            let out = match index {
                0 => self.header_first(byte, now_ms),
                1 => self.header_second(byte),
                _ => self.header_third(byte, now_ms),
            };
            uart.write_byte(out);
        }
    }

    fn header_first(&mut self, byte: u8, now_ms: u32) -> u8 {
        self.rx_header = RawHeader([byte, 0, 0]);
        self.tx_header = self.rx_header;
        self.action = self.rx_header.action();
        self.staged_write = self.rx_header.flag();

        if self.action == Action::Sync {
            match self.rx_header.sync_type() {
                SyncType::Ack => {
                    self.tx_header.add_sync_errors(self.last_error.category());
                    self.enter(NodeState::RxHeader, now_ms);
                }
                SyncType::Commit => {
                    self.committing = true;
                    self.enter(NodeState::CommitProperty, now_ms);
                }
                _ => self.enter(NodeState::RxHeader, now_ms),
            }
        } else if self.action == Action::Read && !self.last_error.is_none() {
            // upstream flags pass through untouched
            self.tx_header.set_flag(true);
        }
        self.tx_header.0[0]
    }

    fn header_second(&mut self, byte: u8) -> u8 {
        self.rx_header.0[1] = byte;
        self.property = self.rx_header.property();

        let low = self.rx_header.node_count_low() as i32 + self.count_delta();
        self.tx_header.0[1] = (byte & 0xC0) | low.rem_euclid(64) as u8;
        self.tx_header.0[1]
    }

    fn header_third(&mut self, byte: u8, now_ms: u32) -> u8 {
        self.rx_header.0[2] = byte;
        self.tx_header.0[2] = byte;

        let received = self.rx_header.node_count();
        let forwarded = (received as i32 + self.count_delta()) as u16 & NODE_COUNT_MAX;
        self.tx_header.set_node_count(forwarded);

        let mut valid = self.rx_header.parity_valid();
        if !valid {
            self.fail(NodeError::HeaderParity, now_ms);
        } else if self.action == Action::Write && received == 0 {
            self.fail(NodeError::InvalidState, now_ms);
            valid = false;
        } else {
            self.node_cnt = match self.action {
                Action::Read => (received + 1) & NODE_COUNT_MAX,
                Action::Broadcast => 1,
                _ => received,
            };
            self.enter(NodeState::DecrementCount, now_ms);
        }

        // a broken parity makes every downstream node discard the header too
        self.tx_header.set_parity(valid);
        self.tx_header.0[2]
    }

    fn decrement_count(&mut self, module: &M, now_ms: u32) {
        if self.node_cnt == 0 {
            match self.payload.take() {
                None => self.enter(NodeState::RxHeader, now_ms),
                Some(data) => {
                    let slot = Slot {
                        property: self.property,
                        data,
                    };
                    if self.staged_write {
                        self.stage(slot);
                        self.enter(NodeState::RxHeader, now_ms);
                    } else {
                        self.pending = Some(slot);
                        self.enter(NodeState::CommitProperty, now_ms);
                    }
                }
            }
            return;
        }

        self.node_cnt -= 1;
        if self.action == Action::Read && self.node_cnt == 0 {
            self.enter(NodeState::TxProperty, now_ms);
            self.tx_frame = self.produce(module);
        } else {
            self.payload = None;
            self.enter(NodeState::RxProperty, now_ms);
        }
    }

    /// Hold `slot` back until the next commit
    ///
    /// A newer value replaces a staged one of the same property. When every
    /// slot is taken the value is dropped and the error is recorded, so the
    /// next acknowledge reports it.
    fn stage(&mut self, slot: Slot) {
        debug!("staged property {}", slot.property.0);
        if let Some(held) = self.staged.iter_mut().find(|s| s.property == slot.property) {
            *held = slot;
        } else if self.staged.push(slot).is_err() {
            self.record(NodeError::InvalidState);
        }
    }

    /// Encoded frame answering the current read, empty on failure
    fn produce(&mut self, module: &M) -> PayloadBuf {
        let frame = self
            .read_value(module)
            .and_then(|data| encode_frame(&data).map_err(|_| NodeError::EncodeFailure));
        match frame {
            Ok(frame) => frame,
            Err(err) => {
                self.record(err);
                let mut empty = PayloadBuf::new();
                let _ = empty.push(0);
                empty
            }
        }
    }

    fn read_value(&mut self, module: &M) -> Result<PropertyBuf, NodeError> {
        if self.property.is_node_error_query() {
            let mut data = PropertyBuf::new();
            let state = self.error_state.map_or(0, |s| s as u8);
            data.extend_from_slice(&[self.last_error as u8, state])
                .map_err(|_| NodeError::EncodeFailure)?;
            self.last_error = NodeError::None;
            self.error_state = None;
            return Ok(data);
        }

        let def = self
            .table
            .get(self.property)
            .ok_or(NodeError::PropertyNotSupported)?;
        if !def.access.readable() {
            return Err(NodeError::ReadNotSupported);
        }
        def.serialize(module).map_err(|e| match e {
            PropertyError::NotSupported => NodeError::ReadNotSupported,
            PropertyError::Handler(_) => NodeError::GetCallbackFailed,
            PropertyError::Size(_) => NodeError::EncodeFailure,
        })
    }

    fn tx_property<U: NodeUart>(&mut self, uart: &mut U, now_ms: u32) {
        if self.elapsed(now_ms) > TIMEOUT_MS {
            self.fail(NodeError::Timeout, now_ms);
            return;
        }

        let rest = self.tx_frame.get(self.data_cnt..).unwrap_or(&[]);
        let n = uart.write(rest);
        if n > 0 {
            self.since_ms = now_ms;
            self.data_cnt += n;
        }
        if self.data_cnt >= self.tx_frame.len() {
            self.enter(NodeState::RxHeader, now_ms);
        }
    }

    fn rx_property<U: NodeUart>(&mut self, uart: &mut U, now_ms: u32) {
        let forward = self.node_cnt != 0 || self.action == Action::Broadcast;
        let keep = self.action != Action::Read && self.node_cnt == 0;

        if self.elapsed(now_ms) > TIMEOUT_MS {
            if self.frame.is_empty() && !keep {
                // nothing upstream to relay
                self.enter(NodeState::RxHeader, now_ms);
            } else {
                self.fail(NodeError::Timeout, now_ms);
            }
            return;
        }

        loop {
            let byte = if forward {
                read_if_writable(uart)
            } else {
                uart.read_byte()
            };
            let Some(byte) = byte else {
                return;
            };
            if forward {
                uart.write_byte(byte);
            }
            self.since_ms = now_ms;

            match self.frame.feed(byte) {
                Ok(false) => {}
                Ok(true) => {
                    self.finish_frame(keep, now_ms);
                    return;
                }
                Err(_) => {
                    self.fail(NodeError::DecodeFailure, now_ms);
                    return;
                }
            }
        }
    }

    fn finish_frame(&mut self, keep: bool, now_ms: u32) {
        match self.frame.decode() {
            Ok(DecodedFrame::Data(data)) => {
                if keep {
                    self.payload = Some(data);
                }
            }
            Ok(DecodedFrame::Placeholder) => {}
            // relayed empty frames belong to failed upstream nodes
            Ok(DecodedFrame::Empty) if !keep => {}
            Ok(DecodedFrame::Empty) => {
                self.fail(NodeError::DecodeFailure, now_ms);
                return;
            }
            Err(FrameError::InvalidChecksum) => {
                self.fail(NodeError::ChecksumMismatch, now_ms);
                return;
            }
            Err(_) => {
                self.fail(NodeError::DecodeFailure, now_ms);
                return;
            }
        }
        self.enter(NodeState::DecrementCount, now_ms);
    }

    fn commit_property<U: NodeUart>(&mut self, uart: &mut U, module: &mut M, now_ms: u32) {
        let nothing = if self.committing {
            self.staged.is_empty()
        } else {
            self.pending.is_none()
        };
        if nothing {
            self.committing = false;
            self.enter(NodeState::RxHeader, now_ms);
            return;
        }
        if !uart.tx_buffer_empty() {
            if self.elapsed(now_ms) > TIMEOUT_MS {
                self.pending = None;
                self.staged.clear();
                self.committing = false;
                self.fail(NodeError::Timeout, now_ms);
            }
            return;
        }

        let result = if self.committing {
            // every staged value is applied, the first failure is kept
            let mut result = Ok(());
            for slot in self.staged.iter() {
                let applied = self.apply(slot, module);
                if applied.is_ok() {
                    debug!("committed property {}", slot.property.0);
                }
                result = result.and(applied);
            }
            self.staged.clear();
            self.committing = false;
            result
        } else {
            match self.pending.take() {
                Some(slot) => self.apply(&slot, module),
                None => Ok(()),
            }
        };
        match result {
            Ok(()) => self.enter(NodeState::RxHeader, now_ms),
            Err(err) => self.fail(err, now_ms),
        }
    }

    fn apply(&self, slot: &Slot, module: &mut M) -> Result<(), NodeError> {
        let def = self
            .table
            .get(slot.property)
            .ok_or(NodeError::PropertyNotSupported)?;
        if !def.access.writable() {
            return Err(NodeError::WriteNotSupported);
        }
        def.deserialize(module, &slot.data).map_err(|e| match e {
            PropertyError::NotSupported => NodeError::WriteNotSupported,
            PropertyError::Handler(_) => NodeError::SetCallbackFailed,
            PropertyError::Size(_) => NodeError::DecodeFailure,
        })
    }

    fn error<U: NodeUart>(&mut self, uart: &mut U, now_ms: u32) {
        while read_if_writable(uart).is_some() {
            uart.write_byte(0);
        }
        if uart.is_busy() {
            self.since_ms = now_ms;
        } else if self.elapsed(now_ms) >= RECOVERY_DELAY_MS {
            self.enter(NodeState::RxHeader, now_ms);
        }
    }
}

/// Read one byte, but only when it can be forwarded right away
fn read_if_writable<U: NodeUart>(uart: &mut U) -> Option<u8> {
    if uart.bytes_writable() == 0 {
        return None;
    }
    uart.read_byte()
}
