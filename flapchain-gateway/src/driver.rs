//! Blocking chain driver
//!
//! One method per chain transaction. Every method flushes stale input first,
//! so a failed transaction never leaks bytes into the next one. Nothing is
//! retried here; retry policy belongs to the caller.

use embedded_hal::delay::DelayNs;
use flapchain_hal::GatewayUart;
use flapchain_protocol::{
    encode_frame, encode_placeholder, Action, ActionHeader, DecodedFrame, ErrorCategories,
    FrameAccumulator, NodeError, NodeState, PayloadBuf, PropertyDef, PropertyId, PropertySize,
    PropertyTable, RawHeader, SyncHeader, SyncType, ACTION_HEADER_SIZE, PAYLOAD_SIZE_MAX,
};

use crate::config::DriverConfig;
use crate::error::GatewayError;
use crate::model::ChainModel;

/// Gateway end of the chain
pub struct GatewayDriver<'a, M, U, D> {
    table: PropertyTable<'a, M>,
    uart: U,
    delay: D,
    config: DriverConfig,
    /// Nodes seen in the last header that came back
    chain_len: u16,
}

impl<'a, M, U, D> GatewayDriver<'a, M, U, D>
where
    U: GatewayUart,
    D: DelayNs,
{
    pub fn new(table: PropertyTable<'a, M>, uart: U, delay: D, config: DriverConfig) -> Self {
        Self {
            table,
            uart,
            delay,
            config,
            chain_len: 0,
        }
    }

    /// Length of the chain as last reported on the wire
    ///
    /// Can exceed the model's node count when the model has no room for
    /// every node.
    pub fn chain_len(&self) -> u16 {
        self.chain_len
    }

    pub fn table(&self) -> PropertyTable<'a, M> {
        self.table
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Give back the transport and delay source
    pub fn release(self) -> (U, D) {
        (self.uart, self.delay)
    }

    /// Wait until every node has left its error state
    pub fn recover(&mut self) {
        self.delay.delay_ms(self.config.recovery_delay_ms);
    }

    /// Collect `property` from every node into the model
    ///
    /// Nodes that fail to answer are skipped and queried for their error
    /// afterwards. A failing set handler does not stop the remaining nodes.
    pub fn read_all<T>(&mut self, model: &mut T, property: PropertyId) -> Result<(), GatewayError>
    where
        T: ChainModel<Module = M>,
    {
        if property.is_node_error_query() {
            return Err(GatewayError::InvalidArgument);
        }
        let def = self.table.get(property).ok_or(GatewayError::NotSupported)?;
        if !def.access.readable() || def.set.is_none() {
            return Err(GatewayError::NotSupported);
        }
        info!("reading {} from all nodes", def.name);

        let rx = self.start(ActionHeader::new(Action::Read, false, property, 0))?;
        let count = rx.node_count();
        self.update_count(model, count);

        let mut result = Ok(());
        let mut failed = false;
        for index in 0..count {
            match self.receive_frame()? {
                DecodedFrame::Data(data) => {
                    match model.with_module_mut(index, |m| def.deserialize(m, &data)) {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            warn!("set {} failed for node {}", def.name, index);
                            result = Err(e.into());
                        }
                        None => warn!("no room for node {}", index),
                    }
                }
                DecodedFrame::Empty => {
                    warn!("node {} sent no {}", index, def.name);
                    failed = true;
                }
                DecodedFrame::Placeholder => return Err(GatewayError::ChecksumMismatch),
            }
        }

        if rx.flag() || failed {
            let categories = self.node_err_check(model)?;
            if failed {
                return Err(GatewayError::NodeFailure(reported(categories)));
            }
        }
        result
    }

    /// Push `property` to the nodes
    ///
    /// A broadcast sends the value of module 0 to every node. Otherwise one
    /// frame per node is sent, a placeholder wherever the model says the node
    /// needs no write. Staged writes take effect on the next [`Self::commit`].
    pub fn write_all<T>(
        &mut self,
        model: &mut T,
        property: PropertyId,
        node_count: u16,
        staged: bool,
        broadcast: bool,
    ) -> Result<(), GatewayError>
    where
        T: ChainModel<Module = M>,
    {
        let def = self.table.get(property).ok_or(GatewayError::NotSupported)?;
        if !def.access.writable() || def.get.is_none() {
            return Err(GatewayError::NotSupported);
        }
        if !broadcast && node_count == 0 {
            return Err(GatewayError::InvalidArgument);
        }

        let (action, header_count) = if broadcast {
            (Action::Broadcast, 0)
        } else {
            (Action::Write, node_count)
        };
        info!("writing {} to {} nodes", def.name, node_count);

        let header = ActionHeader::new(action, staged, property, header_count)
            .ok_or(GatewayError::InvalidArgument)?;
        self.uart.flush_input().map_err(|_| GatewayError::Transport)?;
        self.send(&header.pack())?;

        let mut sent = PayloadBuf::new();
        if broadcast {
            sent = self.encode_value(model, def, 0)?;
            self.send(&sent)?;
        } else {
            for index in (0..node_count).rev() {
                let frame = if model.must_write(index, property) {
                    self.encode_value(model, def, index)?
                } else {
                    encode_placeholder(placeholder_len(def.size))?
                };
                self.send(&frame)?;
            }
        }

        let rx = self.receive_header()?;
        if rx.action() != action || rx.property() != property || rx.flag() != staged {
            return Err(GatewayError::HeaderMismatch);
        }

        if broadcast {
            self.update_count(model, rx.node_count());
            let mut echo = [0u8; PAYLOAD_SIZE_MAX];
            let echo = echo
                .get_mut(..sent.len())
                .ok_or(GatewayError::BufferTooSmall)?;
            self.receive(echo)?;
            if echo[..] != sent[..] {
                return Err(GatewayError::PayloadMismatch);
            }
        } else if rx.node_count() != 0 {
            // the frames of missing nodes come back unconsumed
            let reached = node_count.saturating_sub(rx.node_count());
            warn!("write reached {} of {} nodes", reached, node_count);
            self.update_count(model, reached);
        }

        let categories = self.sync_ack()?;
        if !categories.is_empty() {
            warn!("nodes reported errors 0x{:x}", categories.bits());
            self.node_err_check(model)?;
            return Err(GatewayError::NodeFailure(categories));
        }
        Ok(())
    }

    /// Per-node write of `property` to every node on the chain
    ///
    /// Nodes the model has no room for get placeholders.
    pub fn write_seq<T>(&mut self, model: &mut T, property: PropertyId) -> Result<(), GatewayError>
    where
        T: ChainModel<Module = M>,
    {
        let count = model.node_count().max(self.chain_len);
        self.write_all(model, property, count, false, false)
    }

    /// Ask every node for its last error
    ///
    /// Every answer goes to [`ChainModel::on_node_error`], including nodes
    /// without an error. Returns the union of the reported categories.
    pub fn node_err_check<T>(&mut self, model: &mut T) -> Result<ErrorCategories, GatewayError>
    where
        T: ChainModel<Module = M>,
    {
        debug!("polling node errors");
        let rx = self.start(ActionHeader::new(
            Action::Read,
            false,
            PropertyId::NODE_ERROR,
            0,
        ))?;
        let count = rx.node_count();
        self.update_count(model, count);

        let mut categories = ErrorCategories::NONE;
        for index in 0..count {
            match self.receive_frame()? {
                DecodedFrame::Data(data) if data.len() == 2 => {
                    let error = NodeError::from_u8(data[0]);
                    let state = NodeState::from_u8(data[1]);
                    if !error.is_none() {
                        warn!("node {} reported {}", index, error.name());
                    }
                    categories |= error.category();
                    model.on_node_error(index, error, state);
                }
                _ => {
                    warn!("node {} did not report its error", index);
                    categories |= ErrorCategories::OTHER;
                }
            }
        }
        Ok(categories)
    }

    /// Collect the error categories of every node
    pub fn sync_ack(&mut self) -> Result<ErrorCategories, GatewayError> {
        let rx = self.sync(SyncType::Ack)?;
        Ok(rx.errors)
    }

    /// Make every node apply its staged write
    pub fn commit(&mut self) -> Result<(), GatewayError> {
        let rx = self.sync(SyncType::Commit)?;
        if !rx.errors.is_empty() {
            return Err(GatewayError::HeaderMismatch);
        }
        Ok(())
    }

    /// Tell the model about a node count it does not know yet
    fn update_count<T: ChainModel>(&mut self, model: &mut T, count: u16) {
        self.chain_len = count;
        if model.node_count() != count.min(model.capacity()) {
            debug!("chain has {} nodes", count);
            model.on_node_count_changed(count);
        }
    }

    fn sync(&mut self, sync_type: SyncType) -> Result<SyncHeader, GatewayError> {
        self.uart.flush_input().map_err(|_| GatewayError::Transport)?;
        self.uart.wait_tx_done().map_err(|_| GatewayError::Transport)?;
        self.send(&[SyncHeader::new(sync_type).pack()])?;

        let mut byte = [0u8; 1];
        self.receive(&mut byte)?;
        let rx = SyncHeader::unpack(byte[0]).map_err(|_| GatewayError::HeaderMismatch)?;
        if rx.sync_type != sync_type {
            return Err(GatewayError::HeaderMismatch);
        }
        Ok(rx)
    }

    /// Send a read header and check the echo
    fn start(&mut self, header: Option<ActionHeader>) -> Result<RawHeader, GatewayError> {
        let header = header.ok_or(GatewayError::InvalidArgument)?;
        self.uart.flush_input().map_err(|_| GatewayError::Transport)?;
        self.send(&header.pack())?;

        let rx = self.receive_header()?;
        if rx.action() != header.action || rx.property() != header.property {
            return Err(GatewayError::HeaderMismatch);
        }
        Ok(rx)
    }

    fn encode_value<T>(
        &self,
        model: &T,
        def: &PropertyDef<M>,
        index: u16,
    ) -> Result<PayloadBuf, GatewayError>
    where
        T: ChainModel<Module = M>,
    {
        let data = model
            .with_module(index, |m| def.serialize(m))
            .ok_or(GatewayError::InvalidArgument)??;
        Ok(encode_frame(&data)?)
    }

    fn send(&mut self, data: &[u8]) -> Result<(), GatewayError> {
        self.uart
            .write_blocking(data)
            .map_err(|_| GatewayError::Transport)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), GatewayError> {
        let timeout = self.config.rx_timeout_ms(buf.len());
        let n = self
            .uart
            .read_timeout(buf, timeout)
            .map_err(|_| GatewayError::Transport)?;
        if n < buf.len() {
            return Err(GatewayError::Timeout);
        }
        Ok(())
    }

    fn receive_header(&mut self) -> Result<RawHeader, GatewayError> {
        let mut raw = RawHeader::new();
        self.receive(&mut raw.0[..ACTION_HEADER_SIZE])?;
        if !raw.parity_valid() {
            return Err(GatewayError::HeaderMismatch);
        }
        Ok(raw)
    }

    fn receive_frame(&mut self) -> Result<DecodedFrame, GatewayError> {
        let timeout = self.config.rx_timeout_ms(1);
        let mut frame = FrameAccumulator::new();
        loop {
            let byte = self
                .uart
                .read_byte(timeout)
                .map_err(|_| GatewayError::Transport)?
                .ok_or(GatewayError::Timeout)?;
            if frame.feed(byte)? {
                return Ok(frame.decode()?);
            }
        }
    }
}


/// Data length of the do-nothing frame for a property
fn placeholder_len(size: PropertySize) -> usize {
    match size {
        PropertySize::Static(n) => n as usize,
        PropertySize::Dynamic => PropertySize::DYNAMIC_PREFIX,
    }
}

/// Failed nodes always count as an error, even if they lost their record
fn reported(categories: ErrorCategories) -> ErrorCategories {
    if categories.is_empty() {
        ErrorCategories::OTHER
    } else {
        categories
    }
}
