//! Gateway driver and worker against a simulated chain of node engines

mod sim;

use embassy_futures::block_on;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use flapchain_gateway::{ChainModel, Collection, Display, GatewayError, SyncMethod};
use flapchain_protocol::splitflap::{self, Color, Rgb, SplitflapModule};
use flapchain_protocol::{
    Access, ErrorCategories, HandlerError, NodeError, NodeState, PropertyDef, PropertyId,
    PropertySize, PropertyTable,
};

use sim::{blank_modules, module_with_chars, setup, setup_with_table};

type Modules = Collection<SplitflapModule, 8>;
type TestDisplay = Display<NoopRawMutex, SplitflapModule, 8>;
type SmallDisplay = Display<NoopRawMutex, SplitflapModule, 2>;

/// Collection that remembers every node count it was told about
#[derive(Default)]
struct Recorder {
    inner: Modules,
    counts: Vec<u16>,
}

impl ChainModel for Recorder {
    type Module = SplitflapModule;

    fn node_count(&self) -> u16 {
        self.inner.node_count()
    }

    fn capacity(&self) -> u16 {
        self.inner.capacity()
    }

    fn with_module<R>(&self, index: u16, f: impl FnOnce(&SplitflapModule) -> R) -> Option<R> {
        self.inner.with_module(index, f)
    }

    fn with_module_mut<R>(
        &mut self,
        index: u16,
        f: impl FnOnce(&mut SplitflapModule) -> R,
    ) -> Option<R> {
        self.inner.with_module_mut(index, f)
    }

    fn on_node_count_changed(&mut self, count: u16) {
        self.counts.push(count);
        self.inner.on_node_count_changed(count);
    }

    fn must_write(&self, index: u16, property: PropertyId) -> bool {
        self.inner.must_write(index, property)
    }

    fn on_node_error(&mut self, index: u16, error: NodeError, state: Option<NodeState>) {
        self.inner.on_node_error(index, error, state);
    }
}

const BACKLIGHT: PropertyId = PropertyId(20);

fn refuse(_: &mut SplitflapModule, _: &[u8]) -> Result<(), HandlerError> {
    Err(HandlerError)
}

fn get_backlight(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    buf[0] = m.minimum_rotation;
    Ok(1)
}

fn set_backlight(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    m.minimum_rotation = data[0];
    Ok(())
}

/// Gateway-side table that disagrees with the modules
static MISMATCHED: [PropertyDef<SplitflapModule>; 2] = [
    PropertyDef::new(
        splitflap::CHARACTER_SET,
        "character_set",
        Access::ReadWrite,
        PropertySize::Dynamic,
    )
    .with_set(refuse),
    PropertyDef::new(BACKLIGHT, "backlight", Access::ReadWrite, PropertySize::Static(1))
        .with_get(get_backlight)
        .with_set(set_backlight),
];

fn get_offset(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    buf[0] = m.offset;
    Ok(1)
}

fn set_offset(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    m.offset = data[0];
    Ok(())
}

/// Gateway-side table with a property the modules do not know
static WITH_BACKLIGHT: [PropertyDef<SplitflapModule>; 2] = [
    PropertyDef::new(splitflap::OFFSET, "offset", Access::ReadWrite, PropertySize::Static(1))
        .with_get(get_offset)
        .with_set(set_offset),
    PropertyDef::new(BACKLIGHT, "backlight", Access::ReadWrite, PropertySize::Static(1))
        .with_get(get_backlight)
        .with_set(set_backlight),
];

fn offsets(chain: &sim::SharedChain) -> Vec<u8> {
    chain.borrow().modules.iter().map(|m| m.offset).collect()
}

fn characters(chain: &sim::SharedChain) -> Vec<u8> {
    chain.borrow().modules.iter().map(|m| m.character).collect()
}

#[test]
fn test_read_all_collects_every_node() {
    let (_chain, mut driver) = setup(vec![
        module_with_chars("AB"),
        module_with_chars("CD"),
        module_with_chars("EF"),
    ]);
    let mut model = Recorder::default();

    driver
        .read_all(&mut model, splitflap::CHARACTER_SET)
        .unwrap();

    assert_eq!(model.counts, [3]);
    let sets: Vec<String> = model
        .inner
        .iter()
        .map(|m| {
            let set = &m.character_set;
            (0..set.len()).filter_map(|i| set.symbol(i)).collect()
        })
        .collect();
    assert_eq!(sets, ["AB", "CD", "EF"]);
}

#[test]
fn test_write_all_skips_clean_modules() {
    let mut nodes = blank_modules(3);
    for (module, offset) in nodes.iter_mut().zip([11, 22, 33]) {
        module.offset = offset;
    }
    let (chain, mut driver) = setup(nodes);

    let mut model = Modules::new();
    model.resize(3);
    model.module_mut(1).unwrap().offset = 7;
    model.mark_module_dirty(1, splitflap::OFFSET);

    driver
        .write_all(&mut model, splitflap::OFFSET, 3, false, false)
        .unwrap();

    assert_eq!(offsets(&chain), [11, 7, 33]);
    // header, three equally long frames and the acknowledge
    assert_eq!(chain.borrow().gateway_sent(), 3 + 3 * 4 + 1);
}

#[test]
fn test_staged_write_applies_on_commit() {
    let (chain, mut driver) = setup(blank_modules(3));
    let mut model = Modules::new();
    model.resize(3);
    for i in 0..3 {
        model.module_mut(i).unwrap().offset = 40 + i as u8;
        model.mark_module_dirty(i, splitflap::OFFSET);
    }

    driver
        .write_all(&mut model, splitflap::OFFSET, 3, true, false)
        .unwrap();
    assert_eq!(offsets(&chain), [0, 0, 0]);
    assert!(chain.borrow().nodes.iter().all(|n| n.has_staged()));

    driver.commit().unwrap();
    assert_eq!(offsets(&chain), [40, 41, 42]);
    assert!(chain.borrow().nodes.iter().all(|n| !n.has_staged()));

    // a second commit has nothing left to apply
    chain.borrow_mut().modules[0].offset = 1;
    driver.commit().unwrap();
    assert_eq!(offsets(&chain), [1, 41, 42]);
}

#[test]
fn test_broadcast_reaches_every_node() {
    let (chain, mut driver) = setup(blank_modules(4));
    let mut model = Recorder::default();
    model.inner.resize(1);
    model.inner.module_mut(0).unwrap().character = 17;

    driver
        .write_all(&mut model, splitflap::CHARACTER, 1, false, true)
        .unwrap();

    assert_eq!(characters(&chain), [17, 17, 17, 17]);
    assert_eq!(model.counts, [4]);
    assert_eq!(model.node_count(), 4);
}

#[test]
fn test_invalid_requests_send_nothing() {
    let (chain, mut driver) = setup(blank_modules(2));
    let mut model = Modules::new();

    assert_eq!(
        driver.read_all(&mut model, PropertyId::NODE_ERROR),
        Err(GatewayError::InvalidArgument)
    );
    assert_eq!(
        driver.read_all(&mut model, splitflap::FIRMWARE_UPDATE),
        Err(GatewayError::NotSupported)
    );
    assert_eq!(
        driver.write_all(&mut model, splitflap::MODULE_INFO, 2, false, false),
        Err(GatewayError::NotSupported)
    );
    assert_eq!(
        driver.write_all(&mut model, splitflap::OFFSET, 0, false, false),
        Err(GatewayError::InvalidArgument)
    );
    assert_eq!(chain.borrow().gateway_sent(), 0);
}

#[test]
fn test_unknown_property_polls_node_errors() {
    let (chain, mut driver) =
        setup_with_table(blank_modules(3), PropertyTable::new(&MISMATCHED));
    let mut model = Modules::new();

    let result = driver.read_all(&mut model, BACKLIGHT);

    assert_eq!(
        result,
        Err(GatewayError::NodeFailure(ErrorCategories::NOT_SUPPORTED))
    );
    assert!(result.unwrap_err().is_not_supported());
    for i in 0..3 {
        assert_eq!(
            model.entry(i).unwrap().last_error(),
            (NodeError::PropertyNotSupported, Some(NodeState::TxProperty))
        );
    }
    // reporting an error clears it on the node
    assert!(chain
        .borrow()
        .nodes
        .iter()
        .all(|n| n.last_error() == NodeError::None));
}

#[test]
fn test_node_errors_survive_until_queried() {
    let (chain, mut driver) = setup(blank_modules(3));
    let mut model = Modules::new();
    model.resize(3);
    for i in 0..3 {
        model.module_mut(i).unwrap().offset = 5;
        model.mark_module_dirty(i, splitflap::OFFSET);
    }

    // link 1 carries the header, then the frames for modules 2 and 1;
    // corrupt the value byte of the frame for module 1
    chain.borrow_mut().inject_fault(1, 3 + 4 + 1, 0x01);
    assert!(driver
        .write_all(&mut model, splitflap::OFFSET, 3, false, false)
        .is_err());
    assert_eq!(offsets(&chain), [5, 0, 5]);

    // let every node fall back to listening for headers
    chain.borrow_mut().advance(100);
    assert!(chain
        .borrow()
        .states()
        .iter()
        .all(|&s| s == NodeState::RxHeader));

    assert_eq!(driver.sync_ack(), Ok(ErrorCategories::TRANSMISSION));
    assert_eq!(
        driver.node_err_check(&mut model),
        Ok(ErrorCategories::TRANSMISSION)
    );
    assert_eq!(model.entry(0).unwrap().last_error(), (NodeError::None, None));
    assert_eq!(
        model.entry(1).unwrap().last_error(),
        (NodeError::ChecksumMismatch, Some(NodeState::RxProperty))
    );
    assert_eq!(
        model.entry(2).unwrap().last_error(),
        (NodeError::Timeout, Some(NodeState::RxHeader))
    );
    assert_eq!(driver.sync_ack(), Ok(ErrorCategories::NONE));
}

#[test]
fn test_upstream_error_flag_reaches_gateway() {
    let (chain, mut driver) =
        setup_with_table(blank_modules(3), PropertyTable::new(&WITH_BACKLIGHT));
    let mut model = Modules::new();
    model.resize(3);
    model.mark_module_dirty(0, BACKLIGHT);

    // only module 0 stages a value, and fails to apply it on commit
    driver
        .write_all(&mut model, BACKLIGHT, 3, true, false)
        .unwrap();
    driver.commit().unwrap();
    chain.borrow_mut().advance(40);
    assert_eq!(chain.borrow().nodes[0].last_error(), NodeError::PropertyNotSupported);
    assert!(chain.borrow().nodes[1].last_error().is_none());
    assert!(chain.borrow().nodes[2].last_error().is_none());

    driver.read_all(&mut model, splitflap::OFFSET).unwrap();
    assert_eq!(
        model.entry(0).unwrap().last_error(),
        (NodeError::PropertyNotSupported, Some(NodeState::CommitProperty))
    );
    assert_eq!(model.entry(1).unwrap().last_error(), (NodeError::None, None));
    assert!(chain.borrow().nodes[0].last_error().is_none());
}

#[test]
fn test_count_beyond_capacity_reported_once() {
    let (_chain, mut driver) = setup(blank_modules(10));
    let mut model = Recorder::default();

    driver.read_all(&mut model, splitflap::OFFSET).unwrap();
    driver.read_all(&mut model, splitflap::OFFSET).unwrap();
    assert_eq!(model.counts, [10]);
    assert_eq!(model.inner.len(), 8);
    assert_eq!(driver.chain_len(), 10);
}

#[test]
fn test_worker_writes_chain_longer_than_capacity() {
    let (chain, mut driver) = setup(blank_modules(4));
    let display = SmallDisplay::new();

    display.mark_dirty(splitflap::OFFSET, SyncMethod::ReadAll);
    display.sync_pass(&mut driver);
    assert_eq!(display.lock(|c| c.len()), 2);

    // nodes past the capacity get placeholders
    assert!(display.update_module(1, splitflap::CHARACTER, |m| m.character = 7));
    display.sync_pass(&mut driver);
    assert_eq!(characters(&chain), [0, 7, 0, 0]);
    assert!(display.lock(|c| c.is_synchronized()));
    assert!(chain.borrow().nodes.iter().all(|n| n.last_error().is_none()));
}

#[test]
fn test_worker_pass_reads_then_writes() {
    let (chain, mut driver) = setup(vec![
        module_with_chars("AB"),
        module_with_chars("CD"),
        module_with_chars("EF"),
    ]);
    let display = TestDisplay::new();

    display.mark_dirty(splitflap::CHARACTER_SET, SyncMethod::ReadAll);
    display.sync_pass(&mut driver);
    block_on(display.wait_synchronized());
    assert_eq!(display.lock(|c| c.len()), 3);
    assert_eq!(
        display.lock(|c| c.module(2).and_then(|m| m.character_set.symbol(1).map(String::from))),
        Some(String::from("F"))
    );
    assert!(display.lock(|c| c.is_synchronized()));

    // differing values go out as a per-node write
    assert!(display.update_module(1, splitflap::CHARACTER, |m| m.character = 4));
    display.sync_pass(&mut driver);
    assert_eq!(characters(&chain), [0, 4, 0]);
    assert!(display.lock(|c| c.is_synchronized()));

    // equal values are promoted to a single broadcast frame
    display.lock(|c| {
        for i in 0..3 {
            c.module_mut(i).unwrap().character = 9;
            c.mark_module_dirty(i, splitflap::CHARACTER);
        }
    });
    let before = chain.borrow().gateway_sent();
    display.sync_pass(&mut driver);
    assert_eq!(characters(&chain), [9, 9, 9]);
    assert_eq!(chain.borrow().gateway_sent() - before, 3 + 4 + 1);
    assert!(display.lock(|c| c.is_synchronized()));
}

#[test]
fn test_worker_retries_broadcast_after_recovery() {
    let (chain, mut driver) = setup(blank_modules(2));
    let display = TestDisplay::new();
    let color = Color {
        foreground: Rgb { r: 1, g: 2, b: 3 },
        background: Rgb { r: 4, g: 5, b: 6 },
    };
    display.lock(|c| {
        c.resize(2);
        c.module_mut(0).unwrap().color = color;
    });
    display.mark_dirty(splitflap::COLOR, SyncMethod::WriteAll);

    // break the parity of the first header
    chain.borrow_mut().inject_fault(0, 0, 0x01);
    let start = chain.borrow().now_ms;
    display.sync_pass(&mut driver);

    assert!(chain.borrow().modules.iter().all(|m| m.color == color));
    assert!(chain.borrow().now_ms - start >= 30);
    assert!(display.lock(|c| c.is_synchronized()));
}

#[test]
fn test_worker_keeps_failed_properties_dirty() {
    let (_chain, mut driver) = setup_with_table(
        vec![module_with_chars("AB"), module_with_chars("CD")],
        PropertyTable::new(&MISMATCHED),
    );
    let display = TestDisplay::new();
    display.mark_dirty(splitflap::CHARACTER_SET, SyncMethod::ReadAll);
    display.mark_dirty(BACKLIGHT, SyncMethod::ReadAll);

    display.sync_pass(&mut driver);

    // handler failures are retried, unsupported properties are dropped
    assert!(display.lock(|c| c.read_required().contains(splitflap::CHARACTER_SET)));
    assert!(!display.lock(|c| c.read_required().contains(BACKLIGHT)));
    assert_eq!(display.lock(|c| c.len()), 2);
}

#[test]
fn test_worker_skips_writes_without_modules() {
    let (chain, mut driver) = setup(blank_modules(2));
    let display = TestDisplay::new();
    display.mark_dirty(splitflap::OFFSET, SyncMethod::WriteAll);

    display.sync_pass(&mut driver);

    assert_eq!(chain.borrow().gateway_sent(), 0);
    assert!(display.lock(|c| c.write_required().contains(splitflap::OFFSET)));
}

#[test]
fn test_run_signals_synchronized() {
    let (_chain, driver) = setup(vec![module_with_chars("12"), module_with_chars("34")]);
    let display = TestDisplay::new();

    let outcome = block_on(select(display.run(driver), async {
        display.mark_dirty(splitflap::CHARACTER_SET, SyncMethod::ReadAll);
        display.wait_synchronized().await;
    }));

    assert!(matches!(outcome, Either::Second(())));
    assert_eq!(display.lock(|c| c.len()), 2);
    assert!(display.lock(|c| c.is_synchronized()));
}
