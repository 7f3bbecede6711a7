//! Gateway view of the chain

use flapchain_protocol::{NodeError, NodeState, PropertyId};

/// Mirror of the modules on the chain
///
/// The driver reads values out of and writes values into the mirror through
/// this trait. Module access goes through closures so that implementations
/// can keep their state behind a lock and hold it only for one callback.
pub trait ChainModel {
    /// Per-module value type the property handlers operate on
    type Module;

    /// Number of modules currently known
    fn node_count(&self) -> u16;

    /// Most modules the model can hold
    fn capacity(&self) -> u16 {
        u16::MAX
    }

    /// Run `f` on module `index`, `None` if there is no such module
    fn with_module<R>(&self, index: u16, f: impl FnOnce(&Self::Module) -> R) -> Option<R>;

    /// Run `f` on module `index` mutably, `None` if there is no such module
    fn with_module_mut<R>(&mut self, index: u16, f: impl FnOnce(&mut Self::Module) -> R)
        -> Option<R>;

    /// The chain reported `count` modules
    fn on_node_count_changed(&mut self, count: u16);

    /// Module `index` exists and holds a value of `property` to be written
    fn must_write(&self, index: u16, property: PropertyId) -> bool;

    /// Module `index` answered the node-error query
    fn on_node_error(&mut self, index: u16, error: NodeError, state: Option<NodeState>);
}
