//! Module collection and its synchronization state
//!
//! Staleness is tracked per property at two levels. The collection bits
//! cover every module at once and map onto a single `read_all` or broadcast.
//! The per-module bits map onto a per-node write. [`Collection::promote`]
//! turns per-module writes into a broadcast when every module holds the same
//! value anyway.

use heapless::Vec;

use flapchain_protocol::{NodeError, NodeState, PropertyDef, PropertyId, PropertySet};

use crate::model::ChainModel;

/// How a stale property is brought back in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncMethod {
    /// Collect the value from every node
    ReadAll,
    /// Broadcast the value of module 0 to every node
    WriteAll,
}

/// Chain transaction that brings a property back in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Operation {
    ReadAll,
    Broadcast,
    /// Per-node write of the modules with a local bit
    WriteSeq,
}

/// One module and its local state
#[derive(Debug, Clone, Default)]
pub struct ModuleEntry<M> {
    pub module: M,
    write_required: PropertySet,
    last_error: NodeError,
    error_state: Option<NodeState>,
}

impl<M> ModuleEntry<M> {
    fn new(module: M) -> Self {
        Self {
            module,
            write_required: PropertySet::EMPTY,
            last_error: NodeError::None,
            error_state: None,
        }
    }

    /// Properties waiting for a per-node write
    pub fn write_required(&self) -> PropertySet {
        self.write_required
    }

    /// Last error the node reported and the state it happened in
    pub fn last_error(&self) -> (NodeError, Option<NodeState>) {
        (self.last_error, self.error_state)
    }
}

/// Ordered modules of a display plus their sync bits
#[derive(Debug, Clone)]
pub struct Collection<M, const N: usize> {
    modules: Vec<ModuleEntry<M>, N>,
    read_required: PropertySet,
    write_required: PropertySet,
}

impl<M, const N: usize> Default for Collection<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, const N: usize> Collection<M, N> {
    pub const fn new() -> Self {
        Self {
            modules: Vec::new(),
            read_required: PropertySet::EMPTY,
            write_required: PropertySet::EMPTY,
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn module(&self, index: usize) -> Option<&M> {
        self.modules.get(index).map(|e| &e.module)
    }

    pub fn module_mut(&mut self, index: usize) -> Option<&mut M> {
        self.modules.get_mut(index).map(|e| &mut e.module)
    }

    pub fn entry(&self, index: usize) -> Option<&ModuleEntry<M>> {
        self.modules.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &M> {
        self.modules.iter().map(|e| &e.module)
    }

    pub fn read_required(&self) -> PropertySet {
        self.read_required
    }

    pub fn write_required(&self) -> PropertySet {
        self.write_required
    }

    /// Request a collection-wide sync of `property`
    ///
    /// A read request cancels a pending broadcast of the same property and
    /// the other way around.
    pub fn mark_dirty(&mut self, property: PropertyId, method: SyncMethod) {
        match method {
            SyncMethod::ReadAll => {
                self.write_required.remove(property);
                self.read_required.insert(property);
            }
            SyncMethod::WriteAll => {
                self.read_required.remove(property);
                self.write_required.insert(property);
            }
        }
    }

    /// Request a per-node write of `property` to module `index`
    pub fn mark_module_dirty(&mut self, index: usize, property: PropertyId) -> bool {
        match self.modules.get_mut(index) {
            Some(entry) => {
                entry.write_required.insert(property);
                true
            }
            None => false,
        }
    }

    /// Forget every pending sync of `property`
    pub fn mark_clean(&mut self, property: PropertyId) {
        self.read_required.remove(property);
        self.write_required.remove(property);
        for entry in self.modules.iter_mut() {
            entry.write_required.remove(property);
        }
    }

    /// True when no property of the collection or any module is stale
    pub fn is_synchronized(&self) -> bool {
        self.read_required.is_empty()
            && self.write_required.is_empty()
            && self.modules.iter().all(|e| e.write_required.is_empty())
    }

    /// Turn per-module writes of `def` into a broadcast when all values match
    ///
    /// Returns true if the property was promoted.
    pub fn promote(&mut self, def: &PropertyDef<M>) -> bool {
        let property = def.id;
        if !self
            .modules
            .iter()
            .any(|e| e.write_required.contains(property))
        {
            return false;
        }
        let Some((first, rest)) = self.modules.split_first() else {
            return false;
        };
        let all_equal = rest
            .iter()
            .all(|e| def.values_equal(&first.module, &e.module) == Some(true));
        if !all_equal {
            return false;
        }

        debug!("promoting {} to a broadcast", def.name);
        for entry in self.modules.iter_mut() {
            entry.write_required.remove(property);
        }
        self.mark_dirty(property, SyncMethod::WriteAll);
        true
    }

    /// Operation the worker runs next for `property`, if any
    pub fn pending_operation(&self, property: PropertyId) -> Option<Operation> {
        if self.read_required.contains(property) {
            Some(Operation::ReadAll)
        } else if self.write_required.contains(property) {
            Some(Operation::Broadcast)
        } else if self
            .modules
            .iter()
            .any(|e| e.write_required.contains(property))
        {
            Some(Operation::WriteSeq)
        } else {
            None
        }
    }
}

impl<M: Default, const N: usize> Collection<M, N> {
    /// Grow or shrink to `count` modules
    ///
    /// New modules start with default values and clean bits. Counts beyond
    /// the capacity are clamped.
    pub fn resize(&mut self, count: usize) {
        if count > N {
            warn!("chain reports {} modules, keeping {}", count, N);
        }
        let count = count.min(N);
        if count != self.modules.len() {
            info!("module count {} -> {}", self.modules.len(), count);
        }
        self.modules.truncate(count);
        while self.modules.len() < count {
            if self.modules.push(ModuleEntry::new(M::default())).is_err() {
                break;
            }
        }
    }
}

impl<M: Default, const N: usize> ChainModel for Collection<M, N> {
    type Module = M;

    fn node_count(&self) -> u16 {
        self.modules.len() as u16
    }

    fn capacity(&self) -> u16 {
        N.min(u16::MAX as usize) as u16
    }

    fn with_module<R>(&self, index: u16, f: impl FnOnce(&M) -> R) -> Option<R> {
        self.module(index as usize).map(f)
    }

    fn with_module_mut<R>(&mut self, index: u16, f: impl FnOnce(&mut M) -> R) -> Option<R> {
        self.module_mut(index as usize).map(f)
    }

    fn on_node_count_changed(&mut self, count: u16) {
        self.resize(count as usize);
    }

    fn must_write(&self, index: u16, property: PropertyId) -> bool {
        self.modules
            .get(index as usize)
            .is_some_and(|e| e.write_required.contains(property))
    }

    fn on_node_error(&mut self, index: u16, error: NodeError, state: Option<NodeState>) {
        if let Some(entry) = self.modules.get_mut(index as usize) {
            entry.last_error = error;
            entry.error_state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flapchain_protocol::splitflap::{self, CharacterSet, SplitflapModule};

    fn collection(count: usize) -> Collection<SplitflapModule, 8> {
        let mut c = Collection::new();
        c.resize(count);
        c
    }

    fn def(id: PropertyId) -> &'static PropertyDef<SplitflapModule> {
        splitflap::table().get(id).unwrap()
    }

    #[test]
    fn test_mark_dirty_exclusive() {
        let mut c = collection(2);
        c.mark_dirty(splitflap::OFFSET, SyncMethod::WriteAll);
        assert!(c.write_required().contains(splitflap::OFFSET));
        c.mark_dirty(splitflap::OFFSET, SyncMethod::ReadAll);
        assert!(c.read_required().contains(splitflap::OFFSET));
        assert!(!c.write_required().contains(splitflap::OFFSET));
        assert_eq!(c.pending_operation(splitflap::OFFSET), Some(Operation::ReadAll));
    }

    #[test]
    fn test_mark_clean_clears_everything() {
        let mut c = collection(3);
        c.mark_dirty(splitflap::COLOR, SyncMethod::WriteAll);
        assert!(c.mark_module_dirty(1, splitflap::COLOR));
        assert!(!c.mark_module_dirty(5, splitflap::COLOR));
        assert!(!c.is_synchronized());

        c.mark_clean(splitflap::COLOR);
        assert!(c.is_synchronized());
        assert_eq!(c.pending_operation(splitflap::COLOR), None);
    }

    #[test]
    fn test_promote_equal_values() {
        let mut c = collection(3);
        for i in 0..3 {
            c.module_mut(i).unwrap().offset = 12;
        }
        c.mark_module_dirty(2, splitflap::OFFSET);

        assert!(c.promote(def(splitflap::OFFSET)));
        assert!(c.write_required().contains(splitflap::OFFSET));
        assert!(c.entry(2).unwrap().write_required().is_empty());
        assert_eq!(c.pending_operation(splitflap::OFFSET), Some(Operation::Broadcast));
    }

    #[test]
    fn test_promote_differing_values_untouched() {
        let mut c = collection(3);
        c.module_mut(1).unwrap().offset = 4;
        c.mark_module_dirty(1, splitflap::OFFSET);

        assert!(!c.promote(def(splitflap::OFFSET)));
        assert!(!c.write_required().contains(splitflap::OFFSET));
        assert!(c.entry(1).unwrap().write_required().contains(splitflap::OFFSET));
        assert_eq!(c.pending_operation(splitflap::OFFSET), Some(Operation::WriteSeq));
    }

    #[test]
    fn test_promote_needs_local_bit_and_compare() {
        let mut c = collection(2);
        assert!(!c.promote(def(splitflap::OFFSET)));

        // module_info has no compare handler
        c.mark_module_dirty(0, splitflap::MODULE_INFO);
        assert!(!c.promote(def(splitflap::MODULE_INFO)));
    }

    #[test]
    fn test_promote_dynamic_values() {
        let mut c = collection(2);
        for i in 0..2 {
            c.module_mut(i).unwrap().character_set = CharacterSet::from_chars("0123").unwrap();
        }
        c.mark_module_dirty(0, splitflap::CHARACTER_SET);
        c.mark_module_dirty(1, splitflap::CHARACTER_SET);
        assert!(c.promote(def(splitflap::CHARACTER_SET)));
    }

    #[test]
    fn test_resize_clamps_and_starts_clean() {
        let mut c = collection(2);
        c.mark_module_dirty(1, splitflap::CHARACTER);
        c.resize(1);
        c.resize(3);
        assert_eq!(c.len(), 3);
        assert!(c.entry(1).unwrap().write_required().is_empty());

        c.resize(100);
        assert_eq!(c.len(), 8);
    }

    #[test]
    fn test_chain_model_callbacks() {
        let mut c = collection(2);
        c.mark_module_dirty(1, splitflap::OFFSET);
        assert!(!c.must_write(0, splitflap::OFFSET));
        assert!(c.must_write(1, splitflap::OFFSET));
        assert!(!c.must_write(7, splitflap::OFFSET));

        c.on_node_error(1, NodeError::Timeout, Some(NodeState::RxProperty));
        assert_eq!(
            c.entry(1).unwrap().last_error(),
            (NodeError::Timeout, Some(NodeState::RxProperty))
        );

        c.on_node_count_changed(4);
        assert_eq!(c.node_count(), 4);
        assert_eq!(c.with_module(3, |m| m.offset), Some(0));
        assert_eq!(c.with_module(4, |m| m.offset), None);
    }
}
