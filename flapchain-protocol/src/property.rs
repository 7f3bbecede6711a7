//! Property registry
//!
//! A property is a piece of module state (character set, offset, ...) with a
//! fixed identifier. Both ends of the chain share one [`PropertyTable`]: the
//! node engine applies its handlers to the module it runs on, the gateway
//! applies them to its mirror of each module.
//!
//! Values travel as raw bytes. Dynamic values get a 2-byte little-endian
//! length prefix so the receiver can check it against the frame length.

use crate::frame::PropertyBuf;
use crate::PROPERTY_SIZE_MAX;

/// Property identifier, 7 bits on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PropertyId(pub u8);

impl PropertyId {
    /// Highest identifier usable for a real property
    pub const MAX: u8 = 126;

    /// Reserved identifier asking every node for its last error
    pub const NODE_ERROR: PropertyId = PropertyId(127);

    pub const fn is_node_error_query(self) -> bool {
        self.0 == Self::NODE_ERROR.0
    }
}

/// Handler reported that it could not produce or accept a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HandlerError;

impl core::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "property handler failed")
    }
}

/// Size check failures between a value and its declared size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SizeError {
    /// Length differs from the static size or the dynamic prefix
    Mismatch,
    /// Value does not fit in one frame
    TooLarge,
}

impl core::fmt::Display for SizeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SizeError::Mismatch => write!(f, "property size mismatch"),
            SizeError::TooLarge => write!(f, "property too large"),
        }
    }
}

/// Errors from running a property handler through its definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PropertyError {
    /// The definition has no handler for this direction
    NotSupported,
    Handler(HandlerError),
    Size(SizeError),
}

impl From<HandlerError> for PropertyError {
    fn from(e: HandlerError) -> Self {
        PropertyError::Handler(e)
    }
}

impl From<SizeError> for PropertyError {
    fn from(e: SizeError) -> Self {
        PropertyError::Size(e)
    }
}

/// Wire size of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PropertySize {
    /// Always exactly this many bytes
    Static(u16),
    /// Variable length, sent with a 2-byte length prefix
    Dynamic,
}

impl PropertySize {
    /// Length of the prefix in front of dynamic values
    pub const DYNAMIC_PREFIX: usize = 2;

    /// Largest value this size allows
    pub const fn max_value_len(&self) -> usize {
        match self {
            PropertySize::Static(n) => *n as usize,
            PropertySize::Dynamic => PROPERTY_SIZE_MAX - Self::DYNAMIC_PREFIX,
        }
    }

    /// Lay out `value` the way it travels inside a frame
    pub fn wrap(&self, value: &[u8]) -> Result<PropertyBuf, SizeError> {
        let mut out = PropertyBuf::new();
        match self {
            PropertySize::Static(n) => {
                if value.len() != *n as usize {
                    return Err(SizeError::Mismatch);
                }
            }
            PropertySize::Dynamic => {
                let len = u16::try_from(value.len()).map_err(|_| SizeError::TooLarge)?;
                out.extend_from_slice(&len.to_le_bytes())
                    .map_err(|_| SizeError::TooLarge)?;
            }
        }
        out.extend_from_slice(value)
            .map_err(|_| SizeError::TooLarge)?;
        Ok(out)
    }

    /// Extract the value from received frame data
    pub fn unwrap<'a>(&self, data: &'a [u8]) -> Result<&'a [u8], SizeError> {
        match self {
            PropertySize::Static(n) if data.len() == *n as usize => Ok(data),
            PropertySize::Static(_) => Err(SizeError::Mismatch),
            PropertySize::Dynamic => {
                if data.len() < Self::DYNAMIC_PREFIX {
                    return Err(SizeError::Mismatch);
                }
                let (prefix, value) = data.split_at(Self::DYNAMIC_PREFIX);
                let len = u16::from_le_bytes([prefix[0], prefix[1]]) as usize;
                if len != value.len() {
                    return Err(SizeError::Mismatch);
                }
                Ok(value)
            }
        }
    }
}

/// Directions a property may travel on the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Access {
    /// Nodes report it, the gateway never writes it
    ReadOnly,
    /// The gateway writes it, nodes never report it
    WriteOnly,
    ReadWrite,
}

impl Access {
    /// Can be collected from the nodes
    pub const fn readable(self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    /// Can be pushed to the nodes
    pub const fn writable(self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }
}

/// Serialize a module's value into `buf`, returning its length
pub type GetFn<M> = fn(&M, &mut [u8]) -> Result<usize, HandlerError>;

/// Apply received bytes to a module
pub type SetFn<M> = fn(&mut M, &[u8]) -> Result<(), HandlerError>;

/// True when two modules hold the same value
pub type CompareFn<M> = fn(&M, &M) -> bool;

/// One entry of a [`PropertyTable`]
pub struct PropertyDef<M> {
    pub id: PropertyId,
    pub name: &'static str,
    pub access: Access,
    pub size: PropertySize,
    /// Value is delivered in several frames (e.g. firmware pages)
    pub multipart: bool,
    pub get: Option<GetFn<M>>,
    pub set: Option<SetFn<M>>,
    /// Absent means the property is never promoted to a broadcast
    pub compare: Option<CompareFn<M>>,
}

impl<M> Clone for PropertyDef<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for PropertyDef<M> {}

impl<M> core::fmt::Debug for PropertyDef<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PropertyDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("access", &self.access)
            .field("size", &self.size)
            .finish()
    }
}

impl<M> PropertyDef<M> {
    /// Definition without handlers
    pub const fn new(id: PropertyId, name: &'static str, access: Access, size: PropertySize) -> Self {
        Self {
            id,
            name,
            access,
            size,
            multipart: false,
            get: None,
            set: None,
            compare: None,
        }
    }

    pub const fn with_get(mut self, get: GetFn<M>) -> Self {
        self.get = Some(get);
        self
    }

    pub const fn with_set(mut self, set: SetFn<M>) -> Self {
        self.set = Some(set);
        self
    }

    pub const fn with_compare(mut self, compare: CompareFn<M>) -> Self {
        self.compare = Some(compare);
        self
    }

    pub const fn multipart(mut self) -> Self {
        self.multipart = true;
        self
    }

    /// Run the get handler and lay the value out for a frame
    pub fn serialize(&self, module: &M) -> Result<PropertyBuf, PropertyError> {
        let get = self.get.ok_or(PropertyError::NotSupported)?;
        let mut scratch = [0u8; PROPERTY_SIZE_MAX];
        let buf = &mut scratch[..self.size.max_value_len().min(PROPERTY_SIZE_MAX)];
        let len = get(module, buf)?;
        let value = buf.get(..len).ok_or(SizeError::TooLarge)?;
        Ok(self.size.wrap(value)?)
    }

    /// Check received frame data against the size and run the set handler
    pub fn deserialize(&self, module: &mut M, data: &[u8]) -> Result<(), PropertyError> {
        let set = self.set.ok_or(PropertyError::NotSupported)?;
        let value = self.size.unwrap(data)?;
        set(module, value)?;
        Ok(())
    }

    /// Compare the values of two modules, `None` if not comparable
    pub fn values_equal(&self, a: &M, b: &M) -> Option<bool> {
        self.compare.map(|compare| compare(a, b))
    }
}

/// Immutable registry of property definitions in ascending id order
pub struct PropertyTable<'a, M> {
    defs: &'a [PropertyDef<M>],
}

impl<M> Clone for PropertyTable<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for PropertyTable<'_, M> {}

impl<'a, M> PropertyTable<'a, M> {
    pub const fn new(defs: &'a [PropertyDef<M>]) -> Self {
        Self { defs }
    }

    /// Look up a definition by id
    pub fn get(&self, id: PropertyId) -> Option<&'a PropertyDef<M>> {
        self.defs.iter().find(|def| def.id == id)
    }

    /// Look up a definition by name
    pub fn by_name(&self, name: &str) -> Option<&'a PropertyDef<M>> {
        self.defs.iter().find(|def| def.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a PropertyDef<M>> + 'a {
        self.defs.iter()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

/// Set of property ids, one bit per id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PropertySet(u128);

impl PropertySet {
    pub const EMPTY: Self = Self(0);

    const fn bit(id: PropertyId) -> u128 {
        1u128 << (id.0 & 0x7F)
    }

    pub fn insert(&mut self, id: PropertyId) {
        self.0 |= Self::bit(id);
    }

    pub fn remove(&mut self, id: PropertyId) {
        self.0 &= !Self::bit(id);
    }

    pub const fn contains(&self, id: PropertyId) -> bool {
        self.0 & Self::bit(id) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Members in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = PropertyId> + '_ {
        (0..=0x7Fu8)
            .map(PropertyId)
            .filter(move |id| self.contains(*id))
    }
}

impl FromIterator<PropertyId> for PropertySet {
    fn from_iter<I: IntoIterator<Item = PropertyId>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for id in iter {
            set.insert(id);
        }
        set
    }
}
