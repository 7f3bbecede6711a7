//! Split-flap module property ABI
//!
//! Property identifiers, value types and their binary layouts for the
//! split-flap module. The same [`PROPERTIES`] table is used by the module
//! firmware and by the gateway's mirror of every module, so both ends always
//! agree on sizes and access rights.
//!
//! | id | name             | access | size            |
//! |----|------------------|--------|-----------------|
//! | 0  | firmware_version | read   | dynamic         |
//! | 1  | firmware_update  | write  | 130, multipart  |
//! | 2  | command          | write  | 1               |
//! | 3  | module_info      | read   | 1               |
//! | 4  | character_set    | rw     | dynamic         |
//! | 5  | character        | rw     | 1               |
//! | 6  | offset           | rw     | 1               |
//! | 7  | color            | rw     | 6               |
//! | 8  | motion           | rw     | 4               |
//! | 9  | minimum_rotation | rw     | 1               |
//! | 10 | ir_threshold     | rw     | 4               |

use heapless::{String, Vec};

use crate::property::{Access, HandlerError, PropertyDef, PropertyId, PropertySize, PropertyTable};

// Property IDs
pub const FIRMWARE_VERSION: PropertyId = PropertyId(0);
pub const FIRMWARE_UPDATE: PropertyId = PropertyId(1);
pub const COMMAND: PropertyId = PropertyId(2);
pub const MODULE_INFO: PropertyId = PropertyId(3);
pub const CHARACTER_SET: PropertyId = PropertyId(4);
pub const CHARACTER: PropertyId = PropertyId(5);
pub const OFFSET: PropertyId = PropertyId(6);
pub const COLOR: PropertyId = PropertyId(7);
pub const MOTION: PropertyId = PropertyId(8);
pub const MINIMUM_ROTATION: PropertyId = PropertyId(9);
pub const IR_THRESHOLD: PropertyId = PropertyId(10);

/// Bytes per firmware page in a firmware update frame
pub const FIRMWARE_PAGE_SIZE: usize = 128;

/// Longest firmware version string
pub const VERSION_LEN_MAX: usize = 32;

/// Bytes per character set symbol (one UTF-8 character, zero padded)
pub const SYMBOL_SIZE: usize = 4;

/// Most symbols a character set can hold in one frame
pub const SYMBOLS_MAX: usize = 63;

/// Firmware version string plus image CRC
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwareVersion {
    pub version: String<VERSION_LEN_MAX>,
    pub crc: u32,
}

/// One page of a firmware image
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwarePage {
    pub index: u16,
    pub data: [u8; FIRMWARE_PAGE_SIZE],
}

/// One-shot module commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    #[default]
    None = 0,
    Reboot = 1,
}

impl Command {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Command::None),
            1 => Some(Command::Reboot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModuleType {
    #[default]
    Undefined = 0,
    Splitflap = 1,
}

/// Static module description
///
/// Packed as bit 0 = last module of a column, bits 1-4 = module type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModuleInfo {
    pub column_end: bool,
    pub module_type: ModuleType,
}

impl ModuleInfo {
    pub const fn to_byte(self) -> u8 {
        (self.column_end as u8) | ((self.module_type as u8) << 1)
    }

    pub const fn from_byte(byte: u8) -> Self {
        Self {
            column_end: byte & 0x01 != 0,
            module_type: match (byte >> 1) & 0x0F {
                1 => ModuleType::Splitflap,
                _ => ModuleType::Undefined,
            },
        }
    }
}

/// Symbols printed on the flaps, in flap order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharacterSet {
    symbols: Vec<[u8; SYMBOL_SIZE], SYMBOLS_MAX>,
}

impl CharacterSet {
    pub const fn new() -> Self {
        Self { symbols: Vec::new() }
    }

    /// One symbol per character of `text`
    pub fn from_chars(text: &str) -> Result<Self, HandlerError> {
        let mut set = Self::new();
        for ch in text.chars() {
            let mut symbol = [0u8; SYMBOL_SIZE];
            ch.encode_utf8(&mut symbol);
            set.symbols.push(symbol).map_err(|_| HandlerError)?;
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Symbol on flap `index` without its zero padding
    pub fn symbol(&self, index: usize) -> Option<&str> {
        let raw = self.symbols.get(index)?;
        let len = raw.iter().position(|&b| b == 0).unwrap_or(SYMBOL_SIZE);
        core::str::from_utf8(&raw[..len]).ok()
    }

    fn to_bytes(&self, buf: &mut [u8]) -> Result<usize, HandlerError> {
        let len = self.symbols.len() * SYMBOL_SIZE;
        let out = buf.get_mut(..len).ok_or(HandlerError)?;
        for (chunk, symbol) in out.chunks_exact_mut(SYMBOL_SIZE).zip(&self.symbols) {
            chunk.copy_from_slice(symbol);
        }
        Ok(len)
    }

    fn from_bytes(data: &[u8]) -> Result<Self, HandlerError> {
        if data.len() % SYMBOL_SIZE != 0 {
            return Err(HandlerError);
        }
        let mut set = Self::new();
        for chunk in data.chunks_exact(SYMBOL_SIZE) {
            let mut symbol = [0u8; SYMBOL_SIZE];
            symbol.copy_from_slice(chunk);
            set.symbols.push(symbol).map_err(|_| HandlerError)?;
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Flap foreground and background color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Color {
    pub foreground: Rgb,
    pub background: Rgb,
}

/// Motor speed ramp, in flaps per second and flaps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Motion {
    pub speed_min: u8,
    pub speed_max: u8,
    pub distance_ramp_start: u8,
    pub distance_ramp_stop: u8,
}

/// Encoder IR sensor hysteresis thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IrThreshold {
    pub lower: i16,
    pub upper: i16,
}

/// All properties of one split-flap module
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SplitflapModule {
    pub firmware_version: FirmwareVersion,
    pub firmware_page: Option<FirmwarePage>,
    pub command: Command,
    pub module_info: ModuleInfo,
    pub character_set: CharacterSet,
    pub character: u8,
    pub offset: u8,
    pub color: Color,
    pub motion: Motion,
    pub minimum_rotation: u8,
    pub ir_threshold: IrThreshold,
}

impl SplitflapModule {
    pub const fn new() -> Self {
        Self {
            firmware_version: FirmwareVersion {
                version: String::new(),
                crc: 0,
            },
            firmware_page: None,
            command: Command::None,
            module_info: ModuleInfo {
                column_end: false,
                module_type: ModuleType::Undefined,
            },
            character_set: CharacterSet::new(),
            character: 0,
            offset: 0,
            color: Color {
                foreground: Rgb { r: 0, g: 0, b: 0 },
                background: Rgb { r: 0, g: 0, b: 0 },
            },
            motion: Motion {
                speed_min: 0,
                speed_max: 0,
                distance_ramp_start: 0,
                distance_ramp_stop: 0,
            },
            minimum_rotation: 0,
            ir_threshold: IrThreshold { lower: 0, upper: 0 },
        }
    }

    /// Take the pending command, leaving [`Command::None`]
    pub fn take_command(&mut self) -> Command {
        core::mem::take(&mut self.command)
    }
}

fn put(buf: &mut [u8], bytes: &[u8]) -> Result<usize, HandlerError> {
    buf.get_mut(..bytes.len())
        .ok_or(HandlerError)?
        .copy_from_slice(bytes);
    Ok(bytes.len())
}

fn exact<const N: usize>(data: &[u8]) -> Result<[u8; N], HandlerError> {
    data.try_into().map_err(|_| HandlerError)
}

fn get_firmware_version(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    let version = m.firmware_version.version.as_bytes();
    let len = put(buf, version)?;
    let crc = buf.get_mut(len..).ok_or(HandlerError)?;
    Ok(len + put(crc, &m.firmware_version.crc.to_le_bytes())?)
}

fn set_firmware_version(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    let split = data.len().checked_sub(4).ok_or(HandlerError)?;
    let (version, crc) = data.split_at(split);
    let version = core::str::from_utf8(version).map_err(|_| HandlerError)?;
    let mut text = String::new();
    text.push_str(version).map_err(|_| HandlerError)?;
    m.firmware_version = FirmwareVersion {
        version: text,
        crc: u32::from_le_bytes(exact(crc)?),
    };
    Ok(())
}

fn get_firmware_update(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    let page = m.firmware_page.as_ref().ok_or(HandlerError)?;
    let len = put(buf, &page.index.to_be_bytes())?;
    let data = buf.get_mut(len..).ok_or(HandlerError)?;
    Ok(len + put(data, &page.data)?)
}

fn set_firmware_update(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    let bytes: [u8; 2 + FIRMWARE_PAGE_SIZE] = exact(data)?;
    let mut page = [0u8; FIRMWARE_PAGE_SIZE];
    page.copy_from_slice(&bytes[2..]);
    m.firmware_page = Some(FirmwarePage {
        index: u16::from_be_bytes([bytes[0], bytes[1]]),
        data: page,
    });
    Ok(())
}

fn same_firmware_page(a: &SplitflapModule, b: &SplitflapModule) -> bool {
    a.firmware_page == b.firmware_page
}

fn get_command(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    put(buf, &[m.command as u8])
}

fn set_command(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    let [raw] = exact::<1>(data)?;
    m.command = Command::from_u8(raw).ok_or(HandlerError)?;
    Ok(())
}

fn same_command(a: &SplitflapModule, b: &SplitflapModule) -> bool {
    a.command == b.command
}

fn get_module_info(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    put(buf, &[m.module_info.to_byte()])
}

fn set_module_info(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    let [raw] = exact::<1>(data)?;
    m.module_info = ModuleInfo::from_byte(raw);
    Ok(())
}

fn get_character_set(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    m.character_set.to_bytes(buf)
}

fn set_character_set(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    m.character_set = CharacterSet::from_bytes(data)?;
    Ok(())
}

fn same_character_set(a: &SplitflapModule, b: &SplitflapModule) -> bool {
    a.character_set == b.character_set
}

fn get_character(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    put(buf, &[m.character])
}

fn set_character(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    let [raw] = exact::<1>(data)?;
    m.character = raw;
    Ok(())
}

fn same_character(a: &SplitflapModule, b: &SplitflapModule) -> bool {
    a.character == b.character
}

fn get_offset(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    put(buf, &[m.offset])
}

fn set_offset(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    let [raw] = exact::<1>(data)?;
    m.offset = raw;
    Ok(())
}

fn same_offset(a: &SplitflapModule, b: &SplitflapModule) -> bool {
    a.offset == b.offset
}

fn get_color(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    let Color {
        foreground: fg,
        background: bg,
    } = m.color;
    put(buf, &[fg.r, fg.g, fg.b, bg.r, bg.g, bg.b])
}

fn set_color(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    let [fr, fg, fb, br, bg, bb] = exact::<6>(data)?;
    m.color = Color {
        foreground: Rgb { r: fr, g: fg, b: fb },
        background: Rgb { r: br, g: bg, b: bb },
    };
    Ok(())
}

fn same_color(a: &SplitflapModule, b: &SplitflapModule) -> bool {
    a.color == b.color
}

fn get_motion(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    let motion = m.motion;
    put(
        buf,
        &[
            motion.speed_min,
            motion.speed_max,
            motion.distance_ramp_start,
            motion.distance_ramp_stop,
        ],
    )
}

fn set_motion(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    let [speed_min, speed_max, distance_ramp_start, distance_ramp_stop] = exact::<4>(data)?;
    m.motion = Motion {
        speed_min,
        speed_max,
        distance_ramp_start,
        distance_ramp_stop,
    };
    Ok(())
}

fn same_motion(a: &SplitflapModule, b: &SplitflapModule) -> bool {
    a.motion == b.motion
}

fn get_minimum_rotation(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    put(buf, &[m.minimum_rotation])
}

fn set_minimum_rotation(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    let [raw] = exact::<1>(data)?;
    m.minimum_rotation = raw;
    Ok(())
}

fn same_minimum_rotation(a: &SplitflapModule, b: &SplitflapModule) -> bool {
    a.minimum_rotation == b.minimum_rotation
}

fn get_ir_threshold(m: &SplitflapModule, buf: &mut [u8]) -> Result<usize, HandlerError> {
    let [l0, l1] = m.ir_threshold.lower.to_le_bytes();
    let [u0, u1] = m.ir_threshold.upper.to_le_bytes();
    put(buf, &[l0, l1, u0, u1])
}

fn set_ir_threshold(m: &mut SplitflapModule, data: &[u8]) -> Result<(), HandlerError> {
    let [l0, l1, u0, u1] = exact::<4>(data)?;
    m.ir_threshold = IrThreshold {
        lower: i16::from_le_bytes([l0, l1]),
        upper: i16::from_le_bytes([u0, u1]),
    };
    Ok(())
}

fn same_ir_threshold(a: &SplitflapModule, b: &SplitflapModule) -> bool {
    a.ir_threshold == b.ir_threshold
}

/// Split-flap property definitions in ascending id order
pub static PROPERTIES: [PropertyDef<SplitflapModule>; 11] = [
    PropertyDef::new(
        FIRMWARE_VERSION,
        "firmware_version",
        Access::ReadOnly,
        PropertySize::Dynamic,
    )
    .with_get(get_firmware_version)
    .with_set(set_firmware_version),
    PropertyDef::new(
        FIRMWARE_UPDATE,
        "firmware_update",
        Access::WriteOnly,
        PropertySize::Static(2 + FIRMWARE_PAGE_SIZE as u16),
    )
    .multipart()
    .with_get(get_firmware_update)
    .with_set(set_firmware_update)
    .with_compare(same_firmware_page),
    PropertyDef::new(COMMAND, "command", Access::WriteOnly, PropertySize::Static(1))
        .with_get(get_command)
        .with_set(set_command)
        .with_compare(same_command),
    PropertyDef::new(
        MODULE_INFO,
        "module_info",
        Access::ReadOnly,
        PropertySize::Static(1),
    )
    .with_get(get_module_info)
    .with_set(set_module_info),
    PropertyDef::new(
        CHARACTER_SET,
        "character_set",
        Access::ReadWrite,
        PropertySize::Dynamic,
    )
    .with_get(get_character_set)
    .with_set(set_character_set)
    .with_compare(same_character_set),
    PropertyDef::new(CHARACTER, "character", Access::ReadWrite, PropertySize::Static(1))
        .with_get(get_character)
        .with_set(set_character)
        .with_compare(same_character),
    PropertyDef::new(OFFSET, "offset", Access::ReadWrite, PropertySize::Static(1))
        .with_get(get_offset)
        .with_set(set_offset)
        .with_compare(same_offset),
    PropertyDef::new(COLOR, "color", Access::ReadWrite, PropertySize::Static(6))
        .with_get(get_color)
        .with_set(set_color)
        .with_compare(same_color),
    PropertyDef::new(MOTION, "motion", Access::ReadWrite, PropertySize::Static(4))
        .with_get(get_motion)
        .with_set(set_motion)
        .with_compare(same_motion),
    PropertyDef::new(
        MINIMUM_ROTATION,
        "minimum_rotation",
        Access::ReadWrite,
        PropertySize::Static(1),
    )
    .with_get(get_minimum_rotation)
    .with_set(set_minimum_rotation)
    .with_compare(same_minimum_rotation),
    PropertyDef::new(
        IR_THRESHOLD,
        "ir_threshold",
        Access::ReadWrite,
        PropertySize::Static(4),
    )
    .with_get(get_ir_threshold)
    .with_set(set_ir_threshold)
    .with_compare(same_ir_threshold),
];

/// Table over [`PROPERTIES`]
pub fn table() -> PropertyTable<'static, SplitflapModule> {
    PropertyTable::new(&PROPERTIES)
}
