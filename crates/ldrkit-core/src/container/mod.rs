//! USB loader container codec.
//!
//! A container starts with a fixed 196-byte header: the magic `0x00020000`,
//! 32 reserved bytes and ten 16-byte block descriptors. Block payloads
//! follow the header back to back.
//!
//! ## Algorithm Overview
//!
//! Decoding walks the descriptor slots from slot 0 and stops for good at
//! the first slot with a zero size or an offset inside the header. A slot
//! that runs past the end of the input also stops the walk, with a
//! [`Warning`] instead of an error.
//!
//! Encoding places payloads right after the header in list order and
//! rewrites every descriptor's offset from the write cursor.

pub mod manifest;

use crate::error::{Error, Result, Warning};
use bytes::{Buf, BufMut};
use std::fmt;
use tracing::{debug, trace, warn};

pub use manifest::{block_file_name, Manifest, ManifestBlock, HEADER_FILE, MANIFEST_FILE};

/// Magic value of the first header word
pub const MAGIC: u32 = 0x0002_0000;

/// Number of descriptor slots in the header
pub const MAX_BLOCKS: usize = 10;

/// Size of the reserved area after the magic
pub const RESERVED_LEN: usize = 32;

/// Size of one encoded descriptor
pub const DESCRIPTOR_SIZE: usize = 16;

/// Size of the fixed header; the first payload starts here
pub const HEADER_SIZE: usize = 4 + RESERVED_LEN + MAX_BLOCKS * DESCRIPTOR_SIZE;

/// How the boot ROM starts a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Jump to the load address directly
    Direct,
    /// Start through a restart of the companion core
    CompanionRestart,
    /// Any other value, kept as-is
    Other(u32),
}

impl From<u32> for BootMode {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Direct,
            2 => Self::CompanionRestart,
            other => Self::Other(other),
        }
    }
}

impl From<BootMode> for u32 {
    fn from(mode: BootMode) -> Self {
        match mode {
            BootMode::Direct => 1,
            BootMode::CompanionRestart => 2,
            BootMode::Other(value) => value,
        }
    }
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("1 (direct start)"),
            Self::CompanionRestart => f.write_str("2 (companion core restart)"),
            Self::Other(value) => write!(f, "{value}"),
        }
    }
}

/// One header slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    /// Boot mode
    pub mode: BootMode,
    /// Payload size in bytes
    pub size: u32,
    /// Load address in memory
    pub address: u32,
    /// Offset of the payload from the start of the file
    pub offset: u32,
}

impl Default for BlockDescriptor {
    fn default() -> Self {
        Self {
            mode: BootMode::Other(0),
            size: 0,
            address: 0,
            offset: 0,
        }
    }
}

impl BlockDescriptor {
    fn read_from(buf: &mut impl Buf) -> Self {
        Self {
            mode: BootMode::from(buf.get_u32_le()),
            size: buf.get_u32_le(),
            address: buf.get_u32_le(),
            offset: buf.get_u32_le(),
        }
    }

    fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.mode.into());
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.address);
        buf.put_u32_le(self.offset);
    }

    /// Returns true if decoding should look at this slot at all
    fn is_populated(&self) -> bool {
        self.size != 0 && self.offset as usize >= HEADER_SIZE
    }
}

/// The fixed container header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    /// First header word; [`MAGIC`] for valid containers
    pub magic: u32,
    /// Reserved bytes, preserved verbatim
    pub reserved: [u8; RESERVED_LEN],
    /// All descriptor slots, populated or not
    pub slots: [BlockDescriptor; MAX_BLOCKS],
}

impl Default for ContainerHeader {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            reserved: [0; RESERVED_LEN],
            slots: [BlockDescriptor::default(); MAX_BLOCKS],
        }
    }
}

impl ContainerHeader {
    /// Decodes a header from the start of `data`
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() >= 4 {
            let magic = (&data[..4]).get_u32_le();
            if magic != MAGIC {
                return Err(bad_magic(magic));
            }
        }
        if data.len() < HEADER_SIZE {
            return Err(Error::Truncated {
                what: "container header",
                needed: HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut buf = &data[..HEADER_SIZE];
        let mut header = Self {
            magic: buf.get_u32_le(),
            ..Self::default()
        };
        buf.copy_to_slice(&mut header.reserved);
        for slot in header.slots.iter_mut() {
            *slot = BlockDescriptor::read_from(&mut buf);
        }
        Ok(header)
    }

    /// Encodes the header into exactly [`HEADER_SIZE`] bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.put_u32_le(self.magic);
        out.put_slice(&self.reserved);
        for slot in &self.slots {
            slot.write_to(&mut out);
        }
        out
    }
}

fn bad_magic(found: u32) -> Error {
    Error::BadMagic {
        what: "container",
        expected: format!("{MAGIC:#010x}"),
        found: format!("{found:#010x}"),
    }
}

/// Conventional name of the block in `slot`
pub fn block_name(slot: usize) -> &'static str {
    match slot {
        0 => "raminit",
        1 => "usbldr",
        _ => "unknown",
    }
}

/// A block extracted from a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block<'a> {
    /// Descriptor slot it came from
    pub slot: usize,
    /// Its descriptor, as stored
    pub descriptor: BlockDescriptor,
    /// Payload bytes, borrowed from the input
    pub payload: &'a [u8],
}

impl Block<'_> {
    /// Conventional name derived from the slot
    pub fn name(&self) -> &'static str {
        block_name(self.slot)
    }
}

/// Result of [`decode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedContainer<'a> {
    /// The raw header
    pub header: ContainerHeader,
    /// Blocks in slot order
    pub blocks: Vec<Block<'a>>,
    /// Non-fatal problems met while decoding
    pub warnings: Vec<Warning>,
}

/// Splits a container into its header and blocks
pub fn decode(data: &[u8]) -> Result<DecodedContainer<'_>> {
    let header = ContainerHeader::decode(data)?;
    let mut blocks = Vec::new();
    let mut warnings = Vec::new();

    for (slot, descriptor) in header.slots.iter().enumerate() {
        if !descriptor.is_populated() {
            trace!("slot {} empty, stopping", slot);
            break;
        }

        let start = descriptor.offset as usize;
        let end = start as u64 + u64::from(descriptor.size);
        if end > data.len() as u64 {
            let warning = Warning::BlockTruncated {
                slot,
                offset: descriptor.offset,
                size: descriptor.size,
                buffer_len: data.len(),
            };
            warn!("{}", warning);
            warnings.push(warning);
            break;
        }

        debug!(
            "block {} ({}): {:#x} bytes at {:#x}",
            slot,
            block_name(slot),
            descriptor.size,
            descriptor.offset
        );
        blocks.push(Block {
            slot,
            descriptor: *descriptor,
            payload: &data[start..end as usize],
        });
    }

    Ok(DecodedContainer {
        header,
        blocks,
        warnings,
    })
}

/// A block to be written by [`encode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    /// Boot mode
    pub mode: BootMode,
    /// Load address
    pub address: u32,
    /// Size the caller expects; zero drops the block
    pub declared_size: u32,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl BlockSpec {
    /// Creates a spec whose declared size matches the payload
    pub fn new(mode: BootMode, address: u32, payload: Vec<u8>) -> Result<Self> {
        let declared_size = u32::try_from(payload.len()).map_err(|_| Error::FieldOverflow {
            what: "block size",
            value: payload.len() as u64,
        })?;
        Ok(Self {
            mode,
            address,
            declared_size,
            payload,
        })
    }
}

/// Result of [`encode`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedContainer {
    /// The complete container image
    pub data: Vec<u8>,
    /// Descriptors as written, in slot order
    pub descriptors: Vec<BlockDescriptor>,
    /// Non-fatal problems met while encoding
    pub warnings: Vec<Warning>,
}

/// Builds a container from a header template and an ordered list of blocks.
///
/// The template's magic is replaced with [`MAGIC`] and its slots are
/// cleared; only its reserved bytes survive. Blocks with a declared size
/// of zero, or with an empty payload, are dropped; the rest occupy
/// consecutive slots from slot 0.
pub fn encode(template: &ContainerHeader, blocks: &[BlockSpec]) -> Result<EncodedContainer> {
    let mut header = ContainerHeader {
        magic: MAGIC,
        reserved: template.reserved,
        slots: [BlockDescriptor::default(); MAX_BLOCKS],
    };
    let mut warnings = Vec::new();
    let mut descriptors = Vec::new();
    let mut cursor = HEADER_SIZE as u64;

    let emitted = blocks.iter().enumerate().filter(|(_, b)| b.declared_size != 0);
    for (index, block) in emitted {
        let actual = u32::try_from(block.payload.len()).map_err(|_| Error::FieldOverflow {
            what: "block size",
            value: block.payload.len() as u64,
        })?;
        if actual != block.declared_size {
            let warning = Warning::SizeMismatch {
                index,
                declared: block.declared_size,
                actual,
            };
            warn!("{}", warning);
            warnings.push(warning);
        }
        // An empty slot would end the block list for any reader
        if actual == 0 {
            debug!("block {} has no payload, not emitted", index);
            continue;
        }
        if descriptors.len() == MAX_BLOCKS {
            return Err(Error::CapacityExceeded {
                what: "blocks",
                max: MAX_BLOCKS,
            });
        }

        let offset = u32::try_from(cursor).map_err(|_| Error::FieldOverflow {
            what: "block offset",
            value: cursor,
        })?;
        let descriptor = BlockDescriptor {
            mode: block.mode,
            size: actual,
            address: block.address,
            offset,
        };
        header.slots[descriptors.len()] = descriptor;
        descriptors.push(descriptor);
        cursor += u64::from(actual);
    }

    let total = usize::try_from(cursor).map_err(|_| Error::FieldOverflow {
        what: "container size",
        value: cursor,
    })?;
    let mut data = Vec::with_capacity(total);
    data.extend_from_slice(&header.encode());
    for block in blocks.iter().filter(|b| b.declared_size != 0) {
        // Empty payloads add nothing, matching the skipped descriptors
        data.extend_from_slice(&block.payload);
    }

    debug!(
        "encoded container: {} block(s), {:#x} bytes",
        descriptors.len(),
        data.len()
    );
    Ok(EncodedContainer {
        data,
        descriptors,
        warnings,
    })
}
