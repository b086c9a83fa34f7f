//! Metadata written next to unpacked container blocks.
//!
//! ```text
//! # USB Loader Metadata
//! # Original file: usbloader.bin
//! # File size: 123456 bytes
//!
//! [Block0]
//! name=raminit
//! lmode=1
//! address=0x00001000
//! size=0x00000800
//! offset=0x000000c4
//! file=block0_raminit.bin
//! ```
//!
//! Only `lmode`, `address`, `size` and `file` matter when rebuilding;
//! offsets are always recomputed.

use super::{block_name, BlockSpec, BootMode, DecodedContainer, MAX_BLOCKS};
use crate::error::{Error, Result};
use crate::kv::{self, Line};
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use std::io::BufRead;
use std::path::{Component, Path, PathBuf};

/// File name of the metadata inside an unpack directory
pub const MANIFEST_FILE: &str = "metadata.txt";

/// File name of the saved raw header inside an unpack directory
pub const HEADER_FILE: &str = "header.bin";

/// One `[BlockN]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestBlock {
    /// Slot number `N`
    pub slot: usize,
    /// Informational block name
    pub name: String,
    /// Boot mode
    pub mode: BootMode,
    /// Load address
    pub address: u32,
    /// Declared payload size
    pub size: u32,
    /// Offset in the original file (informational)
    pub offset: u32,
    /// Payload file, relative to the unpack directory
    pub file: String,
}

impl ManifestBlock {
    fn empty(slot: usize) -> Self {
        Self {
            slot,
            name: String::new(),
            mode: BootMode::Other(0),
            address: 0,
            size: 0,
            offset: 0,
            file: String::new(),
        }
    }
}

/// Parsed or generated metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Name of the file the blocks came from
    pub source: Option<String>,
    /// Size of that file
    pub source_size: Option<u64>,
    /// Blocks in slot order
    pub blocks: Vec<ManifestBlock>,
}

impl Manifest {
    /// Describes the blocks of a decoded container
    pub fn from_container(source: &str, source_size: u64, container: &DecodedContainer<'_>) -> Self {
        let blocks = container
            .blocks
            .iter()
            .map(|b| ManifestBlock {
                slot: b.slot,
                name: b.name().to_string(),
                mode: b.descriptor.mode,
                address: b.descriptor.address,
                size: b.descriptor.size,
                offset: b.descriptor.offset,
                file: block_file_name(b.slot),
            })
            .collect();

        Self {
            source: Some(source.to_string()),
            source_size: Some(source_size),
            blocks,
        }
    }

    /// Renders the metadata text
    pub fn render(&self) -> String {
        let mut output = String::new();
        self.write_to(&mut output).expect("String write cannot fail");
        output
    }

    /// Writes the metadata text to `w`
    pub fn write_to(&self, w: &mut impl FmtWrite) -> std::fmt::Result {
        writeln!(w, "# USB Loader Metadata")?;
        if let Some(source) = &self.source {
            writeln!(w, "# Original file: {source}")?;
        }
        if let Some(size) = self.source_size {
            writeln!(w, "# File size: {size} bytes")?;
        }
        writeln!(w)?;

        for b in &self.blocks {
            writeln!(w, "[Block{}]", b.slot)?;
            writeln!(w, "name={}", b.name)?;
            writeln!(w, "lmode={}", u32::from(b.mode))?;
            writeln!(w, "address={:#010x}", b.address)?;
            writeln!(w, "size={:#010x}", b.size)?;
            writeln!(w, "offset={:#010x}", b.offset)?;
            writeln!(w, "file={}", b.file)?;
            writeln!(w)?;
        }
        Ok(())
    }

    /// Parses metadata text.
    ///
    /// Sections may appear in any order; a slot number that never appears
    /// below the highest one becomes an empty block.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut sections: BTreeMap<usize, (usize, ManifestBlock)> = BTreeMap::new();
        let mut current: Option<usize> = None;

        kv::for_each_line(reader, |number, line| {
            match line {
                Line::Section(name) => {
                    let slot = parse_section(number, name)?;
                    sections
                        .entry(slot)
                        .or_insert_with(|| (number, ManifestBlock::empty(slot)));
                    current = Some(slot);
                }
                Line::Pair { key, value } => {
                    let slot = current.ok_or_else(|| {
                        Error::invalid_line(number, format!("'{key}' appears before any [BlockN]"))
                    })?;
                    if let Some((_, block)) = sections.get_mut(&slot) {
                        apply_pair(block, number, key, value)?;
                    }
                }
            }
            Ok(())
        })?;

        let count = sections.keys().next_back().map_or(0, |last| last + 1);
        let mut blocks = Vec::with_capacity(count);
        for slot in 0..count {
            match sections.remove(&slot) {
                Some((line, block)) => {
                    if block.size != 0 && block.file.is_empty() {
                        return Err(Error::invalid_line(
                            line,
                            format!("[Block{slot}] has a size but no file"),
                        ));
                    }
                    blocks.push(block);
                }
                None => blocks.push(ManifestBlock::empty(slot)),
            }
        }

        Ok(Self {
            source: None,
            source_size: None,
            blocks,
        })
    }

    /// Resolves a block's payload file inside `dir`, refusing paths that leave it
    pub fn block_path(dir: &Path, block: &ManifestBlock) -> Result<PathBuf> {
        let relative = Path::new(&block.file);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || block.file.is_empty() {
            return Err(Error::path_traversal(relative));
        }
        Ok(dir.join(relative))
    }

    /// Turns the blocks into encoder input, loading each non-empty payload with `load`
    pub fn to_block_specs<F>(&self, mut load: F) -> Result<Vec<BlockSpec>>
    where
        F: FnMut(&ManifestBlock) -> Result<Vec<u8>>,
    {
        self.blocks
            .iter()
            .map(|b| {
                let payload = if b.size == 0 { Vec::new() } else { load(b)? };
                Ok(BlockSpec {
                    mode: b.mode,
                    address: b.address,
                    declared_size: b.size,
                    payload,
                })
            })
            .collect()
    }
}

fn parse_section(number: usize, name: &str) -> Result<usize> {
    let slot = name
        .strip_prefix("Block")
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| Error::invalid_line(number, format!("unknown section '[{name}]'")))?;
    if slot >= MAX_BLOCKS {
        return Err(Error::invalid_line(
            number,
            format!("block number {slot} out of range (0..{MAX_BLOCKS})"),
        ));
    }
    Ok(slot)
}

fn apply_pair(block: &mut ManifestBlock, number: usize, key: &str, value: &str) -> Result<()> {
    match key {
        "name" => block.name = value.to_string(),
        "file" => block.file = value.to_string(),
        "lmode" => block.mode = BootMode::from(kv::parse_u32(number, key, value)?),
        "address" => block.address = kv::parse_u32(number, key, value)?,
        "size" => block.size = kv::parse_u32(number, key, value)?,
        "offset" => block.offset = kv::parse_u32(number, key, value)?,
        _ => return Err(Error::unknown_key(number, key)),
    }
    Ok(())
}

/// Name the unpacker gives the payload file of `slot`
pub fn block_file_name(slot: usize) -> String {
    format!("block{}_{}.bin", slot, block_name(slot))
}
