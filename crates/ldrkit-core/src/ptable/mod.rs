//! Partition table codec.
//!
//! Balong loaders carry a fixed 2048-byte partition table that starts with
//! the magic `pTableHead`. This module locates that table in a larger
//! image, decodes it into a [`PartitionTable`], and re-encodes it either to
//! the exact binary layout or to an editable text form.
//!
//! ## Binary layout (little-endian)
//!
//! | Offset | Size      | Field                   |
//! |--------|-----------|-------------------------|
//! | 0      | 16        | head magic              |
//! | 16     | 16        | version (text)          |
//! | 32     | 16        | product (text)          |
//! | 48     | 41 × 48   | entries                 |
//! | 2016   | 32        | tail (opaque)           |
//!
//! Each entry is a 16-byte name followed by `start`, `lsize`, `length`,
//! `loadaddr`, `entry`, `type`, `nproperty` and `count` as 32-bit words.
//!
//! The entry list ends at the first entry with an empty name or the name
//! `"T"`; the `"T"` entry itself belongs to the list. Slots after the end
//! are ignored when decoding and zero-filled when encoding.

mod binary;
mod text;

use crate::error::{Error, Result};
use crate::signature::find_subsequence;
use std::fmt;
use std::io::{self, Read};
use tracing::trace;

pub use binary::{decode_binary, encode_binary};
pub use text::{decode_text, encode_text, write_text};

/// Magic at the start of every partition table
pub const HEAD_MAGIC: [u8; 16] = *b"pTableHead\0\0\0\0\0\0";

/// Number of entry slots in a table
pub const MAX_PARTITIONS: usize = 41;

/// Width of the name field, including its terminating NUL
pub const NAME_LEN: usize = 16;

/// Size of one encoded entry
pub const ENTRY_SIZE: usize = NAME_LEN + 8 * 4;

/// Size of the opaque trailer
pub const TAIL_LEN: usize = 32;

/// Size of an encoded table
pub const TABLE_SIZE: usize = 3 * 16 + MAX_PARTITIONS * ENTRY_SIZE + TAIL_LEN;

/// Name of the entry that closes the list
pub const END_MARKER: &str = "T";

/// One partition description
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionEntry {
    /// NUL-padded name
    pub name: [u8; NAME_LEN],
    /// Start offset in flash
    pub start: u32,
    /// Size of the loadable image
    pub lsize: u32,
    /// Partition length
    pub length: u32,
    /// RAM load address
    pub loadaddr: u32,
    /// Entry point
    pub entry: u32,
    /// `type` field
    pub kind: u32,
    /// Partition flags
    pub nproperty: u32,
    /// Usage counter
    pub count: u32,
}

impl PartitionEntry {
    /// Creates an all-zero entry with the given name
    pub fn named(name: &str) -> Result<Self> {
        let mut entry = Self::default();
        entry.set_name(name)?;
        Ok(entry)
    }

    /// Returns the name, up to the first NUL.
    ///
    /// A binary entry may use all 16 bytes with no NUL; the text form then
    /// carries only the first 15.
    pub fn name(&self) -> String {
        text_field(&self.name)
    }

    /// Sets the name; at most 15 bytes so that a NUL always follows
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        if name.len() >= NAME_LEN {
            return Err(Error::TooLong {
                value: name.to_string(),
                max: NAME_LEN - 1,
            });
        }
        self.name = [0; NAME_LEN];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }

    /// Returns true if this entry ends the list
    pub fn is_terminator(&self) -> bool {
        self.name[0] == 0 || self.is_end_marker()
    }

    fn is_end_marker(&self) -> bool {
        self.name() == END_MARKER
    }
}

/// A decoded partition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    /// Head magic; valid tables carry [`HEAD_MAGIC`]
    pub head: [u8; 16],
    /// NUL/space padded version text
    pub version: [u8; 16],
    /// NUL/space padded product text
    pub product: [u8; 16],
    entries: Vec<PartitionEntry>,
    /// Opaque trailer
    pub tail: [u8; TAIL_LEN],
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self {
            head: HEAD_MAGIC,
            version: [0; 16],
            product: [0; 16],
            entries: Vec::new(),
            tail: [0; TAIL_LEN],
        }
    }
}

impl PartitionTable {
    /// Creates an empty table carrying the head magic
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the head equals [`HEAD_MAGIC`]
    pub fn has_valid_head(&self) -> bool {
        self.head == HEAD_MAGIC
    }

    /// Returns an error unless the head equals [`HEAD_MAGIC`]
    pub fn validate_head(&self) -> Result<()> {
        if self.has_valid_head() {
            return Ok(());
        }
        Err(Error::BadMagic {
            what: "partition table",
            expected: text_field(&HEAD_MAGIC),
            found: String::from_utf8_lossy(&self.head).escape_debug().to_string(),
        })
    }

    /// All stored entries
    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    /// Mutable access to the stored entries; the count cannot change
    pub fn entries_mut(&mut self) -> &mut [PartitionEntry] {
        &mut self.entries
    }

    /// Entries up to and including the `"T"` marker, stopping before an empty name
    pub fn logical_entries(&self) -> &[PartitionEntry] {
        let end = self
            .entries
            .iter()
            .position(PartitionEntry::is_terminator)
            .map(|i| if self.entries[i].is_end_marker() { i + 1 } else { i })
            .unwrap_or(self.entries.len());
        &self.entries[..end]
    }

    /// Appends an entry; fails once all 41 slots are used
    pub fn push_entry(&mut self, entry: PartitionEntry) -> Result<()> {
        if self.entries.len() >= MAX_PARTITIONS {
            return Err(Error::CapacityExceeded {
                what: "partitions",
                max: MAX_PARTITIONS,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Version text with padding removed
    pub fn version(&self) -> String {
        text_field(&self.version)
    }

    /// Product text with padding removed
    pub fn product(&self) -> String {
        text_field(&self.product)
    }

    /// Sets the version text, truncated to 16 bytes
    pub fn set_version(&mut self, version: &str) {
        fill_text_field(&mut self.version, version);
    }

    /// Sets the product text, truncated to 16 bytes
    pub fn set_product(&mut self, product: &str) {
        fill_text_field(&mut self.product, product);
    }

    /// Looks up a logical entry by name
    pub fn find(&self, name: &str) -> Option<&PartitionEntry> {
        self.logical_entries().iter().find(|e| e.name() == name)
    }

    /// Returns a displayable partition map
    pub fn map(&self) -> PartitionMap<'_> {
        PartitionMap { table: self }
    }
}

/// Human-readable rendering of a table's logical entries
pub struct PartitionMap<'a> {
    table: &'a PartitionTable,
}

impl fmt::Display for PartitionMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Version: {}", self.table.version())?;
        writeln!(f, "Product: {}", self.table.product())?;
        writeln!(f)?;
        writeln!(
            f,
            " ## Start    Length   Lsize    Loadaddr Entry    Type     Flags    Count    Name"
        )?;
        writeln!(f, "{}", "-".repeat(95))?;
        for (i, e) in self.table.logical_entries().iter().enumerate() {
            writeln!(
                f,
                " {:02} {:08x} {:08x} {:08x} {:08x} {:08x} {:08x} {:08x} {:08x} {}",
                i,
                e.start,
                e.length,
                e.lsize,
                e.loadaddr,
                e.entry,
                e.kind,
                e.nproperty,
                e.count,
                e.name()
            )?;
        }
        Ok(())
    }
}

/// Returns the offset of the first head magic in `data`
pub fn locate(data: &[u8]) -> Option<usize> {
    let found = find_subsequence(data, &HEAD_MAGIC);
    if let Some(offset) = found {
        trace!("partition table head at {:#x}", offset);
    }
    found
}

/// Like [`locate`], but reads the input in chunks
pub fn locate_in_reader<R: Read>(mut reader: R) -> io::Result<Option<u64>> {
    const CHUNK: usize = 64 * 1024;
    let keep = HEAD_MAGIC.len() - 1;

    let mut chunk = vec![0u8; CHUNK];
    let mut window: Vec<u8> = Vec::with_capacity(CHUNK + keep);
    // Stream offset of window[0].
    let mut base: u64 = 0;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        window.extend_from_slice(&chunk[..n]);

        if let Some(pos) = locate(&window) {
            return Ok(Some(base + pos as u64));
        }

        if window.len() > keep {
            let consumed = window.len() - keep;
            window.drain(..consumed);
            base += consumed as u64;
        }
    }
}

/// Reads a NUL/space padded text field
pub(crate) fn text_field(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = String::from_utf8_lossy(&raw[..end]);
    text.trim_end_matches(' ').to_string()
}

/// Writes a NUL-padded text field, truncating to its width
pub(crate) fn fill_text_field(field: &mut [u8], value: &str) {
    field.fill(0);
    let len = value.len().min(field.len());
    field[..len].copy_from_slice(&value.as_bytes()[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> PartitionEntry {
        PartitionEntry::named(name).unwrap()
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(ENTRY_SIZE, 48);
        assert_eq!(TABLE_SIZE, 2048);
    }

    #[test]
    fn test_locate_at_offset() {
        let mut data = vec![0xffu8; 0x3000];
        data[0x1234..0x1234 + 16].copy_from_slice(&HEAD_MAGIC);
        assert_eq!(locate(&data), Some(0x1234));
        assert_eq!(locate(&data[..0x1240]), None);
        assert_eq!(locate(&[]), None);
    }

    #[test]
    fn test_locate_requires_full_magic() {
        let mut data = vec![0u8; 64];
        data[4..14].copy_from_slice(b"pTableHead");
        data[14] = b'X';
        assert_eq!(locate(&data), None);
    }

    /// Reader that hands out a few bytes at a time.
    struct Dribble<'a>(&'a [u8], usize);

    impl Read for Dribble<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.1.min(buf.len()).min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_locate_in_reader_across_chunks() {
        let mut data = vec![0u8; 200_000];
        data[70_000..70_016].copy_from_slice(&HEAD_MAGIC);
        data[150_000..150_016].copy_from_slice(&HEAD_MAGIC);
        assert_eq!(locate_in_reader(data.as_slice()).unwrap(), Some(70_000));
        assert_eq!(locate_in_reader(Dribble(&data, 7)).unwrap(), Some(70_000));
        // Straddles the 64 KiB chunk boundary.
        let mut data = vec![0u8; 100_000];
        data[65_530..65_546].copy_from_slice(&HEAD_MAGIC);
        assert_eq!(locate_in_reader(data.as_slice()).unwrap(), Some(65_530));
        assert_eq!(locate_in_reader(&[0u8; 10][..]).unwrap(), None);
    }

    #[test]
    fn test_logical_entries_stop_before_empty_name() {
        let mut table = PartitionTable::new();
        table.push_entry(entry("fastboot")).unwrap();
        table.push_entry(entry("m3boot")).unwrap();
        table.push_entry(PartitionEntry::default()).unwrap();
        table.push_entry(entry("ghost")).unwrap();
        let names: Vec<_> = table.logical_entries().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["fastboot", "m3boot"]);
    }

    #[test]
    fn test_logical_entries_include_end_marker() {
        let mut table = PartitionTable::new();
        table.push_entry(entry("nvdload")).unwrap();
        table.push_entry(entry("T")).unwrap();
        table.push_entry(entry("after")).unwrap();
        let names: Vec<_> = table.logical_entries().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["nvdload", "T"]);
        assert!(table.find("after").is_none());
        assert!(table.find("nvdload").is_some());
    }

    #[test]
    fn test_push_entry_capacity() {
        let mut table = PartitionTable::new();
        for i in 0..MAX_PARTITIONS {
            table.push_entry(entry(&format!("p{i}"))).unwrap();
        }
        let err = table.push_entry(entry("one-too-many")).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { max: 41, .. }));
    }

    #[test]
    fn test_name_length_limit() {
        assert!(PartitionEntry::named("fifteen-chars!!").is_ok());
        assert!(PartitionEntry::named("sixteen-chars!!!").is_err());
    }

    #[test]
    fn test_text_fields_trim_padding() {
        let mut table = PartitionTable::new();
        table.version = *b"V7R2 \0\0\0\0\0\0\0\0\0\0\0";
        table.set_product("a-product-name-longer-than-16");
        assert_eq!(table.version(), "V7R2");
        assert_eq!(table.product(), "a-product-name-l");
    }

    #[test]
    fn test_validate_head() {
        let mut table = PartitionTable::new();
        assert!(table.validate_head().is_ok());
        table.head[0] = b'x';
        assert!(!table.has_valid_head());
        assert!(matches!(table.validate_head(), Err(Error::BadMagic { .. })));
    }

    #[test]
    fn test_map_lists_logical_entries() {
        let mut table = PartitionTable::new();
        let mut boot = entry("boot");
        boot.start = 0x60000;
        boot.length = 0x20000;
        table.push_entry(boot).unwrap();
        table.push_entry(entry("T")).unwrap();
        let text = table.map().to_string();
        assert!(text.contains(" 00 00060000 00020000"));
        assert!(text.trim_end().ends_with('T'));
    }
}
