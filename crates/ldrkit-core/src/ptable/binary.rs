//! Fixed-layout binary encoding of partition tables.

use super::{PartitionEntry, PartitionTable, ENTRY_SIZE, MAX_PARTITIONS, TABLE_SIZE};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use tracing::debug;

impl PartitionEntry {
    fn read_from(buf: &mut impl Buf) -> Self {
        let mut entry = Self::default();
        buf.copy_to_slice(&mut entry.name);
        entry.start = buf.get_u32_le();
        entry.lsize = buf.get_u32_le();
        entry.length = buf.get_u32_le();
        entry.loadaddr = buf.get_u32_le();
        entry.entry = buf.get_u32_le();
        entry.kind = buf.get_u32_le();
        entry.nproperty = buf.get_u32_le();
        entry.count = buf.get_u32_le();
        entry
    }

    fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.name);
        buf.put_u32_le(self.start);
        buf.put_u32_le(self.lsize);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.loadaddr);
        buf.put_u32_le(self.entry);
        buf.put_u32_le(self.kind);
        buf.put_u32_le(self.nproperty);
        buf.put_u32_le(self.count);
    }
}

/// Decodes a table from the first [`TABLE_SIZE`] bytes of `data`.
///
/// The head magic is not checked; see [`PartitionTable::validate_head`].
pub fn decode_binary(data: &[u8]) -> Result<PartitionTable> {
    if data.len() < TABLE_SIZE {
        return Err(Error::Truncated {
            what: "partition table",
            needed: TABLE_SIZE,
            available: data.len(),
        });
    }

    let mut buf = &data[..TABLE_SIZE];
    let mut table = PartitionTable::new();
    buf.copy_to_slice(&mut table.head);
    buf.copy_to_slice(&mut table.version);
    buf.copy_to_slice(&mut table.product);

    let mut ended = false;
    for _ in 0..MAX_PARTITIONS {
        let entry = PartitionEntry::read_from(&mut buf);
        if ended {
            continue;
        }
        if entry.name[0] == 0 {
            ended = true;
            continue;
        }
        ended = entry.is_end_marker();
        table.entries.push(entry);
    }

    buf.copy_to_slice(&mut table.tail);
    debug!("decoded partition table with {} entries", table.entries.len());
    Ok(table)
}

/// Encodes a table into exactly [`TABLE_SIZE`] bytes.
///
/// Only [`PartitionTable::logical_entries`] are written; remaining slots are zero.
pub fn encode_binary(table: &PartitionTable) -> Vec<u8> {
    let mut out = Vec::with_capacity(TABLE_SIZE);
    out.put_slice(&table.head);
    out.put_slice(&table.version);
    out.put_slice(&table.product);

    let entries = table.logical_entries();
    for entry in entries {
        entry.write_to(&mut out);
    }
    out.put_bytes(0, (MAX_PARTITIONS - entries.len()) * ENTRY_SIZE);

    out.put_slice(&table.tail);
    debug_assert_eq!(out.len(), TABLE_SIZE);
    out
}

#[cfg(test)]
mod tests {
    use super::super::HEAD_MAGIC;
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> PartitionTable {
        let mut table = PartitionTable::new();
        table.set_version("V7R2_1.0");
        table.set_product("hi6930");
        for (i, name) in ["m3boot", "fastboot", "nvdload", "kernel", "T"].iter().enumerate() {
            let mut e = PartitionEntry::named(name).unwrap();
            let i = i as u32;
            e.start = 0x20000 * i;
            e.lsize = 0x100 + i;
            e.length = 0x20000;
            e.loadaddr = 0x5000_0000 + i;
            e.entry = 0x5000_1000 + i;
            e.kind = i % 3;
            e.nproperty = 0x10 * i;
            e.count = i;
            table.push_entry(e).unwrap();
        }
        table.tail.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        table
    }

    #[test]
    fn test_round_trip() {
        let table = sample();
        let bytes = encode_binary(&table);
        assert_eq!(bytes.len(), TABLE_SIZE);
        assert_eq!(decode_binary(&bytes).unwrap(), table);
    }

    #[test]
    fn test_field_order_and_endianness() {
        let bytes = encode_binary(&sample());
        assert_eq!(&bytes[..16], &HEAD_MAGIC);
        assert_eq!(&bytes[16..24], b"V7R2_1.0");
        assert_eq!(&bytes[32..38], b"hi6930");

        // Second entry: name, then start, lsize, length, ...
        let e = &bytes[48 + ENTRY_SIZE..48 + 2 * ENTRY_SIZE];
        assert_eq!(&e[..8], b"fastboot");
        assert_eq!(&e[16..20], &0x20000u32.to_le_bytes());
        assert_eq!(&e[20..24], &0x101u32.to_le_bytes());
        assert_eq!(&e[24..28], &0x20000u32.to_le_bytes());
        assert_eq!(&e[44..48], &1u32.to_le_bytes());

        assert_eq!(bytes[TABLE_SIZE - 32], 0);
        assert_eq!(bytes[TABLE_SIZE - 1], 31);
    }

    #[test]
    fn test_empty_table_size() {
        let bytes = encode_binary(&PartitionTable::new());
        assert_eq!(bytes.len(), TABLE_SIZE);
        assert!(bytes[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_ignores_slots_after_terminator() {
        let mut bytes = encode_binary(&sample());
        // Plant a plausible entry right after "T" (slot 5).
        let slot = 48 + 5 * ENTRY_SIZE;
        bytes[slot..slot + 5].copy_from_slice(b"ghost");
        bytes[slot + 16..slot + 20].copy_from_slice(&0x1234u32.to_le_bytes());

        let table = decode_binary(&bytes).unwrap();
        assert_eq!(table.entries().len(), 5);
        assert_eq!(table.entries()[4].name(), "T");
        assert!(encode_binary(&table)[slot..slot + ENTRY_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_decode_stops_at_empty_name() {
        let mut table = PartitionTable::new();
        table.push_entry(PartitionEntry::named("a").unwrap()).unwrap();
        let mut bytes = encode_binary(&table);
        let slot = 48 + 2 * ENTRY_SIZE;
        bytes[slot] = b'b';

        let decoded = decode_binary(&bytes).unwrap();
        assert_eq!(decoded.entries().len(), 1);
    }

    #[test]
    fn test_decode_does_not_check_magic() {
        let mut bytes = encode_binary(&sample());
        bytes[0] = b'X';
        let table = decode_binary(&bytes).unwrap();
        assert!(!table.has_valid_head());
    }

    #[test]
    fn test_decode_short_input() {
        let bytes = encode_binary(&sample());
        let err = decode_binary(&bytes[..TABLE_SIZE - 1]).unwrap_err();
        assert!(matches!(
            err,
            Error::Truncated {
                needed: TABLE_SIZE,
                available: 2047,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = encode_binary(&sample());
        bytes.extend_from_slice(&[0xAA; 100]);
        assert_eq!(decode_binary(&bytes).unwrap(), sample());
    }
}
