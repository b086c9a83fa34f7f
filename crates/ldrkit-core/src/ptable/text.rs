//! Editable text form of partition tables.
//!
//! ```text
//! version=V7R2
//! product=hi6930
//! tail=00000000...
//!
//! [partition]
//! name=fastboot
//! start=0x0
//! length=0x40000
//! ...
//! ```

use super::{
    fill_text_field, text_field, PartitionEntry, PartitionTable, MAX_PARTITIONS, NAME_LEN,
    TAIL_LEN,
};
use crate::error::{Error, Result};
use crate::kv::{self, Line};
use std::fmt::Write as FmtWrite;
use std::io::BufRead;
use tracing::warn;

const SECTION: &str = "partition";

/// Parses the text form.
///
/// Fields that are never mentioned stay zero; the head magic is always set.
pub fn decode_text<R: BufRead>(reader: R) -> Result<PartitionTable> {
    let mut table = PartitionTable::new();

    kv::for_each_line(reader, |number, line| match line {
        Line::Section(SECTION) => table.push_entry(PartitionEntry::default()).map_err(|_| {
            Error::invalid_line(
                number,
                format!("too many partitions (at most {MAX_PARTITIONS})"),
            )
        }),
        Line::Section(other) => Err(Error::invalid_line(
            number,
            format!("unknown section '[{other}]'"),
        )),
        Line::Pair { key, value } => apply_pair(&mut table, number, key, value),
    })?;

    Ok(table)
}

fn apply_pair(table: &mut PartitionTable, number: usize, key: &str, value: &str) -> Result<()> {
    match key {
        "version" => {
            fill_text_field(&mut table.version, value);
            return Ok(());
        }
        "product" => {
            fill_text_field(&mut table.product, value);
            return Ok(());
        }
        "tail" => {
            table.tail = parse_tail(number, value)?;
            return Ok(());
        }
        _ => {}
    }

    let entry = table.entries.last_mut().ok_or_else(|| {
        Error::invalid_line(number, format!("'{key}' appears before any [partition]"))
    })?;

    let field = match key {
        "name" => {
            return entry
                .set_name(value)
                .map_err(|e| Error::invalid_line(number, e.to_string()));
        }
        "start" => &mut entry.start,
        "length" => &mut entry.length,
        "lsize" => &mut entry.lsize,
        "loadaddr" => &mut entry.loadaddr,
        "entry" => &mut entry.entry,
        "nproperty" => &mut entry.nproperty,
        "type" => &mut entry.kind,
        "count" => &mut entry.count,
        _ => return Err(Error::unknown_key(number, key)),
    };
    *field = kv::parse_u32(number, key, value)?;
    Ok(())
}

fn parse_tail(number: usize, value: &str) -> Result<[u8; TAIL_LEN]> {
    let mut tail = [0u8; TAIL_LEN];
    hex::decode_to_slice(value, &mut tail).map_err(|e| {
        Error::invalid_line(
            number,
            format!("tail must be {} hex digits: {e}", TAIL_LEN * 2),
        )
    })?;
    Ok(tail)
}

/// Renders the text form of `table`
pub fn encode_text(table: &PartitionTable) -> String {
    let mut output = String::new();
    write_text(table, &mut output).expect("String write cannot fail");
    output
}

/// Writes the text form of `table` to `w`.
///
/// Entries are written up to and including the `"T"` marker; an entry with
/// an empty name ends the list without being written.
pub fn write_text(table: &PartitionTable, w: &mut impl FmtWrite) -> std::fmt::Result {
    writeln!(w, "version={}", table.version())?;
    writeln!(w, "product={}", table.product())?;
    writeln!(w, "tail={}", hex::encode(table.tail))?;
    writeln!(w)?;

    for e in table.logical_entries() {
        writeln!(w, "[{SECTION}]")?;
        writeln!(w, "name={}", editable_name(e))?;
        writeln!(w, "start={:#x}", e.start)?;
        writeln!(w, "length={:#x}", e.length)?;
        writeln!(w, "lsize={:#x}", e.lsize)?;
        writeln!(w, "loadaddr={:#x}", e.loadaddr)?;
        writeln!(w, "entry={:#x}", e.entry)?;
        writeln!(w, "nproperty={:#x}", e.nproperty)?;
        writeln!(w, "type={:#x}", e.kind)?;
        writeln!(w, "count={:#x}", e.count)?;
        writeln!(w)?;
    }
    Ok(())
}

/// Name as written to text: a name filling all 16 bytes is cut to 15 so
/// that it parses back.
fn editable_name(entry: &PartitionEntry) -> String {
    if entry.name.contains(&0) {
        return entry.name();
    }
    let cut = text_field(&entry.name[..NAME_LEN - 1]);
    warn!(
        "partition name '{}' has no NUL terminator, written as '{}'",
        entry.name(),
        cut
    );
    cut
}
