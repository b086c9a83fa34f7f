//! Line-oriented `key=value` tokenizer shared by the text formats.
//!
//! Both the partition text format and the container metadata use the same
//! surface syntax: `#` comments, blank lines, `[section]` markers and
//! `key=value` pairs. Each format decides which sections and keys exist.

use crate::error::{Error, Result};
use std::io::BufRead;

/// One meaningful line of input
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Line<'a> {
    /// `[name]`
    Section(&'a str),
    /// `key=value`, both sides trimmed
    Pair { key: &'a str, value: &'a str },
}

/// Calls `f` with the 1-based line number and contents of every meaningful line.
pub(crate) fn for_each_line<R, F>(reader: R, mut f: F) -> Result<()>
where
    R: BufRead,
    F: FnMut(usize, Line<'_>) -> Result<()>,
{
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let number = index + 1;
        if let Some(parsed) = classify(number, &line)? {
            f(number, parsed)?;
        }
    }
    Ok(())
}

fn classify(number: usize, raw: &str) -> Result<Option<Line<'_>>> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
        return Ok(Some(Line::Section(inner.trim())));
    }

    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| Error::invalid_line(number, format!("expected key=value, got '{line}'")))?;

    Ok(Some(Line::Pair {
        key: key.trim(),
        value: value.trim(),
    }))
}

/// Parses a decimal or `0x`-prefixed hexadecimal 32-bit value
pub(crate) fn parse_u32(number: usize, key: &str, value: &str) -> Result<u32> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.map_err(|_| Error::invalid_line(number, format!("invalid number for '{key}': '{value}'")))
}
