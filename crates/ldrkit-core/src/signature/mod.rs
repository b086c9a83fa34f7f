//! Signature scanning and in-place patching of loader images.
//!
//! A [`Signature`] is an exact byte sequence plus a signed offset, measured
//! from the first byte after the match, at which a patch payload is written.
//! Signatures do not carry their payloads; a [`PatchDefinition`] pairs the
//! two, and a curated, ordered list of definitions forms a [`PatchTable`].
//!
//! ## Algorithm Overview
//!
//! 1. Search the buffer for the lowest-address occurrence of the pattern
//! 2. Compute the patch location as `match_end + patch_offset`
//! 3. Bounds-check the whole payload range against the buffer
//! 4. Copy the payload over the target bytes
//!
//! Nothing is written unless every check passes.
//!
//! ```
//! use ldrkit_core::signature::{PatchDefinition, Scanner, Signature};
//!
//! let mut image = vec![0u8; 32];
//! image[8..16].copy_from_slice(b"SIGNATUR");
//!
//! let def = PatchDefinition::new(Signature::new("demo", b"SIGNATUR".to_vec(), 4), vec![0xAA; 2]);
//! let site = Scanner::new().patch(&mut image, &def)?;
//!
//! assert_eq!(site.match_offset, 8);
//! assert_eq!(site.location, 20);
//! assert_eq!(&image[20..22], &[0xAA, 0xAA]);
//! # Ok::<(), ldrkit_core::Error>(())
//! ```

mod table;

use crate::error::{Error, Result};
use tracing::{debug, trace};

pub use table::{AppliedPatch, BadBlockOutcome, PatchReport, PatchTable};

/// Signatures shorter than this are likely to match by coincidence
pub const RECOMMENDED_MIN_SIGNATURE_LEN: usize = 8;

/// A named byte pattern identifying one firmware revision's code point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Revision name, used in reports and errors
    pub name: String,
    /// Exact bytes to match
    pub pattern: Vec<u8>,
    /// Offset of the patch point relative to the first byte after the match
    pub patch_offset: i32,
}

impl Signature {
    /// Creates a new signature
    pub fn new(name: impl Into<String>, pattern: Vec<u8>, patch_offset: i32) -> Self {
        Self {
            name: name.into(),
            pattern,
            patch_offset,
        }
    }
}

/// A signature together with the bytes written at its patch point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDefinition {
    /// Where to patch
    pub signature: Signature,
    /// What to write there
    pub payload: Vec<u8>,
}

impl PatchDefinition {
    /// Creates a new patch definition
    pub fn new(signature: Signature, payload: Vec<u8>) -> Self {
        Self { signature, payload }
    }

    /// Name of the underlying signature
    pub fn name(&self) -> &str {
        &self.signature.name
    }
}

/// Where a signature matched and where its payload goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    /// Offset of the first byte of the match
    pub match_offset: usize,
    /// Offset the payload is (or would be) written to
    pub location: usize,
}

/// Configuration for the scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// First offset considered as a match start
    pub start: usize,
    /// Step between candidate match starts (1 = every byte)
    pub alignment: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            start: 0,
            alignment: 1,
        }
    }
}

impl ScannerConfig {
    /// Creates a new scanner config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Word-aligned scan starting past the reset vectors, as ARM code is laid out
    pub fn arm_aligned() -> Self {
        Self::new().start(8).alignment(4)
    }

    /// Sets the first offset considered
    pub fn start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    /// Sets the candidate step
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment.max(1);
        self
    }
}

/// Locates signatures in a buffer and applies their patches
#[derive(Debug, Clone, Default)]
pub struct Scanner {
    config: ScannerConfig,
}

impl Scanner {
    /// Creates a new scanner with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new scanner with custom configuration
    pub fn with_config(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Returns the offset of the lowest-address occurrence of `signature`
    pub fn find(&self, data: &[u8], signature: &Signature) -> Result<usize> {
        let found = self.find_pattern(data, &signature.pattern);
        match found {
            Some(offset) => {
                debug!("signature '{}' found at {:#x}", signature.name, offset);
                Ok(offset)
            }
            None => {
                trace!("signature '{}' not found", signature.name);
                Err(Error::signature_not_found(&signature.name))
            }
        }
    }

    /// Finds the signature and validates its patch range without writing
    pub fn locate_patch(&self, data: &[u8], def: &PatchDefinition) -> Result<PatchSite> {
        let signature = &def.signature;
        let match_offset = self.find(data, signature)?;
        let match_end = match_offset + signature.pattern.len();
        let location = match_end as i64 + i64::from(signature.patch_offset);

        let out_of_bounds = || Error::PatchOutOfBounds {
            name: signature.name.clone(),
            location,
            len: def.payload.len(),
            buffer_len: data.len(),
        };

        let start = usize::try_from(location).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(def.payload.len()).ok_or_else(out_of_bounds)?;
        if end > data.len() {
            return Err(out_of_bounds());
        }

        Ok(PatchSite {
            match_offset,
            location: start,
        })
    }

    /// Finds the signature and writes the payload at its patch point
    pub fn patch(&self, data: &mut [u8], def: &PatchDefinition) -> Result<PatchSite> {
        let site = self.locate_patch(data, def)?;
        data[site.location..site.location + def.payload.len()].copy_from_slice(&def.payload);
        debug!(
            "patched '{}': {} bytes at {:#x}",
            def.name(),
            def.payload.len(),
            site.location
        );
        Ok(site)
    }

    fn find_pattern(&self, data: &[u8], pattern: &[u8]) -> Option<usize> {
        if pattern.is_empty() || data.len() < pattern.len() {
            return None;
        }

        let start = self.config.start;
        if self.config.alignment <= 1 {
            return find_subsequence(data.get(start..)?, pattern).map(|pos| pos + start);
        }

        let last = data.len() - pattern.len();
        (start..=last)
            .step_by(self.config.alignment)
            .find(|&i| &data[i..i + pattern.len()] == pattern)
    }
}

/// Find a subsequence within a byte slice
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
