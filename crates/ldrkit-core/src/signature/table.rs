//! Versioned patch tables supplied by the integrator.
//!
//! The table is a TOML document. Revision signatures are tried in file
//! order and the first one that matches wins, so the order of the
//! `[[revision]]` entries is part of the data.
//!
//! ```toml
//! version = "2024.06"
//!
//! [[revision]]
//! name = "V7R2"
//! signature = "00 00 95 e5 02 3a 13 e2"
//! offset = 4
//! payload = "00 00 a0 e3"
//!
//! [bad_block]
//! name = "isbad"
//! signature = "04 e0 2d e5 00 30 a0 e3"
//! offset = -8
//! payload = "00 00 a0 e3 1e ff 2f e1"
//! ```

use super::{PatchDefinition, PatchSite, Scanner, Signature, RECOMMENDED_MIN_SIGNATURE_LEN};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTable {
    version: String,
    #[serde(default)]
    revision: Vec<RawPatch>,
    bad_block: Option<RawPatch>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPatch {
    name: String,
    signature: String,
    offset: i32,
    payload: String,
}

impl RawPatch {
    fn into_definition(self) -> Result<PatchDefinition> {
        let pattern = decode_hex(&self.name, "signature", &self.signature)?;
        let payload = decode_hex(&self.name, "payload", &self.payload)?;

        if pattern.is_empty() {
            return Err(Error::patch_table(format!("'{}': empty signature", self.name)));
        }
        if payload.is_empty() {
            return Err(Error::patch_table(format!("'{}': empty payload", self.name)));
        }
        if pattern.len() < RECOMMENDED_MIN_SIGNATURE_LEN {
            warn!(
                "signature '{}' is only {} bytes long and may match by coincidence",
                self.name,
                pattern.len()
            );
        }

        Ok(PatchDefinition::new(
            Signature::new(self.name, pattern, self.offset),
            payload,
        ))
    }
}

fn decode_hex(name: &str, field: &str, text: &str) -> Result<Vec<u8>> {
    let compact: String = text.split_whitespace().collect();
    hex::decode(&compact)
        .map_err(|e| Error::patch_table(format!("'{name}': invalid {field} hex: {e}")))
}

/// A patch that was applied, and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPatch {
    /// Name of the matching signature
    pub name: String,
    /// Match and patch offsets
    pub site: PatchSite,
}

/// What happened to the bad-block patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadBlockOutcome {
    /// The caller did not ask for it
    NotRequested,
    /// The table does not define one
    NotConfigured,
    /// Its signature does not occur in the image
    NotFound,
    /// It was applied
    Applied(AppliedPatch),
}

/// Result of applying a [`PatchTable`] to an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    /// The first revision whose signature matched, if any
    pub revision: Option<AppliedPatch>,
    /// Outcome of the independent bad-block patch
    pub bad_block: BadBlockOutcome,
}

impl PatchReport {
    /// Returns true if anything was written
    pub fn modified(&self) -> bool {
        self.revision.is_some() || matches!(self.bad_block, BadBlockOutcome::Applied(_))
    }
}

/// An ordered list of revision patches plus an optional bad-block patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTable {
    /// Version string of the table data
    pub version: String,
    /// Revision patches, in the order they are tried
    pub revisions: Vec<PatchDefinition>,
    /// Patch disabling the bad-block check, tried independently
    pub bad_block: Option<PatchDefinition>,
}

impl PatchTable {
    /// Parses a table from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawTable = toml::from_str(text).map_err(|e| Error::patch_table(e.to_string()))?;

        let revisions = raw
            .revision
            .into_iter()
            .map(RawPatch::into_definition)
            .collect::<Result<Vec<_>>>()?;
        let bad_block = raw.bad_block.map(RawPatch::into_definition).transpose()?;

        debug!(
            "loaded patch table {} with {} revision(s)",
            raw.version,
            revisions.len()
        );

        Ok(Self {
            version: raw.version,
            revisions,
            bad_block,
        })
    }

    /// Reads and parses a table file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Applies the first matching revision patch and, if asked, the bad-block patch.
    ///
    /// The image is only modified if the whole run succeeds.
    pub fn apply(&self, scanner: &Scanner, data: &mut [u8], bad_block: bool) -> Result<PatchReport> {
        let mut work = data.to_vec();

        let mut revision = None;
        for def in &self.revisions {
            match scanner.patch(&mut work, def) {
                Ok(site) => {
                    info!("{} signature found at offset {:#010x}", def.name(), site.match_offset);
                    revision = Some(AppliedPatch {
                        name: def.name().to_string(),
                        site,
                    });
                    break;
                }
                Err(e) if e.is_recoverable() => trace!("{}", e),
                Err(e) => return Err(e),
            }
        }
        if revision.is_none() {
            warn!("no revision signature matched");
        }

        let bad_block = match (&self.bad_block, bad_block) {
            (_, false) => BadBlockOutcome::NotRequested,
            (None, true) => BadBlockOutcome::NotConfigured,
            (Some(def), true) => match scanner.patch(&mut work, def) {
                Ok(site) => BadBlockOutcome::Applied(AppliedPatch {
                    name: def.name().to_string(),
                    site,
                }),
                Err(e) if e.is_recoverable() => {
                    warn!("{} signature not found", def.name());
                    BadBlockOutcome::NotFound
                }
                Err(e) => return Err(e),
            },
        };

        data.copy_from_slice(&work);
        Ok(PatchReport {
            revision,
            bad_block,
        })
    }
}
