//! # ldrkit-core
//!
//! A library for taking apart and rebuilding Balong-family boot loader images.
//!
//! This crate provides the core functionality for:
//! - Finding known code sequences in a loader and patching near them
//! - Locating, decoding and re-encoding the embedded partition table
//! - Splitting USB loader containers into blocks and putting them back together
//!
//! ## Architecture
//!
//! The library is organized into three independent engines that only share
//! the notion of a byte buffer holding a loaded image:
//!
//! - [`signature`]: Signature scanning and in-place patching
//! - [`ptable`]: Partition table binary and text codec
//! - [`container`]: USB loader container codec and its metadata
//! - [`error`]: Error types and handling
//!
//! No engine calls another, and none of them touches the filesystem except
//! through the explicit `from_path` style helpers.
//!
//! ## Example
//!
//! ```no_run
//! use ldrkit_core::{ptable, PartitionTable};
//! use std::fs;
//!
//! let image = fs::read("usbloader.bin")?;
//! let offset = ptable::locate(&image).ok_or(ldrkit_core::Error::TableNotFound)?;
//!
//! let table: PartitionTable = ptable::decode_binary(&image[offset..])?;
//! print!("{}", table.map());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod container;
pub mod error;
mod kv;
pub mod ptable;
pub mod signature;

// Re-export primary types for convenience
pub use container::{BlockDescriptor, BlockSpec, BootMode, ContainerHeader, Manifest};
pub use error::{Error, ErrorKind, Result, Warning};
pub use ptable::{PartitionEntry, PartitionTable};
pub use signature::{PatchDefinition, PatchTable, Scanner, ScannerConfig, Signature};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
