// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for the elemental deploy toolkit
//!
//! Everything here talks to the host directly:
//! - external commands through the [`Runner`] trait (parted, mkfs, losetup, ...)
//! - the mount table through the [`Mounter`] trait
//! - container registries through [`ImageExtractor`]
//! - image signatures through [`SignatureVerifier`]
//!
//! The `testing` feature provides in-memory fakes of each trait.

pub mod cosign;
pub mod device;
pub mod error;
pub mod extractor;
pub mod fsutil;
pub mod layer;
pub mod mounter;
pub mod mountinfo;
pub mod partitioner;
pub mod runner;
pub mod squashfs;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cosign::{CosignVerifier, SignatureVerifier};
pub use error::{Result, SysError};
pub use extractor::{ImageExtractor, OciImageExtractor};
pub use mounter::{Mounter, SystemMounter};
pub use mountinfo::MountEntry;
pub use runner::{CommandRunner, Runner, command_exists};
