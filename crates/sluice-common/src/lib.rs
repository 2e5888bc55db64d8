//! # sluice-common
//!
//! Shared types and utilities for the sluice asynchronous file I/O
//! dispatcher.
//!
//! This crate provides the foundation used across all sluice components:
//!
//! - **Errors**: the unified [`IoError`] type and [`IoResult`] alias
//! - **Flags**: [`FileFlags`] open flags and [`SectionFlags`] memory-section
//!   flags
//! - **Utilities**: page sizes, allocation granularity, random names, and
//!   temporary-directory probing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flags;
pub mod utils;

pub use error::{invariant_failure, IoError, IoResult};
pub use flags::{FileFlags, SectionFlags};
