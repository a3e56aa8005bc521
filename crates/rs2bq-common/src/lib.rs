//! rs2bq Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the rs2bq workspace members:
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Checksums**: verification of downloaded staging files
//! - **Logging**: `tracing` subscriber setup driven by environment variables
//!
//! # Example
//!
//! ```no_run
//! use rs2bq_common::checksum::{md5_from_etag, verify_file_md5};
//!
//! fn check(path: &str, e_tag: &str) -> rs2bq_common::Result<()> {
//!     match md5_from_etag(e_tag) {
//!         Some(expected) => verify_file_md5(path, &expected),
//!         None => Ok(()),
//!     }
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
