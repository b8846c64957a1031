//! Shared utilities.
//!
//! Common utilities used across the crate including hashing, archive
//! unpacking and test helpers.

pub mod archive;
pub mod hash;

#[cfg(test)]
pub mod testutil;
