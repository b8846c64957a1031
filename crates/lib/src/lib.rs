//! repro-lib: reproducible build-and-release pipeline
//!
//! Layers, leaves first:
//! - `pins`: the pin file recording exact toolchain, registry and tool sources
//! - `toolchain`: materializes the pinned compiler, never the host one
//! - `vendor`: turns `Cargo.lock` into an offline, checksum-verified package set
//! - `build`: one sandboxed, deterministic derivation producing one binary
//! - `release`: tag-triggered fan-out over the release matrix
//!
//! `pipeline` wires the layers together for one project on one platform.

pub mod build;
pub mod config;
pub mod consts;
pub mod fetch;
pub mod gc;
pub mod git;
pub mod pins;
pub mod pipeline;
pub mod platform;
pub mod release;
pub mod store;
pub mod toolchain;
pub mod util;
pub mod vendor;
