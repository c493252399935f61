//! # Target Windows Profile
//!
//! One value, [`WindowsProfile`], carries everything that varies with the
//! target's architecture and kernel build: which VAD node layout to parse,
//! where the control area keeps its file pointer, how large pool headers
//! are, where in `EPROCESS` the VAD root and node count live.
//!
//! No other crate in the workspace tests build numbers; they ask the
//! profile. The structure offsets are fixed per Windows version rather than
//! resolved from debug symbols, which keeps reconstruction fast and
//! symbol-server-free; the host supplies only the `EPROCESS.VadRoot` offset
//! it knows for its target.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod profile;

pub use profile::{
    Arch, EprocessOffsets, VadCountSource, VadVariant, WindowsProfile,
};

/// First Windows Vista build number.
pub const BUILD_VISTA: u32 = 6000;
/// First Windows 8.0 build number.
pub const BUILD_8_0: u32 = 9200;
/// First Windows 8.1 build number.
pub const BUILD_8_1: u32 = 9600;
/// Windows 10 1803.
pub const BUILD_10_1803: u32 = 17134;
/// Windows 10 1903.
pub const BUILD_10_1903: u32 = 18362;
