//! ARM64/AArch64 architecture support
//!
//! - Trapped SMC register view (`regs`)
//! - Stage-2 descriptor constants (`defs`)
//! - The `smc #0` conduit to EL3 (`smc`, AArch64 builds only)

pub mod defs;
pub mod regs;
#[cfg(target_arch = "aarch64")]
pub mod smc;

pub use regs::*;
