//! Architecture-specific code
//!
//! The OP-TEE ABI is defined on top of the AArch64 SMC Calling Convention,
//! so register layouts and Stage-2 descriptor formats live here. Only the
//! `smc` instruction itself is gated on the build target.

pub mod aarch64;

pub use aarch64::*;
