//! Secure World mediator for an AArch64 hypervisor.
//!
//! Guests cannot talk to the Trusted OS directly: their requests carry
//! guest-physical addresses and any of them could impersonate another VM.
//! The mediator sits in the hypervisor's SMC trap path, rewrites every
//! memory reference into host addresses, tags each call with the caller's
//! client id, and keeps the state needed to resume calls across OP-TEE's
//! RPC round trips.
//!
//! The host hypervisor provides [`hal::TeeHal`], builds a [`tee::Tee`]
//! registry at boot and routes Trusted OS SMCs into it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod hal;
pub mod mm;
pub mod smccc;
pub mod tee;

pub use config::MediatorConfig;
pub use error::{TeeError, TeeResult};
pub use hal::{DomainId, TeeHal};
pub use tee::{Tee, TeeMediator};
