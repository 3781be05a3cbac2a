//! Memory management for the mediator
//!
//! - `pages`: RAII owners for hypervisor pages and temporary guest mappings
//! - `p2m`: the guest-address gate every shared page passes through
//! - `stage2`: read-only walker over AArch64 Stage-2 tables

pub mod p2m;
pub mod pages;
pub mod stage2;

pub use p2m::lookup_guest_ram;
pub use pages::{get_order_from_bytes, HostPages, MappedPage, PAGE_SIZE};
