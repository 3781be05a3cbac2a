//! Hypervisor services consumed by the mediator.
//!
//! The mediator never touches page tables, the allocator or the SMC
//! instruction directly; everything goes through [`TeeHal`]. The host
//! hypervisor implements it once, and tests substitute a fake.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeMap;
use core::fmt;
use core::ptr::NonNull;

use spin::RwLock;

use crate::arch::aarch64::defs::{PAGE_SHIFT, PAGE_SIZE_4KB};
use crate::mm::stage2::Stage2Walker;
use crate::smccc::{SmcArgs, SmcConduit, SmcResult};

/// Hypervisor domain identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DomainId(pub u16);

impl DomainId {
    /// Id the Secure World knows this domain by. Client id 0 is reserved
    /// for the hypervisor itself.
    pub const fn client_id(self) -> u32 {
        self.0 as u32 + 1
    }
}

impl fmt::Debug for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// Guest frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gfn(pub u64);

impl Gfn {
    pub const fn from_addr(gaddr: u64) -> Self {
        Self(gaddr >> PAGE_SHIFT)
    }

    pub const fn to_addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }
}

/// Machine (host physical) frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mfn(pub u64);

impl Mfn {
    pub const fn from_addr(maddr: u64) -> Self {
        Self(maddr >> PAGE_SHIFT)
    }

    pub const fn to_addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }
}

/// Kind of memory a second-stage entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P2mType {
    /// Normal memory, guest read/write.
    RamRw,
    /// Normal memory, guest read-only.
    RamRo,
    /// Device memory (emulated or passed-through MMIO).
    Mmio,
    /// Any other permission combination.
    Other,
}

/// Result of a second-stage lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct P2mEntry {
    pub mfn: Mfn,
    pub p2m_type: P2mType,
}

/// The interfaces which the host hypervisor must implement.
pub trait TeeHal: Send + Sync + 'static {
    /// Look up `gfn` in `domain`'s second-stage translation table.
    fn p2m_lookup(&self, domain: DomainId, gfn: Gfn) -> Option<P2mEntry>;

    /// Map a host frame for hypervisor access.
    fn map_domain_page(&self, mfn: Mfn) -> Option<NonNull<u8>>;

    /// Undo [`TeeHal::map_domain_page`].
    ///
    /// # Safety
    /// `va` must come from `map_domain_page` and must not be used afterwards.
    unsafe fn unmap_domain_page(&self, va: NonNull<u8>);

    /// Allocate `1 << order` contiguous hypervisor-private pages.
    fn alloc_host_pages(&self, order: u32) -> Option<NonNull<u8>>;

    /// Free pages obtained from [`TeeHal::alloc_host_pages`].
    ///
    /// # Safety
    /// `va` and `order` must match a live allocation.
    unsafe fn free_host_pages(&self, va: NonNull<u8>, order: u32);

    /// Machine address backing a hypervisor-private allocation.
    fn virt_to_maddr(&self, va: NonNull<u8>) -> u64;

    /// Synchronous call into the Secure World.
    fn call_smc(&self, args: &SmcArgs) -> SmcResult;
}

/// [`TeeHal`] for an EL2 hypervisor that identity-maps all of RAM
/// (VA == PA, and guest Stage-2 tables are reachable at their PA).
///
/// Each domain's Stage-2 root is registered with [`IdentityHal::attach_domain`]
/// when its VTTBR is set up; lookups walk those tables directly.
pub struct IdentityHal<C: SmcConduit> {
    conduit: C,
    stage2_roots: RwLock<BTreeMap<DomainId, u64>>,
}

impl<C: SmcConduit> IdentityHal<C> {
    pub fn new(conduit: C) -> Self {
        Self {
            conduit,
            stage2_roots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register the L0 table address of `domain`'s Stage-2 tables.
    pub fn attach_domain(&self, domain: DomainId, l0_table: u64) {
        self.stage2_roots.write().insert(domain, l0_table);
    }

    pub fn detach_domain(&self, domain: DomainId) {
        self.stage2_roots.write().remove(&domain);
    }

    fn layout(order: u32) -> Option<Layout> {
        let size = (PAGE_SIZE_4KB as usize).checked_shl(order)?;
        Layout::from_size_align(size, PAGE_SIZE_4KB as usize).ok()
    }
}

impl<C: SmcConduit + 'static> TeeHal for IdentityHal<C> {
    fn p2m_lookup(&self, domain: DomainId, gfn: Gfn) -> Option<P2mEntry> {
        let l0 = *self.stage2_roots.read().get(&domain)?;
        // SAFETY: roots are registered by the owner of the Stage-2 tables,
        // which stay live and identity-mapped while the domain is attached.
        unsafe { Stage2Walker::new(l0).lookup(gfn.to_addr()) }
    }

    fn map_domain_page(&self, mfn: Mfn) -> Option<NonNull<u8>> {
        NonNull::new(mfn.to_addr() as *mut u8)
    }

    unsafe fn unmap_domain_page(&self, _va: NonNull<u8>) {}

    fn alloc_host_pages(&self, order: u32) -> Option<NonNull<u8>> {
        let layout = Self::layout(order)?;
        // SAFETY: layout has non-zero size.
        NonNull::new(unsafe { alloc_zeroed(layout) })
    }

    unsafe fn free_host_pages(&self, va: NonNull<u8>, order: u32) {
        if let Some(layout) = Self::layout(order) {
            dealloc(va.as_ptr(), layout);
        }
    }

    fn virt_to_maddr(&self, va: NonNull<u8>) -> u64 {
        va.as_ptr() as u64
    }

    fn call_smc(&self, args: &SmcArgs) -> SmcResult {
        self.conduit.call(args)
    }
}
