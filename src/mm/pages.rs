//! Owned hypervisor pages and scoped guest page mappings.
//!
//! Both types release what they hold on drop, so every exit path of a call
//! (completion, early failure, domain teardown) frees exactly once.

use alloc::sync::Arc;
use core::ptr::NonNull;

use log::trace;

use crate::arch::aarch64::defs::PAGE_SIZE_4KB;
use crate::error::{TeeError, TeeResult};
use crate::hal::{Mfn, TeeHal};

pub const PAGE_SIZE: usize = PAGE_SIZE_4KB as usize;

/// Smallest order such that `PAGE_SIZE << order >= bytes`.
pub fn get_order_from_bytes(bytes: usize) -> u32 {
    let pages = bytes.div_ceil(PAGE_SIZE);
    if pages <= 1 {
        0
    } else {
        usize::BITS - (pages - 1).leading_zeros()
    }
}

/// `1 << order` contiguous hypervisor-private pages, freed on drop.
pub struct HostPages<H: TeeHal> {
    hal: Arc<H>,
    va: NonNull<u8>,
    order: u32,
}

// SAFETY: the allocation is exclusively owned by this value.
unsafe impl<H: TeeHal> Send for HostPages<H> {}

impl<H: TeeHal> HostPages<H> {
    /// Allocate and zero `1 << order` pages.
    pub fn alloc(hal: &Arc<H>, order: u32) -> TeeResult<Self> {
        let va = hal
            .alloc_host_pages(order)
            .ok_or(TeeError::Resource("host page allocation failed"))?;
        let pages = Self {
            hal: Arc::clone(hal),
            va,
            order,
        };
        // SAFETY: freshly allocated, len() bytes, exclusively owned.
        unsafe { core::ptr::write_bytes(pages.va.as_ptr(), 0, pages.len()) };
        trace!("allocated host pages {:#x} order {}", pages.maddr(), order);
        Ok(pages)
    }

    pub fn len(&self) -> usize {
        PAGE_SIZE << self.order
    }

    /// Machine address of the first page.
    pub fn maddr(&self) -> u64 {
        self.hal.virt_to_maddr(self.va)
    }

    /// Machine address of page `index` within the allocation.
    pub fn page_maddr(&self, index: usize) -> u64 {
        assert!(index < (1 << self.order));
        // SAFETY: index is within the allocation.
        let va = unsafe { NonNull::new_unchecked(self.va.as_ptr().add(index * PAGE_SIZE)) };
        self.hal.virt_to_maddr(va)
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: allocation is len() bytes and owned by self.
        unsafe { core::slice::from_raw_parts(self.va.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: allocation is len() bytes and exclusively owned by self.
        unsafe { core::slice::from_raw_parts_mut(self.va.as_ptr(), self.len()) }
    }
}

impl<H: TeeHal> Drop for HostPages<H> {
    fn drop(&mut self) {
        trace!("freeing host pages {:#x} order {}", self.maddr(), self.order);
        // SAFETY: va/order come from alloc_host_pages and are freed once.
        unsafe { self.hal.free_host_pages(self.va, self.order) };
    }
}

/// A guest-owned frame mapped into the hypervisor, unmapped on drop.
///
/// The guest can write the page concurrently, so contents are only ever
/// copied out or in; no references into it are handed out.
pub struct MappedPage<H: TeeHal> {
    hal: Arc<H>,
    va: NonNull<u8>,
    mfn: Mfn,
}

// SAFETY: the mapping is exclusively owned by this value.
unsafe impl<H: TeeHal> Send for MappedPage<H> {}

impl<H: TeeHal> MappedPage<H> {
    pub fn map(hal: &Arc<H>, mfn: Mfn) -> TeeResult<Self> {
        let va = hal
            .map_domain_page(mfn)
            .ok_or(TeeError::Resource("could not map domain page"))?;
        Ok(Self {
            hal: Arc::clone(hal),
            va,
            mfn,
        })
    }

    pub fn mfn(&self) -> Mfn {
        self.mfn
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE);
        // SAFETY: bounds checked above; the mapping covers one page.
        unsafe {
            core::ptr::copy_nonoverlapping(self.va.as_ptr().add(offset), buf.as_mut_ptr(), buf.len())
        };
    }

    /// Copy `buf` into the page at `offset`.
    pub fn write(&mut self, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE);
        // SAFETY: bounds checked above; the mapping covers one page.
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), self.va.as_ptr().add(offset), buf.len())
        };
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        self.read(offset, &mut raw);
        u64::from_le_bytes(raw)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write(offset, &value.to_le_bytes());
    }
}

impl<H: TeeHal> Drop for MappedPage<H> {
    fn drop(&mut self) {
        // SAFETY: va comes from map_domain_page and is not used after this.
        unsafe { self.hal.unmap_domain_page(self.va) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_from_bytes() {
        assert_eq!(get_order_from_bytes(0), 0);
        assert_eq!(get_order_from_bytes(1), 0);
        assert_eq!(get_order_from_bytes(PAGE_SIZE), 0);
        assert_eq!(get_order_from_bytes(PAGE_SIZE + 1), 1);
        assert_eq!(get_order_from_bytes(3 * PAGE_SIZE), 2);
        assert_eq!(get_order_from_bytes(4 * PAGE_SIZE), 2);
        assert_eq!(get_order_from_bytes(5 * PAGE_SIZE), 3);
    }
}
