//! RPC-allocated shared memory.
//!
//! When OP-TEE asks for a buffer (`RPC_FUNC_ALLOC`) the guest returns a
//! page of its own RAM. Firmware never sees that page: it gets a shadow
//! page owned by the hypervisor, and RPC commands are copied between the
//! two when control crosses the mediator.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};
use spin::Mutex;

use super::msg::{get_arg_size, MsgArg, MAX_PARAMS_PER_PAGE};
use crate::error::{TeeError, TeeResult};
use crate::hal::{DomainId, Mfn, TeeHal};
use crate::mm::{lookup_guest_ram, HostPages, MappedPage, PAGE_SIZE};

/// A guest buffer registered with firmware under `cookie`.
pub struct ShmRegion<H: TeeHal> {
    domain: DomainId,
    cookie: u64,
    guest: MappedPage<H>,
    shadow: HostPages<H>,
    /// Param rewritten for firmware: (index, guest buf_ptr, host buf_ptr).
    translated: Option<(usize, u64, u64)>,
}

impl<H: TeeHal> ShmRegion<H> {
    /// Pin the guest page at `gaddr` and give it a shadow.
    pub fn new(hal: &Arc<H>, domain: DomainId, cookie: u64, gaddr: u64) -> TeeResult<Self> {
        if gaddr & (PAGE_SIZE as u64 - 1) != 0 {
            return Err(TeeError::Param("unaligned shared memory buffer"));
        }
        let mfn = lookup_guest_ram(&**hal, domain, gaddr)?;
        let guest = MappedPage::map(hal, mfn)?;
        let shadow = HostPages::alloc(hal, 0)?;
        Ok(Self {
            domain,
            cookie,
            guest,
            shadow,
            translated: None,
        })
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn guest_mfn(&self) -> Mfn {
        self.guest.mfn()
    }

    /// Address firmware uses for this buffer.
    pub fn shadow_maddr(&self) -> u64 {
        self.shadow.maddr()
    }

    /// Firmware's view of the buffer as an argument page.
    pub fn shadow_arg(&mut self) -> MsgArg<'_> {
        MsgArg::new(self.shadow.as_mut_slice())
    }

    /// Remember that param `idx` now points at host memory instead of the
    /// guest's `guest_ptr`.
    pub fn note_translated(&mut self, idx: usize, guest_ptr: u64, host_ptr: u64) {
        self.translated = Some((idx, guest_ptr, host_ptr));
    }

    /// Publish firmware's RPC command to the guest.
    ///
    /// Only the header and the params it declares are copied, and a host
    /// pointer left over from a translated reply is put back to the guest's
    /// value first.
    pub fn copy_to_guest(&mut self) {
        if let Some((idx, guest_ptr, host_ptr)) = self.translated.take() {
            let mut arg = self.shadow_arg();
            let mut param = arg.param(idx);
            if param.buf_ptr() == host_ptr {
                param.set_buf_ptr(guest_ptr);
                arg.set_param(idx, &param);
            }
        }
        let num_params = (self.shadow_arg().header().num_params as usize).min(MAX_PARAMS_PER_PAGE);
        let len = get_arg_size(num_params);
        self.guest.write(0, &self.shadow.as_slice()[..len]);
    }

    /// Take the guest's version of the buffer.
    pub fn copy_from_guest(&mut self) {
        self.guest.read(0, self.shadow.as_mut_slice());
    }
}

/// Shared handle to a registered region.
pub type ShmHandle<H> = Arc<Mutex<ShmRegion<H>>>;

/// All regions, keyed by (domain, cookie).
pub struct ShmRegistry<H: TeeHal> {
    regions: Mutex<BTreeMap<(DomainId, u64), ShmHandle<H>>>,
    max_per_domain: usize,
}

impl<H: TeeHal> ShmRegistry<H> {
    pub fn new(max_per_domain: usize) -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            max_per_domain,
        }
    }

    /// Register `region`. A cookie already in use by the same domain, or a
    /// domain at its limit, is refused and the region is dropped.
    pub fn insert(&self, region: ShmRegion<H>) -> TeeResult<ShmHandle<H>> {
        let key = (region.domain(), region.cookie());
        let mut regions = self.regions.lock();
        if regions.contains_key(&key) {
            warn!("{}: shm cookie {:#x} already registered", key.0, key.1);
            return Err(TeeError::Param("duplicate shared memory cookie"));
        }
        if Self::count_locked(&regions, key.0) >= self.max_per_domain {
            warn!("{}: too many shared memory buffers", key.0);
            return Err(TeeError::Resource("shared memory limit reached"));
        }
        let handle = Arc::new(Mutex::new(region));
        regions.insert(key, Arc::clone(&handle));
        debug!("{}: shm {:#x} registered", key.0, key.1);
        Ok(handle)
    }

    pub fn find(&self, domain: DomainId, cookie: u64) -> Option<ShmHandle<H>> {
        self.regions.lock().get(&(domain, cookie)).cloned()
    }

    /// Drop the region; returns whether one existed.
    pub fn release(&self, domain: DomainId, cookie: u64) -> bool {
        // Drop outside the lock: unmapping and freeing go through the host.
        let removed = self.regions.lock().remove(&(domain, cookie));
        if removed.is_some() {
            debug!("{}: shm {:#x} released", domain, cookie);
        }
        removed.is_some()
    }

    fn count_locked(regions: &BTreeMap<(DomainId, u64), ShmHandle<H>>, domain: DomainId) -> usize {
        regions.range((domain, 0)..=(domain, u64::MAX)).count()
    }

    pub fn count(&self, domain: DomainId) -> usize {
        Self::count_locked(&self.regions.lock(), domain)
    }

    /// Drop every region of `domain`, returning how many there were.
    pub fn release_domain(&self, domain: DomainId) -> usize {
        let mut regions = self.regions.lock();
        let keys: Vec<_> = regions
            .range((domain, 0)..=(domain, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        let removed: Vec<_> = keys.iter().filter_map(|k| regions.remove(k)).collect();
        drop(regions);
        removed.len()
    }

    pub fn release_all(&self) -> usize {
        let removed = core::mem::take(&mut *self.regions.lock());
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
