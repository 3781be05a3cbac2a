//! Fake host hypervisor for integration tests.
//!
//! Guest RAM is a set of page-aligned heap frames reachable through a
//! per-domain p2m table. Hypervisor pages come from the heap too, and their
//! "machine address" is simply their pointer, so a scripted firmware can
//! read what the mediator hands it. Every map and allocation is counted.

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tee_mediator::arch::GuestRegs;
use tee_mediator::hal::{DomainId, Gfn, Mfn, P2mEntry, P2mType, TeeHal};
use tee_mediator::smccc::{SmcArgs, SmcResult};
use tee_mediator::tee::optee::msg::*;
use tee_mediator::tee::optee::smc::*;

pub const PAGE: usize = 4096;

pub type Firmware = Box<dyn FnMut(&SmcArgs) -> SmcResult + Send>;
pub type Step = Box<dyn FnOnce(&SmcArgs) -> SmcResult + Send>;

/// Box a scripted firmware step.
pub fn step(f: impl FnOnce(&SmcArgs) -> SmcResult + Send + 'static) -> Step {
    Box::new(f)
}

pub fn ret(x0: u64) -> SmcResult {
    SmcResult { x0, ..SmcResult::default() }
}

/// Machine address of the argument buffer in a std call.
pub fn arg_maddr(args: &SmcArgs) -> u64 {
    (args.x1 << 32) | (args.x2 & 0xFFFF_FFFF)
}

fn page_layout(order: u32) -> Layout {
    Layout::from_size_align(PAGE << order, PAGE).unwrap()
}

pub struct FakeHost {
    /// mfn -> frame address
    frames: Mutex<BTreeMap<u64, usize>>,
    p2m: Mutex<BTreeMap<(DomainId, u64), P2mEntry>>,
    next_mfn: AtomicUsize,
    /// live hypervisor allocations: address -> order
    host_pages: Mutex<BTreeMap<usize, u32>>,
    pub maps: AtomicUsize,
    pub unmaps: AtomicUsize,
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
    /// Allocations left before alloc_host_pages starts failing.
    alloc_budget: Mutex<Option<usize>>,
    firmware: Mutex<Firmware>,
    smc_log: Mutex<Vec<SmcArgs>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(BTreeMap::new()),
            p2m: Mutex::new(BTreeMap::new()),
            next_mfn: AtomicUsize::new(0x10_000),
            host_pages: Mutex::new(BTreeMap::new()),
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            alloc_budget: Mutex::new(None),
            firmware: Mutex::new(Box::new(default_firmware) as Firmware),
            smc_log: Mutex::new(Vec::new()),
        })
    }

    /// Back `pages` guest pages at `gaddr` with fresh frames of `p2m_type`.
    pub fn add_pages(&self, domain: DomainId, gaddr: u64, pages: usize, p2m_type: P2mType) {
        for n in 0..pages {
            let mfn = self.next_mfn.fetch_add(1, Ordering::Relaxed) as u64;
            // SAFETY: non-zero size
            let frame = unsafe { alloc_zeroed(page_layout(0)) } as usize;
            self.frames.lock().unwrap().insert(mfn, frame);
            let gfn = Gfn::from_addr(gaddr).0 + n as u64;
            self.p2m
                .lock()
                .unwrap()
                .insert((domain, gfn), P2mEntry { mfn: Mfn(mfn), p2m_type });
        }
    }

    pub fn add_ram(&self, domain: DomainId, gaddr: u64, pages: usize) {
        self.add_pages(domain, gaddr, pages, P2mType::RamRw);
    }

    /// Drop the p2m entry (the frame stays allocated).
    pub fn unmap_gfn(&self, domain: DomainId, gaddr: u64) {
        self.p2m
            .lock()
            .unwrap()
            .remove(&(domain, Gfn::from_addr(gaddr).0));
    }

    fn frame_of(&self, domain: DomainId, gaddr: u64) -> usize {
        let entry = self.p2m.lock().unwrap()[&(domain, Gfn::from_addr(gaddr).0)];
        self.frames.lock().unwrap()[&entry.mfn.0]
    }

    pub fn mfn_of(&self, domain: DomainId, gaddr: u64) -> Mfn {
        self.p2m.lock().unwrap()[&(domain, Gfn::from_addr(gaddr).0)].mfn
    }

    /// Guest frame number currently backed by host address `maddr`.
    pub fn gfn_of_maddr(&self, domain: DomainId, maddr: u64) -> Option<u64> {
        let mfn = Mfn::from_addr(maddr);
        self.p2m
            .lock()
            .unwrap()
            .iter()
            .find(|((d, _), e)| *d == domain && e.mfn == mfn)
            .map(|((_, gfn), _)| *gfn)
    }

    pub fn write_guest(&self, domain: DomainId, gaddr: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let addr = gaddr + done as u64;
            let off = (addr as usize) % PAGE;
            let chunk = (PAGE - off).min(data.len() - done);
            let frame = self.frame_of(domain, addr);
            // SAFETY: frame is a live PAGE-sized allocation
            unsafe {
                std::ptr::copy_nonoverlapping(data[done..].as_ptr(), (frame + off) as *mut u8, chunk)
            };
            done += chunk;
        }
    }

    pub fn read_guest(&self, domain: DomainId, gaddr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut done = 0;
        while done < len {
            let addr = gaddr + done as u64;
            let off = (addr as usize) % PAGE;
            let chunk = (PAGE - off).min(len - done);
            let frame = self.frame_of(domain, addr);
            // SAFETY: frame is a live PAGE-sized allocation
            unsafe {
                std::ptr::copy_nonoverlapping((frame + off) as *const u8, out[done..].as_mut_ptr(), chunk)
            };
            done += chunk;
        }
        out
    }

    pub fn write_guest_u64(&self, domain: DomainId, gaddr: u64, value: u64) {
        self.write_guest(domain, gaddr, &value.to_le_bytes());
    }

    pub fn read_guest_u32(&self, domain: DomainId, gaddr: u64) -> u32 {
        u32::from_le_bytes(self.read_guest(domain, gaddr, 4).try_into().unwrap())
    }

    pub fn read_guest_u64(&self, domain: DomainId, gaddr: u64) -> u64 {
        u64::from_le_bytes(self.read_guest(domain, gaddr, 8).try_into().unwrap())
    }

    pub fn set_firmware(&self, firmware: impl FnMut(&SmcArgs) -> SmcResult + Send + 'static) {
        *self.firmware.lock().unwrap() = Box::new(firmware);
    }

    /// Answer the next calls with `steps`, in order, then fall back to
    /// [`default_firmware`].
    pub fn script(&self, steps: Vec<Step>) {
        let mut steps: std::collections::VecDeque<Step> = steps.into();
        self.set_firmware(move |args| match steps.pop_front() {
            Some(step) => step(args),
            None => default_firmware(args),
        });
    }

    pub fn smc_log(&self) -> Vec<SmcArgs> {
        self.smc_log.lock().unwrap().clone()
    }

    pub fn fail_allocs_after(&self, n: usize) {
        *self.alloc_budget.lock().unwrap() = Some(n);
    }

    pub fn live_maps(&self) -> usize {
        self.maps.load(Ordering::Relaxed) - self.unmaps.load(Ordering::Relaxed)
    }

    pub fn live_allocs(&self) -> usize {
        self.host_pages.lock().unwrap().len()
    }
}

impl Drop for FakeHost {
    fn drop(&mut self) {
        for (_, frame) in std::mem::take(&mut *self.frames.lock().unwrap()) {
            // SAFETY: allocated in add_pages with the same layout
            unsafe { dealloc(frame as *mut u8, page_layout(0)) };
        }
    }
}

impl TeeHal for FakeHost {
    fn p2m_lookup(&self, domain: DomainId, gfn: Gfn) -> Option<P2mEntry> {
        self.p2m.lock().unwrap().get(&(domain, gfn.0)).copied()
    }

    fn map_domain_page(&self, mfn: Mfn) -> Option<NonNull<u8>> {
        let frame = *self.frames.lock().unwrap().get(&mfn.0)?;
        self.maps.fetch_add(1, Ordering::Relaxed);
        NonNull::new(frame as *mut u8)
    }

    unsafe fn unmap_domain_page(&self, va: NonNull<u8>) {
        self.unmaps.fetch_add(1, Ordering::Relaxed);
        assert!(
            self.frames.lock().unwrap().values().any(|f| *f == va.as_ptr() as usize),
            "unmap of a page that is not guest RAM"
        );
    }

    fn alloc_host_pages(&self, order: u32) -> Option<NonNull<u8>> {
        if let Some(budget) = self.alloc_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        // SAFETY: non-zero size
        let va = unsafe { alloc_zeroed(page_layout(order)) };
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.host_pages.lock().unwrap().insert(va as usize, order);
        NonNull::new(va)
    }

    unsafe fn free_host_pages(&self, va: NonNull<u8>, order: u32) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        let recorded = self.host_pages.lock().unwrap().remove(&(va.as_ptr() as usize));
        assert_eq!(recorded, Some(order), "free of unknown host pages");
        dealloc(va.as_ptr(), page_layout(order));
    }

    fn virt_to_maddr(&self, va: NonNull<u8>) -> u64 {
        va.as_ptr() as u64
    }

    fn call_smc(&self, args: &SmcArgs) -> SmcResult {
        self.smc_log.lock().unwrap().push(*args);
        let mut firmware = self.firmware.lock().unwrap();
        (*firmware)(args)
    }
}

/// OP-TEE's answers to the queries the mediator issues on its own.
pub fn default_firmware(args: &SmcArgs) -> SmcResult {
    match args.x0 as u32 {
        OPTEE_SMC_CALLS_UID => SmcResult {
            x0: 0x384f_b3e0,
            x1: 0xe7f8_11e3,
            x2: 0xaf63_0002,
            x3: 0xa5d5_c51b,
        },
        OPTEE_SMC_CALLS_REVISION => SmcResult {
            x0: 2,
            x1: 0,
            ..SmcResult::default()
        },
        OPTEE_SMC_VM_CREATED | OPTEE_SMC_VM_DESTROYED => SmcResult::default(),
        _ => SmcResult {
            x0: OPTEE_SMC_RETURN_UNKNOWN_FUNCTION as u64,
            ..SmcResult::default()
        },
    }
}

/// Read a u64 from hypervisor memory at machine address `maddr`.
pub fn host_read_u64(maddr: u64) -> u64 {
    // SAFETY: FakeHost machine addresses are live heap pointers
    unsafe { std::ptr::read_unaligned(maddr as *const u64) }
}

pub fn host_read(maddr: u64, len: usize) -> Vec<u8> {
    // SAFETY: as above
    unsafe { std::slice::from_raw_parts(maddr as *const u8, len).to_vec() }
}

pub fn host_write(maddr: u64, data: &[u8]) {
    // SAFETY: as above
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), maddr as *mut u8, data.len()) };
}

/// Builder for argument buffers as a guest driver lays them out.
pub struct ArgBuilder {
    pub header: OpteeMsgArgHeader,
    pub params: Vec<OpteeMsgParam>,
}

impl ArgBuilder {
    pub fn new(cmd: u32) -> Self {
        Self {
            header: OpteeMsgArgHeader {
                cmd,
                func: 0,
                session: 0,
                cancel_id: 0,
                pad: 0,
                ret: 0,
                ret_origin: 0,
                num_params: 0,
            },
            params: Vec::new(),
        }
    }

    pub fn param(mut self, attr: u64, u: [u64; 3]) -> Self {
        self.params.push(OpteeMsgParam { attr, u });
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut page = vec![0u8; PAGE];
        let mut hdr = self.header;
        hdr.num_params = self.params.len() as u32;
        let mut arg = MsgArg::new(&mut page);
        arg.set_header(&hdr);
        for (idx, p) in self.params.iter().enumerate() {
            arg.set_param(idx, p);
        }
        page
    }
}

/// Write a page list for `data_pages` at `list_gaddr` (chained into
/// consecutive list pages as needed).
pub fn write_page_list(host: &FakeHost, domain: DomainId, list_gaddr: u64, data_pages: &[u64]) {
    for (block, chunk) in data_pages.chunks(PAGELIST_ENTRIES_PER_PAGE).enumerate() {
        let base = list_gaddr + (block * PAGE) as u64;
        for (idx, gaddr) in chunk.iter().enumerate() {
            host.write_guest_u64(domain, base + (idx * 8) as u64, *gaddr);
        }
        let next = if (block + 1) * PAGELIST_ENTRIES_PER_PAGE < data_pages.len() {
            base + PAGE as u64
        } else {
            0
        };
        host.write_guest_u64(domain, base + PAGELIST_NEXT_OFFSET as u64, next);
    }
}

/// Registers for a `CALL_WITH_ARG` at guest address `gaddr`.
pub fn call_with_arg(gaddr: u64) -> GuestRegs {
    GuestRegs {
        x0: OPTEE_SMC_CALL_WITH_ARG as u64,
        x1: gaddr >> 32,
        x2: gaddr & 0xFFFF_FFFF,
        ..GuestRegs::default()
    }
}

/// Registers for a `RETURN_FROM_RPC` on `thread_id`.
pub fn return_from_rpc(thread_id: u32) -> GuestRegs {
    GuestRegs {
        x0: OPTEE_SMC_CALL_RETURN_FROM_RPC as u64,
        x3: thread_id as u64,
        ..GuestRegs::default()
    }
}

pub fn rpc_return(func: u32) -> u64 {
    (OPTEE_SMC_RETURN_RPC_PREFIX | func) as u64
}
