//! Non-contiguous buffer translation.
//!
//! A guest describes a TMEM buffer with `OPTEE_MSG_ATTR_NONCONTIG` as a chain
//! of page-list blocks, each holding 511 guest addresses and a link to the
//! next block. `buf_ptr` is the guest address of the first block with the
//! data offset in its low 12 bits. Firmware needs the same chain with host
//! addresses, built in hypervisor memory.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};
use zerocopy::FromBytes;

use super::msg::{OpteeMsgParam, PageListBlock, PAGELIST_ENTRIES_PER_PAGE, PAGELIST_NEXT_OFFSET};
use super::msg::pagelist_entry_offset;
use crate::arch::aarch64::defs::PAGE_MASK_4KB;
use crate::error::{TeeError, TeeResult};
use crate::hal::{DomainId, Mfn, TeeHal};
use crate::mm::{get_order_from_bytes, lookup_guest_ram, HostPages, MappedPage, PAGE_SIZE};

/// Lazily walks a guest page-list chain, yielding the host frame behind
/// each data page.
///
/// Only one block is mapped at a time. The link to the next block is read
/// only once more entries are actually needed. The first invalid address
/// ends the walk with an error.
pub struct GuestPageList<'a, H: TeeHal> {
    hal: &'a Arc<H>,
    domain: DomainId,
    remaining: usize,
    next_block: u64,
    block: Option<MappedPage<H>>,
    idx: usize,
}

impl<'a, H: TeeHal> GuestPageList<'a, H> {
    /// Walk `num_pages` entries of the chain starting at guest address
    /// `first_block`.
    pub fn new(hal: &'a Arc<H>, domain: DomainId, first_block: u64, num_pages: usize) -> Self {
        Self {
            hal,
            domain,
            remaining: num_pages,
            next_block: first_block & !PAGE_MASK_4KB,
            block: None,
            idx: 0,
        }
    }

    fn advance_block(&mut self) -> TeeResult<()> {
        if let Some(block) = self.block.take() {
            self.next_block = block.read_u64(PAGELIST_NEXT_OFFSET) & !PAGE_MASK_4KB;
        }
        let mfn = lookup_guest_ram(&**self.hal, self.domain, self.next_block)?;
        self.block = Some(MappedPage::map(self.hal, mfn)?);
        self.idx = 0;
        Ok(())
    }

    fn next_entry(&mut self) -> TeeResult<Mfn> {
        if self.block.is_none() || self.idx == PAGELIST_ENTRIES_PER_PAGE {
            self.advance_block()?;
        }
        let block = self
            .block
            .as_ref()
            .ok_or(TeeError::Protocol("page list block not mapped"))?;
        let gaddr = block.read_u64(pagelist_entry_offset(self.idx));
        self.idx += 1;
        lookup_guest_ram(&**self.hal, self.domain, gaddr)
    }
}

impl<H: TeeHal> Iterator for GuestPageList<'_, H> {
    type Item = TeeResult<Mfn>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let entry = self.next_entry();
        if entry.is_err() {
            self.remaining = 0;
            self.block = None;
        } else {
            self.remaining -= 1;
        }
        Some(entry)
    }
}

/// Hypervisor-owned copy of a page-list chain holding host addresses.
pub struct HostPageList<H: TeeHal> {
    pages: HostPages<H>,
    num_pages: usize,
    page_offset: u64,
}

impl<H: TeeHal> HostPageList<H> {
    /// Number of data pages described.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Number of page-list blocks in the chain.
    pub fn num_blocks(&self) -> usize {
        self.num_pages.div_ceil(PAGELIST_ENTRIES_PER_PAGE).max(1)
    }

    /// What firmware gets in `buf_ptr`.
    pub fn buf_ptr(&self) -> u64 {
        self.pages.maddr() | self.page_offset
    }

    /// Host addresses in chain order.
    pub fn entries(&self) -> impl Iterator<Item = u64> + '_ {
        let blocks = <[PageListBlock]>::ref_from_bytes(self.pages.as_slice()).ok();
        (0..self.num_pages).filter_map(move |k| {
            let blocks = blocks?;
            Some(blocks[k / PAGELIST_ENTRIES_PER_PAGE].pages_list[k % PAGELIST_ENTRIES_PER_PAGE])
        })
    }

    /// Machine address stored in the link slot of block `index`.
    pub fn next_link(&self, index: usize) -> Option<u64> {
        let blocks = <[PageListBlock]>::ref_from_bytes(self.pages.as_slice()).ok()?;
        blocks.get(index).map(|b| b.next_page_data)
    }
}

/// Translate the non-contiguous TMEM `param` of `domain` in place.
///
/// On success `param`'s `buf_ptr` points at the returned host chain, which
/// must outlive the firmware call. On failure nothing stays mapped or
/// allocated and `param` is untouched.
pub fn translate_noncontig<H: TeeHal>(
    hal: &Arc<H>,
    domain: DomainId,
    param: &mut OpteeMsgParam,
    max_pages: usize,
) -> TeeResult<HostPageList<H>> {
    let buf_ptr = param.buf_ptr();
    let page_offset = buf_ptr & PAGE_MASK_4KB;
    let size = param.size();

    let num_pages = size
        .checked_add(page_offset)
        .map(|bytes| bytes.div_ceil(PAGE_SIZE as u64))
        .filter(|&n| n <= max_pages as u64)
        .ok_or(TeeError::Param("non-contiguous buffer too large"))? as usize;

    let num_blocks = num_pages.div_ceil(PAGELIST_ENTRIES_PER_PAGE).max(1);
    let order = get_order_from_bytes(num_blocks * PAGE_SIZE);
    let mut pages = HostPages::alloc(hal, order)?;

    let links: Vec<u64> = (1..num_blocks).map(|b| pages.page_maddr(b)).collect();
    {
        let blocks = <[PageListBlock]>::mut_from_bytes(pages.as_mut_slice())
            .map_err(|_| TeeError::Resource("misaligned page list allocation"))?;

        for (b, link) in links.iter().enumerate() {
            blocks[b].next_page_data = *link;
        }

        for (k, entry) in GuestPageList::new(hal, domain, buf_ptr, num_pages).enumerate() {
            let mfn = entry.map_err(|e| {
                warn!("{}: bad page list entry {} of {}", domain, k, num_pages);
                e
            })?;
            blocks[k / PAGELIST_ENTRIES_PER_PAGE].pages_list[k % PAGELIST_ENTRIES_PER_PAGE] =
                mfn.to_addr();
        }
    }

    let list = HostPageList {
        pages,
        num_pages,
        page_offset,
    };
    param.set_buf_ptr(list.buf_ptr());
    debug!(
        "{}: translated {} page buffer {:#x} -> {:#x}",
        domain,
        num_pages,
        buf_ptr,
        list.buf_ptr()
    );
    Ok(list)
}
