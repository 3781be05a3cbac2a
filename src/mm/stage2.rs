//! Read-only Stage-2 page table walker.
//!
//! Resolves an IPA to the host frame and memory kind recorded in a domain's
//! Stage-2 tables. The tables are owned by whoever built the domain's VTTBR;
//! the walker only reads them through their (identity-mapped) physical
//! addresses.

use crate::arch::aarch64::defs::*;
use crate::hal::{Mfn, P2mEntry, P2mType};

/// Lightweight Stage-2 page table walker.
///
/// Does NOT own the page tables.
pub struct Stage2Walker {
    l0_table: u64,
}

/// Leaf descriptor found by a walk, with the size of the region it maps.
struct Leaf {
    pte: u64,
    block_mask: u64,
}

impl Stage2Walker {
    /// Create from an L0 table address.
    ///
    /// # Safety
    /// `l0_table` must be 0 or the identity-mapped address of a live Stage-2
    /// L0 table whose next-level tables are identity-mapped as well.
    pub unsafe fn new(l0_table: u64) -> Self {
        Self {
            l0_table: l0_table & PTE_ADDR_MASK,
        }
    }

    /// Check if a Stage-2 page table is configured.
    pub fn has_stage2(&self) -> bool {
        self.l0_table != 0
    }

    /// Translate `ipa` and classify the memory it lands in.
    ///
    /// Returns None for unmapped IPAs.
    pub fn lookup(&self, ipa: u64) -> Option<P2mEntry> {
        let leaf = self.walk_to_leaf(ipa)?;
        let pa = (leaf.pte & PTE_ADDR_MASK & !leaf.block_mask) | (ipa & leaf.block_mask);
        Some(P2mEntry {
            mfn: Mfn::from_addr(pa),
            p2m_type: Self::classify(leaf.pte),
        })
    }

    /// Derive the memory kind from MemAttr[5:2] and S2AP[7:6].
    fn classify(pte: u64) -> P2mType {
        // Device memory types all have MemAttr[3:2] == 0b00
        if pte & (0b1100 << S2_MEMATTR_SHIFT) == 0 {
            return P2mType::Mmio;
        }
        match pte & S2AP_MASK {
            S2AP_RW => P2mType::RamRw,
            S2AP_RO => P2mType::RamRo,
            _ => P2mType::Other,
        }
    }

    fn read_entry(table: u64, index: u64) -> u64 {
        // SAFETY: `new` guarantees every table reached from L0 is live and
        // identity-mapped; index is masked to 0..512.
        unsafe { core::ptr::read_volatile((table as *const u64).add(index as usize)) }
    }

    /// Walk page table to the leaf descriptor for a given IPA.
    fn walk_to_leaf(&self, ipa: u64) -> Option<Leaf> {
        if !self.has_stage2() {
            return None;
        }

        // L0: table descriptors only
        let l0_entry = Self::read_entry(self.l0_table, (ipa >> 39) & PT_INDEX_MASK);
        if l0_entry & (PTE_VALID | PTE_TABLE) != (PTE_VALID | PTE_TABLE) {
            return None;
        }

        // L1
        let l1_table = l0_entry & PTE_ADDR_MASK;
        let l1_entry = Self::read_entry(l1_table, (ipa >> 30) & PT_INDEX_MASK);
        if l1_entry & PTE_VALID == 0 {
            return None;
        }
        // L1 block (1GB)
        if l1_entry & PTE_TABLE == 0 {
            return Some(Leaf {
                pte: l1_entry,
                block_mask: BLOCK_MASK_1GB,
            });
        }

        // L2
        let l2_table = l1_entry & PTE_ADDR_MASK;
        let l2_entry = Self::read_entry(l2_table, (ipa >> 21) & PT_INDEX_MASK);
        if l2_entry & PTE_VALID == 0 {
            return None;
        }
        // L2 block (2MB)
        if l2_entry & PTE_TABLE == 0 {
            return Some(Leaf {
                pte: l2_entry,
                block_mask: BLOCK_MASK_2MB,
            });
        }

        // L3 (4KB page); bit[1] must be set for a page descriptor
        let l3_table = l2_entry & PTE_ADDR_MASK;
        let l3_entry = Self::read_entry(l3_table, (ipa >> 12) & PT_INDEX_MASK);
        if l3_entry & (PTE_VALID | PTE_TABLE) != (PTE_VALID | PTE_TABLE) {
            return None;
        }
        Some(Leaf {
            pte: l3_entry,
            block_mask: PAGE_MASK_4KB,
        })
    }
}
