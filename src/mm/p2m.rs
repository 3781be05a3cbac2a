//! Guest-physical to host frame translation.

use log::warn;

use crate::arch::aarch64::defs::PAGE_SHIFT;
use crate::error::{TeeError, TeeResult};
use crate::hal::{DomainId, Gfn, Mfn, P2mType, TeeHal};

/// Resolve `gaddr` in `domain` to the host frame backing it.
///
/// Only ordinary read/write RAM is accepted. Read-only RAM, MMIO and holes
/// all fail, so a guest can never hand firmware a page it could not write
/// itself.
pub fn lookup_guest_ram<H: TeeHal + ?Sized>(
    hal: &H,
    domain: DomainId,
    gaddr: u64,
) -> TeeResult<Mfn> {
    match hal.p2m_lookup(domain, Gfn::from_addr(gaddr)) {
        Some(entry) if entry.p2m_type == P2mType::RamRw => Ok(entry.mfn),
        other => {
            warn!(
                "{}: tries to use invalid gfn {:#x} ({:?})",
                domain,
                gaddr >> PAGE_SHIFT,
                other.map(|e| e.p2m_type)
            );
            Err(TeeError::Translation(gaddr))
        }
    }
}
