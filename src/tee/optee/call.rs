//! Standard call contexts.
//!
//! A `CALL_WITH_ARG` may bounce back and forth between firmware and guest
//! any number of times through RPCs. Everything the mediator built for the
//! call lives in a [`StdCallCtx`]: while the guest services an RPC the
//! context is parked in the [`CallContextStore`] under the OP-TEE thread id
//! firmware assigned, and it is taken out again when the guest resumes.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::{debug, error};
use spin::Mutex;

use super::noncontig::HostPageList;
use crate::error::{TeeError, TeeResult};
use crate::hal::{DomainId, TeeHal};
use crate::mm::HostPages;

/// Page-list parameters one call may carry.
pub const MAX_PARAM_PAGE_LISTS: usize = 7;

/// Progress of a standard call through the mediator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    New,
    ArgCopied,
    ParamsTranslated,
    Forwarded,
    RpcPending,
    RpcHandled,
    Done,
    Failed,
}

/// RPC request firmware returned, with the a1/a2 payload it supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRpc {
    pub func: u32,
    pub a1: u64,
    pub a2: u64,
}

impl PendingRpc {
    /// a1:a2 as a 64-bit value (size for ALLOC, cookie for FREE and CMD).
    pub fn payload(&self) -> u64 {
        ((self.a1 & 0xFFFF_FFFF) << 32) | (self.a2 & 0xFFFF_FFFF)
    }
}

/// One in-flight standard call.
pub struct StdCallCtx<H: TeeHal> {
    domain: DomainId,
    pub thread_id: Option<u32>,
    pub rpc: Option<PendingRpc>,
    pub state: CallState,
    /// Guest-physical address of the guest's argument page.
    pub guest_arg: u64,
    /// Private copy of the argument buffer handed to firmware.
    pub arg: HostPages<H>,
    pub page_lists: [Option<HostPageList<H>>; MAX_PARAM_PAGE_LISTS],
    /// Buffer translated for the last RPC `SHM_ALLOC`.
    pub rpc_page_list: Option<HostPageList<H>>,
}

impl<H: TeeHal> StdCallCtx<H> {
    pub fn new(domain: DomainId, guest_arg: u64, arg: HostPages<H>) -> Self {
        Self {
            domain,
            thread_id: None,
            rpc: None,
            state: CallState::New,
            guest_arg,
            arg,
            page_lists: core::array::from_fn(|_| None),
            rpc_page_list: None,
        }
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// Keep `list` alive for the duration of the call.
    pub fn push_page_list(&mut self, list: HostPageList<H>) -> TeeResult<()> {
        let slot = self
            .page_lists
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(TeeError::Param("too many page list parameters"))?;
        *slot = Some(list);
        Ok(())
    }

    pub fn page_list_count(&self) -> usize {
        self.page_lists.iter().filter(|l| l.is_some()).count()
    }
}

impl<H: TeeHal> Drop for StdCallCtx<H> {
    fn drop(&mut self) {
        debug!(
            "{}: call context thread {:?} dropped in state {:?}",
            self.domain, self.thread_id, self.state
        );
    }
}

/// Contexts waiting for the guest to service an RPC.
pub struct CallContextStore<H: TeeHal> {
    parked: Mutex<BTreeMap<(DomainId, u32), StdCallCtx<H>>>,
}

impl<H: TeeHal> Default for CallContextStore<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: TeeHal> CallContextStore<H> {
    pub fn new() -> Self {
        Self {
            parked: Mutex::new(BTreeMap::new()),
        }
    }

    /// Park `ctx` under its thread id.
    ///
    /// Firmware never hands out a thread id that is still in use, so an
    /// existing entry is stale and is released.
    pub fn park(&self, ctx: StdCallCtx<H>) -> TeeResult<()> {
        let thread_id = ctx
            .thread_id
            .ok_or(TeeError::Protocol("parking a call without a thread id"))?;
        let key = (ctx.domain, thread_id);
        let stale = self.parked.lock().insert(key, ctx);
        if stale.is_some() {
            error!("{}: replacing stale call context for thread {}", key.0, thread_id);
        }
        Ok(())
    }

    /// Remove the context `domain` parked under `thread_id`.
    pub fn take(&self, domain: DomainId, thread_id: u32) -> Option<StdCallCtx<H>> {
        self.parked.lock().remove(&(domain, thread_id))
    }

    pub fn count(&self, domain: DomainId) -> usize {
        self.parked
            .lock()
            .range((domain, 0)..=(domain, u32::MAX))
            .count()
    }

    /// Drop every context of `domain`, returning how many there were.
    pub fn release_domain(&self, domain: DomainId) -> usize {
        let mut parked = self.parked.lock();
        let keys: Vec<_> = parked
            .range((domain, 0)..=(domain, u32::MAX))
            .map(|(k, _)| *k)
            .collect();
        let removed: Vec<_> = keys.iter().filter_map(|k| parked.remove(k)).collect();
        drop(parked);
        removed.len()
    }

    pub fn release_all(&self) -> usize {
        let removed = core::mem::take(&mut *self.parked.lock());
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.parked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
