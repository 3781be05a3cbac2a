//! OP-TEE mediator
//!
//! Lets several domains share one OP-TEE instance. Fast calls are either
//! answered here or forwarded with the caller's client id in x7. Standard
//! calls carry guest-physical addresses, so they go through the
//! translation in [`std_call`] before firmware sees them.

pub mod call;
pub mod msg;
pub mod noncontig;
pub mod shm;
pub mod smc;
mod std_call;

use alloc::boxed::Box;
use alloc::sync::Arc;

use log::{info, warn};

use self::call::CallContextStore;
use self::shm::ShmRegistry;
use self::smc::*;
use super::{MediatorDesc, TeeMediator};
use crate::arch::GuestRegs;
use crate::config::MediatorConfig;
use crate::error::{TeeError, TeeResult};
use crate::hal::{DomainId, TeeHal};
use crate::smccc::{SmcArgs, SmcResult};

pub const OPTEE_MEDIATOR_NAME: &str = "OP-TEE";

/// Registry entry for the built-in OP-TEE mediator.
pub fn descriptor<H: TeeHal>() -> MediatorDesc<H> {
    MediatorDesc {
        name: OPTEE_MEDIATOR_NAME,
        uid: OPTEE_MSG_UID,
        probe: OpteeMediator::<H>::probe,
    }
}

/// SMC return code reported to the guest for a failed request, or None if
/// the request should be reported as unhandled.
pub fn error_to_smc_return(err: &TeeError) -> Option<u32> {
    match err {
        TeeError::Param(_) | TeeError::Translation(_) => Some(OPTEE_SMC_RETURN_EBADADDR),
        TeeError::Resource(_) => Some(OPTEE_SMC_RETURN_ENOMEM),
        TeeError::Protocol(_) | TeeError::Firmware(_) => None,
    }
}

pub struct OpteeMediator<H: TeeHal> {
    hal: Arc<H>,
    config: MediatorConfig,
    calls: CallContextStore<H>,
    shm: ShmRegistry<H>,
}

impl<H: TeeHal> OpteeMediator<H> {
    pub fn new(hal: Arc<H>, config: &MediatorConfig) -> Self {
        Self {
            hal,
            config: config.clone(),
            calls: CallContextStore::new(),
            shm: ShmRegistry::new(config.max_shm_per_domain),
        }
    }

    /// Check the message protocol revision, then build the mediator.
    pub fn probe(hal: Arc<H>, config: &MediatorConfig) -> TeeResult<Box<dyn TeeMediator>> {
        let res = hal.call_smc(&SmcArgs::new(OPTEE_SMC_CALLS_REVISION));
        if res.x0 != OPTEE_MSG_REVISION_MAJOR as u64 || (res.x1 as u32) < OPTEE_MSG_REVISION_MINOR {
            warn!("OP-TEE: unsupported message revision {}.{}", res.x0, res.x1);
            return Err(TeeError::Firmware("unsupported OP-TEE message revision"));
        }
        info!("OP-TEE: message revision {}.{}", res.x0, res.x1);
        Ok(Box::new(Self::new(hal, config)))
    }

    /// Contexts parked waiting for RPC service.
    pub fn calls(&self) -> &CallContextStore<H> {
        &self.calls
    }

    /// RPC-allocated shared memory.
    pub fn shm(&self) -> &ShmRegistry<H> {
        &self.shm
    }

    /// Forward a fast call unchanged apart from the client id.
    fn forward_call(&self, domain: DomainId, regs: &mut GuestRegs) -> SmcResult {
        let res = self.hal.call_smc(&regs.to_smc_args(domain.client_id()));
        regs.set_result(&res);
        res
    }

    fn handle_exchange_capabilities(&self, domain: DomainId, regs: &mut GuestRegs) {
        let mut args = regs.to_smc_args(domain.client_id());
        args.x1 = NsecCaps::from_bits_truncate(regs.x1 as u32).bits() as u64;
        let res = self.hal.call_smc(&args);
        regs.set_result(&res);

        // Return error back to the guest
        if res.x0 != OPTEE_SMC_RETURN_OK as u64 {
            return;
        }

        // Dynamic SHM is the only sharing model the mediator can translate
        let caps = SecCaps::from_bits_truncate(res.x1 as u32);
        if !caps.contains(SecCaps::DYNAMIC_SHM) {
            warn!("{}: OP-TEE lacks dynamic shared memory", domain);
            regs.set_return(OPTEE_SMC_RETURN_ENOTAVAIL);
            return;
        }
        regs.x1 = SecCaps::DYNAMIC_SHM.bits() as u64;
    }

    /// Firmware gives back one cached buffer per call; it is freed here too.
    fn handle_disable_shm_cache(&self, domain: DomainId, regs: &mut GuestRegs) {
        let res = self.forward_call(domain, regs);
        if res.x0 == OPTEE_SMC_RETURN_OK as u64 {
            let cookie = res.pair(1, 2);
            if !self.shm.release(domain, cookie) {
                warn!("{}: firmware uncached unknown shm {:#x}", domain, cookie);
            }
        }
    }

    /// Report the outcome of a standard call to the guest.
    fn complete(&self, domain: DomainId, regs: &mut GuestRegs, result: TeeResult<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: OP-TEE call failed: {}", domain, e);
                match error_to_smc_return(&e) {
                    Some(ret) => {
                        regs.set_return(ret);
                        true
                    }
                    None => false,
                }
            }
        }
    }
}

impl<H: TeeHal> TeeMediator for OpteeMediator<H> {
    fn name(&self) -> &'static str {
        OPTEE_MEDIATOR_NAME
    }

    fn handle_call(&self, domain: DomainId, regs: &mut GuestRegs) -> bool {
        match regs.function_id() {
            OPTEE_SMC_CALLS_COUNT
            | OPTEE_SMC_CALLS_UID
            | OPTEE_SMC_CALLS_REVISION
            | OPTEE_SMC_GET_OS_UUID
            | OPTEE_SMC_GET_OS_REVISION => {
                self.forward_call(domain, regs);
                true
            }
            OPTEE_SMC_GET_SHM_CONFIG | OPTEE_SMC_ENABLE_SHM_CACHE => {
                regs.set_return(OPTEE_SMC_RETURN_ENOTAVAIL);
                true
            }
            OPTEE_SMC_DISABLE_SHM_CACHE => {
                self.handle_disable_shm_cache(domain, regs);
                true
            }
            OPTEE_SMC_EXCHANGE_CAPABILITIES => {
                self.handle_exchange_capabilities(domain, regs);
                true
            }
            OPTEE_SMC_CALL_WITH_ARG => {
                let result = self.handle_std_call(domain, regs);
                self.complete(domain, regs, result)
            }
            OPTEE_SMC_CALL_RETURN_FROM_RPC => {
                let result = self.handle_rpc(domain, regs);
                self.complete(domain, regs, result)
            }
            _ => false,
        }
    }

    fn domain_create(&self, domain: DomainId) -> TeeResult<()> {
        let mut args = SmcArgs::new(OPTEE_SMC_VM_CREATED);
        args.x1 = domain.client_id() as u64;
        let res = self.hal.call_smc(&args);
        if res.x0 != OPTEE_SMC_RETURN_OK as u64 {
            warn!("{}: OP-TEE doesn't want to support domain: {:#x}", domain, res.x0);
            return Err(TeeError::Firmware("VM_CREATED refused"));
        }
        Ok(())
    }

    fn domain_destroy(&self, domain: DomainId) {
        let mut args = SmcArgs::new(OPTEE_SMC_VM_DESTROYED);
        args.x1 = domain.client_id() as u64;
        let res = self.hal.call_smc(&args);
        if res.x0 != OPTEE_SMC_RETURN_OK as u64 {
            warn!("{}: VM_DESTROYED returned {:#x}", domain, res.x0);
        }

        let calls = self.calls.release_domain(domain);
        let regions = self.shm.release_domain(domain);
        if calls != 0 || regions != 0 {
            info!("{}: released {} calls and {} shm buffers", domain, calls, regions);
        }
    }

    fn remove(&self) {
        let calls = self.calls.release_all();
        let regions = self.shm.release_all();
        info!("OP-TEE: mediator removed ({} calls, {} shm buffers dropped)", calls, regions);
    }
}
