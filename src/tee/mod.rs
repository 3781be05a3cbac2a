//! TEE mediator registry
//!
//! At boot the Secure OS is identified by the UID it returns for the
//! Trusted OS `CALL_UID` query, and the mediator registered for that UID
//! is probed. From then on every trapped Trusted OS SMC of every domain is
//! routed through [`Tee::handle_call`].

#[cfg(feature = "optee")]
pub mod optee;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{error, info, warn};
use spin::Once;

use crate::arch::GuestRegs;
use crate::config::MediatorConfig;
use crate::error::{TeeError, TeeResult};
use crate::hal::{DomainId, TeeHal};
use crate::smccc::{is_unknown_function, SmcArgs, Uuid, TRUSTED_OS_CALL_UID};

/// Operations every mediator backend provides.
pub trait TeeMediator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle a trapped SMC. Returns false if the call was not handled, in
    /// which case the caller reports an unknown function to the guest.
    fn handle_call(&self, domain: DomainId, regs: &mut GuestRegs) -> bool;

    fn domain_create(&self, domain: DomainId) -> TeeResult<()>;

    /// Tell firmware the domain is gone and drop everything held for it.
    fn domain_destroy(&self, domain: DomainId);

    fn remove(&self);
}

/// Builds a mediator once its Secure OS has been identified.
pub type ProbeFn<H> = fn(Arc<H>, &MediatorConfig) -> TeeResult<Box<dyn TeeMediator>>;

/// Static description of a mediator backend.
pub struct MediatorDesc<H: TeeHal> {
    pub name: &'static str,
    /// UID the Secure OS reports for `CALL_UID`.
    pub uid: Uuid,
    pub probe: ProbeFn<H>,
}

/// Outcome of [`Tee::init`].
pub enum ActiveMediator {
    None,
    Active(Box<dyn TeeMediator>),
}

pub struct Tee<H: TeeHal> {
    hal: Arc<H>,
    config: MediatorConfig,
    descs: Vec<MediatorDesc<H>>,
    active: Once<ActiveMediator>,
}

impl<H: TeeHal> Tee<H> {
    /// Registry without any backends.
    pub fn new(hal: Arc<H>, config: MediatorConfig) -> Self {
        Self {
            hal,
            config,
            descs: Vec::new(),
            active: Once::new(),
        }
    }

    /// Registry with every backend compiled into the crate.
    pub fn with_builtin_mediators(hal: Arc<H>, config: MediatorConfig) -> Self {
        #[allow(unused_mut)]
        let mut tee = Self::new(hal, config);
        #[cfg(feature = "optee")]
        tee.descs.push(optee::descriptor());
        tee
    }

    /// Add a backend. Only allowed before [`Tee::init`].
    pub fn register(&mut self, desc: MediatorDesc<H>) -> TeeResult<()> {
        if self.active.is_completed() {
            return Err(TeeError::Protocol("mediator registered after init"));
        }
        if self.descs.iter().any(|d| d.uid == desc.uid) {
            return Err(TeeError::Param("mediator UID already registered"));
        }
        self.descs.push(desc);
        Ok(())
    }

    /// Identify the Secure OS and bring up its mediator.
    ///
    /// Never fails: without a usable mediator every call is simply
    /// unhandled. Returns whether a mediator is active.
    pub fn init(&self) -> bool {
        let active = self.active.call_once(|| self.select());
        matches!(active, ActiveMediator::Active(_))
    }

    fn select(&self) -> ActiveMediator {
        if !self.config.enabled {
            info!("TEE: mediator disabled by configuration");
            return ActiveMediator::None;
        }

        let res = self.hal.call_smc(&SmcArgs::new(TRUSTED_OS_CALL_UID));
        if is_unknown_function(res.x0) {
            info!("TEE: no Secure OS found");
            return ActiveMediator::None;
        }

        let uid = Uuid::from_smc_result(&res);
        info!("TEE UID: {}", uid);

        let Some(desc) = self.descs.iter().find(|d| d.uid == uid) else {
            warn!("TEE: no mediator for this Secure OS");
            return ActiveMediator::None;
        };

        info!("Using TEE mediator for {}", desc.name);
        match (desc.probe)(Arc::clone(&self.hal), &self.config) {
            Ok(mediator) => ActiveMediator::Active(mediator),
            Err(e) => {
                error!("TEE mediator failed to initialize: {}", e);
                ActiveMediator::None
            }
        }
    }

    fn mediator(&self) -> Option<&dyn TeeMediator> {
        match self.active.get()? {
            ActiveMediator::Active(m) => Some(&**m),
            ActiveMediator::None => None,
        }
    }

    /// Name of the active backend, if any.
    pub fn active_mediator(&self) -> Option<&'static str> {
        self.mediator().map(|m| m.name())
    }

    pub fn handle_call(&self, domain: DomainId, regs: &mut GuestRegs) -> bool {
        self.mediator()
            .is_some_and(|m| m.handle_call(domain, regs))
    }

    pub fn domain_create(&self, domain: DomainId) -> TeeResult<()> {
        match self.mediator() {
            Some(m) => m.domain_create(domain),
            None => Ok(()),
        }
    }

    pub fn domain_destroy(&self, domain: DomainId) {
        if let Some(m) = self.mediator() {
            m.domain_destroy(domain);
        }
    }

    pub fn remove(&self) {
        if let Some(m) = self.mediator() {
            m.remove();
        }
    }
}
