mod common;

use std::sync::Arc;

use common::*;
use tee_mediator::arch::GuestRegs;
use tee_mediator::config::MediatorConfig;
use tee_mediator::error::{TeeError, TeeResult};
use tee_mediator::hal::DomainId;
use tee_mediator::smccc::{SmcResult, Uuid, TRUSTED_OS_CALL_UID};
use tee_mediator::tee::optee::smc::*;
use tee_mediator::tee::optee::OPTEE_MEDIATOR_NAME;
use tee_mediator::tee::{MediatorDesc, Tee, TeeMediator};

const D: DomainId = DomainId(0);
const ECHO_WORDS: [u32; 4] = [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444];

/// Answers every call with 0x42.
struct Echo;

impl TeeMediator for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn handle_call(&self, _domain: DomainId, regs: &mut GuestRegs) -> bool {
        regs.x0 = 0x42;
        true
    }

    fn domain_create(&self, _domain: DomainId) -> TeeResult<()> {
        Ok(())
    }

    fn domain_destroy(&self, _domain: DomainId) {}

    fn remove(&self) {}
}

fn echo_probe(_hal: Arc<FakeHost>, _config: &MediatorConfig) -> TeeResult<Box<dyn TeeMediator>> {
    Ok(Box::new(Echo))
}

fn echo_desc() -> MediatorDesc<FakeHost> {
    MediatorDesc {
        name: "echo",
        uid: Uuid::from_words(ECHO_WORDS),
        probe: echo_probe,
    }
}

fn uid_answer(x0: u64) -> impl FnMut(&tee_mediator::smccc::SmcArgs) -> SmcResult + Send {
    move |args| {
        if args.x0 == TRUSTED_OS_CALL_UID as u64 {
            SmcResult { x0, ..SmcResult::default() }
        } else {
            default_firmware(args)
        }
    }
}

fn uuid_query() -> GuestRegs {
    GuestRegs {
        x0: OPTEE_SMC_GET_OS_UUID as u64,
        ..GuestRegs::default()
    }
}

#[test]
fn no_secure_os_leaves_every_call_unhandled() {
    for sentinel in [0xFFFF_FFFF, u64::MAX] {
        let host = FakeHost::new();
        host.set_firmware(uid_answer(sentinel));
        let tee = Tee::with_builtin_mediators(host.clone(), MediatorConfig::default());

        assert!(!tee.init());
        assert_eq!(tee.active_mediator(), None);

        let mut regs = uuid_query();
        assert!(!tee.handle_call(D, &mut regs));
        assert_eq!(regs, uuid_query());
        assert!(tee.domain_create(D).is_ok());
        tee.domain_destroy(D);
        tee.remove();
        // Only the UID probe reached firmware
        assert_eq!(host.smc_log().len(), 1);
    }
}

#[test]
fn optee_uid_selects_optee() {
    let host = FakeHost::new();
    let tee = Tee::with_builtin_mediators(host.clone(), MediatorConfig::default());

    assert!(tee.init());
    assert_eq!(tee.active_mediator(), Some(OPTEE_MEDIATOR_NAME));
    let log = host.smc_log();
    assert_eq!(log[0].x0, TRUSTED_OS_CALL_UID as u64);
    assert_eq!(log[1].x0, OPTEE_SMC_CALLS_REVISION as u64);

    // Selection happens once
    assert!(tee.init());
    assert_eq!(host.smc_log().len(), 2);

    let mut regs = GuestRegs {
        x0: OPTEE_SMC_GET_SHM_CONFIG as u64,
        ..GuestRegs::default()
    };
    assert!(tee.handle_call(D, &mut regs));
    assert_eq!(regs.x0, OPTEE_SMC_RETURN_ENOTAVAIL as u64);
}

#[test]
fn unknown_uid_leaves_mediation_off() {
    let host = FakeHost::new();
    host.set_firmware(|_| SmcResult {
        x0: 0xdead,
        x1: 0xbeef,
        x2: 0,
        x3: 0,
    });
    let tee = Tee::with_builtin_mediators(host.clone(), MediatorConfig::default());
    assert!(!tee.init());
    assert_eq!(tee.active_mediator(), None);
    assert_eq!(host.smc_log().len(), 1);
}

#[test]
fn disabled_config_never_touches_firmware() {
    let host = FakeHost::new();
    let config = MediatorConfig {
        enabled: false,
        ..MediatorConfig::default()
    };
    let tee = Tee::with_builtin_mediators(host.clone(), config);
    assert!(!tee.init());
    assert!(host.smc_log().is_empty());
}

#[test]
fn failed_probe_leaves_mediation_off() {
    let host = FakeHost::new();
    host.set_firmware(|args| match args.x0 as u32 {
        OPTEE_SMC_CALLS_REVISION => SmcResult {
            x0: 1,
            x1: 9,
            ..SmcResult::default()
        },
        _ => default_firmware(args),
    });
    let tee = Tee::with_builtin_mediators(host.clone(), MediatorConfig::default());
    assert!(!tee.init());

    let mut regs = uuid_query();
    assert!(!tee.handle_call(D, &mut regs));
}

#[test]
fn custom_mediator_is_selected_by_uid() {
    let host = FakeHost::new();
    host.set_firmware(|_| SmcResult {
        x0: ECHO_WORDS[0] as u64,
        x1: ECHO_WORDS[1] as u64,
        x2: ECHO_WORDS[2] as u64,
        x3: ECHO_WORDS[3] as u64,
    });
    let mut tee = Tee::with_builtin_mediators(host.clone(), MediatorConfig::default());
    tee.register(echo_desc()).unwrap();

    assert!(tee.init());
    assert_eq!(tee.active_mediator(), Some("echo"));
    let mut regs = uuid_query();
    assert!(tee.handle_call(D, &mut regs));
    assert_eq!(regs.x0, 0x42);
}

#[test]
fn registration_is_closed_after_init() {
    let host = FakeHost::new();
    let mut tee = Tee::new(host.clone(), MediatorConfig::default());
    assert!(!tee.init());
    assert!(matches!(tee.register(echo_desc()), Err(TeeError::Protocol(_))));
}

#[test]
fn duplicate_uid_is_refused() {
    let host = FakeHost::new();
    let mut tee = Tee::new(host, MediatorConfig::default());
    tee.register(echo_desc()).unwrap();
    assert!(matches!(tee.register(echo_desc()), Err(TeeError::Param(_))));

    let mut tee = Tee::with_builtin_mediators(FakeHost::new(), MediatorConfig::default());
    let clash = MediatorDesc {
        name: "clash",
        uid: OPTEE_MSG_UID,
        probe: echo_probe,
    };
    assert!(matches!(tee.register(clash), Err(TeeError::Param(_))));
}
