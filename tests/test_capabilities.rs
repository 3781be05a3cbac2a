mod common;

use std::sync::Arc;

use common::*;
use tee_mediator::arch::GuestRegs;
use tee_mediator::config::MediatorConfig;
use tee_mediator::hal::DomainId;
use tee_mediator::smccc::SmcResult;
use tee_mediator::tee::optee::smc::*;
use tee_mediator::tee::optee::OpteeMediator;
use tee_mediator::tee::TeeMediator;

const D: DomainId = DomainId(3);

fn setup() -> (Arc<FakeHost>, OpteeMediator<FakeHost>) {
    let host = FakeHost::new();
    let mediator = OpteeMediator::new(host.clone(), &MediatorConfig::default());
    (host, mediator)
}

fn fast(fid: u32, x1: u64) -> GuestRegs {
    GuestRegs {
        x0: fid as u64,
        x1,
        ..GuestRegs::default()
    }
}

#[test]
fn capabilities_are_filtered_both_ways() {
    let (host, mediator) = setup();
    host.script(vec![step(|args| {
        // Only the uniprocessor bit survives from the guest
        assert_eq!(args.x1, NsecCaps::UNIPROCESSOR.bits() as u64);
        SmcResult {
            x0: 0,
            x1: (SecCaps::HAVE_RESERVED_SHM | SecCaps::UNREGISTERED_SHM | SecCaps::DYNAMIC_SHM)
                .bits() as u64,
            x2: 0,
            x3: 0,
        }
    })]);

    let mut regs = fast(OPTEE_SMC_EXCHANGE_CAPABILITIES, 0xFF);
    assert!(mediator.handle_call(D, &mut regs));
    assert_eq!(regs.x0, 0);
    assert_eq!(regs.x1, SecCaps::DYNAMIC_SHM.bits() as u64);
    assert_eq!(host.smc_log()[0].x7, D.client_id() as u64);
}

#[test]
fn firmware_without_dynamic_shm_is_not_offered() {
    let (host, mediator) = setup();
    host.script(vec![step(|_| SmcResult {
        x1: SecCaps::HAVE_RESERVED_SHM.bits() as u64,
        ..SmcResult::default()
    })]);

    let mut regs = fast(OPTEE_SMC_EXCHANGE_CAPABILITIES, 0);
    assert!(mediator.handle_call(D, &mut regs));
    assert_eq!(regs.x0, OPTEE_SMC_RETURN_ENOTAVAIL as u64);
}

#[test]
fn firmware_error_is_passed_through() {
    let (host, mediator) = setup();
    host.script(vec![step(|_| SmcResult {
        x0: OPTEE_SMC_RETURN_EBADCMD as u64,
        x1: 0x1234,
        ..SmcResult::default()
    })]);

    let mut regs = fast(OPTEE_SMC_EXCHANGE_CAPABILITIES, 1);
    assert!(mediator.handle_call(D, &mut regs));
    assert_eq!(regs.x0, OPTEE_SMC_RETURN_EBADCMD as u64);
    assert_eq!(regs.x1, 0x1234);
}

#[test]
fn static_shm_calls_are_refused_locally() {
    let (host, mediator) = setup();
    for fid in [OPTEE_SMC_GET_SHM_CONFIG, OPTEE_SMC_ENABLE_SHM_CACHE] {
        let mut regs = fast(fid, 0);
        assert!(mediator.handle_call(D, &mut regs));
        assert_eq!(regs.x0, OPTEE_SMC_RETURN_ENOTAVAIL as u64);
    }
    assert!(host.smc_log().is_empty());
}

#[test]
fn queries_are_forwarded_with_client_id() {
    let (host, mediator) = setup();
    let mut regs = fast(OPTEE_SMC_CALLS_UID, 0);
    regs.x7 = 0xdead;
    assert!(mediator.handle_call(D, &mut regs));
    assert_eq!(regs.x0, 0x384f_b3e0);
    assert_eq!(regs.x3, 0xa5d5_c51b);

    let mut regs = fast(OPTEE_SMC_CALLS_REVISION, 0);
    assert!(mediator.handle_call(D, &mut regs));
    assert_eq!((regs.x0, regs.x1), (2, 0));

    for fid in [OPTEE_SMC_CALLS_COUNT, OPTEE_SMC_GET_OS_UUID, OPTEE_SMC_GET_OS_REVISION] {
        let mut regs = fast(fid, 0);
        assert!(mediator.handle_call(D, &mut regs));
    }

    let log = host.smc_log();
    assert_eq!(log.len(), 5);
    assert!(log.iter().all(|args| args.x7 == D.client_id() as u64));
}

#[test]
fn unknown_function_is_unhandled() {
    let (host, mediator) = setup();
    for fid in [0xB200_0020u32, OPTEE_SMC_VM_CREATED, 0x8400_0000] {
        let mut regs = fast(fid, 5);
        let before = regs;
        assert!(!mediator.handle_call(D, &mut regs));
        assert_eq!(regs, before);
    }
    assert!(host.smc_log().is_empty());
}
