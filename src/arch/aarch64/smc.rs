//! SMC forwarding to EL3 (Secure World).
//!
//! From EL2, executing `smc #0` goes directly to EL3: `HCR_EL2.TSC` only
//! traps EL1 SMC to EL2, not EL2 SMC. The mediator uses this conduit to reach
//! OP-TEE after it has rewritten the guest's request.

use crate::smccc::{SmcArgs, SmcConduit, SmcResult};

/// The `smc #0` conduit.
#[derive(Debug, Default, Clone, Copy)]
pub struct Smc;

impl SmcConduit for Smc {
    fn call(&self, args: &SmcArgs) -> SmcResult {
        forward_smc(args)
    }
}

/// Issue an SMC with x0-x7 as arguments, returning x0-x3.
#[inline(never)]
pub fn forward_smc(args: &SmcArgs) -> SmcResult {
    let r0: u64;
    let r1: u64;
    let r2: u64;
    let r3: u64;
    // SAFETY: the Secure Monitor only touches the registers listed here; the
    // caller is responsible for what the arguments mean to the firmware.
    unsafe {
        core::arch::asm!(
            "smc #0",
            inout("x0") args.x0 => r0,
            inout("x1") args.x1 => r1,
            inout("x2") args.x2 => r2,
            inout("x3") args.x3 => r3,
            inout("x4") args.x4 => _,
            inout("x5") args.x5 => _,
            inout("x6") args.x6 => _,
            inout("x7") args.x7 => _,
            // x8-x17 may be clobbered by the SMC call per SMCCC
            lateout("x8") _,
            lateout("x9") _,
            lateout("x10") _,
            lateout("x11") _,
            lateout("x12") _,
            lateout("x13") _,
            lateout("x14") _,
            lateout("x15") _,
            lateout("x16") _,
            lateout("x17") _,
            // Firmware reads and writes the argument pages set up just before
            // the call, so this must act as a compiler memory barrier.
            options(nostack),
        );
    }
    SmcResult {
        x0: r0,
        x1: r1,
        x2: r2,
        x3: r3,
    }
}
