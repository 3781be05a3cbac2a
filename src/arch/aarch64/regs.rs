//! Guest register view for a trapped SMC
//!
//! SMCCC passes arguments and results in x0-x7. The front end that decodes
//! the trap hands the mediator this subset of the vCPU's general purpose
//! registers and writes it back on guest re-entry.

use crate::smccc::{SmcArgs, SmcResult};

/// x0-x7 of the calling vCPU.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestRegs {
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
    pub x4: u64,
    pub x5: u64,
    pub x6: u64,
    pub x7: u64,
}

impl GuestRegs {
    /// Get value of an argument register
    ///
    /// # Arguments
    /// * `reg` - Register number (0-7); anything else reads as zero
    pub fn get_reg(&self, reg: u8) -> u64 {
        match reg {
            0 => self.x0,
            1 => self.x1,
            2 => self.x2,
            3 => self.x3,
            4 => self.x4,
            5 => self.x5,
            6 => self.x6,
            7 => self.x7,
            _ => 0,
        }
    }

    /// SMC32 function identifier (w0).
    pub fn function_id(&self) -> u32 {
        self.x0 as u32
    }

    /// 64-bit value passed as two 32-bit halves, `hi` holding bits [63:32].
    pub fn reg_pair(&self, hi: u8, lo: u8) -> u64 {
        ((self.get_reg(hi) & 0xFFFF_FFFF) << 32) | (self.get_reg(lo) & 0xFFFF_FFFF)
    }

    /// Build the firmware argument block from the guest's registers.
    ///
    /// x7 is never taken from the guest: it carries the hypervisor client id
    /// identifying the calling VM to the Secure World.
    pub fn to_smc_args(&self, client_id: u32) -> SmcArgs {
        SmcArgs {
            x0: self.x0,
            x1: self.x1,
            x2: self.x2,
            x3: self.x3,
            x4: self.x4,
            x5: self.x5,
            x6: self.x6,
            x7: client_id as u64,
        }
    }

    /// Return the firmware's x0-x3 to the guest.
    pub fn set_result(&mut self, res: &SmcResult) {
        self.x0 = res.x0;
        self.x1 = res.x1;
        self.x2 = res.x2;
        self.x3 = res.x3;
    }

    /// Complete the call with a single status word in x0.
    pub fn set_return(&mut self, ret: u32) {
        self.x0 = ret as u64;
    }
}
