//! SMC Calling Convention plumbing (ARM DEN 0028).
//!
//! Function identifier encoding, the register blocks exchanged with the
//! Secure World, and UID decoding for the generic "Trusted OS" queries.

use core::fmt;

/// Fast (atomic) call flag, bit 31.
pub const SMCCC_FAST_CALL: u32 = 1 << 31;
/// SMC64 calling convention flag, bit 30.
pub const SMCCC_CONV_64: u32 = 1 << 30;
pub const SMCCC_OWNER_SHIFT: u32 = 24;
pub const SMCCC_OWNER_MASK: u32 = 0x3F;

/// Owner range reserved for Trusted OS calls (50..=63).
pub const SMCCC_OWNER_TRUSTED_OS: u32 = 50;
/// Service owner of the generic Trusted OS queries.
pub const SMCCC_OWNER_TRUSTED_OS_API: u32 = 63;

pub const SMCCC_FUNC_CALL_COUNT: u32 = 0xFF00;
pub const SMCCC_FUNC_CALL_UID: u32 = 0xFF01;
pub const SMCCC_FUNC_CALL_REVISION: u32 = 0xFF03;

/// Returned in w0 for an unimplemented function.
pub const SMCCC_RET_UNKNOWN_FUNCTION: u32 = 0xFFFF_FFFF;

/// Build an SMC32 function identifier.
pub const fn call_val(fast: bool, owner: u32, func: u32) -> u32 {
    let fast_bit = if fast { SMCCC_FAST_CALL } else { 0 };
    fast_bit | ((owner & SMCCC_OWNER_MASK) << SMCCC_OWNER_SHIFT) | (func & 0xFFFF)
}

/// `CALL_UID` of the Trusted OS generic API, used to identify the Secure OS.
pub const TRUSTED_OS_CALL_UID: u32 =
    call_val(true, SMCCC_OWNER_TRUSTED_OS_API, SMCCC_FUNC_CALL_UID);

/// Extract the owning entity of a function identifier.
pub const fn owner(function_id: u32) -> u32 {
    (function_id >> SMCCC_OWNER_SHIFT) & SMCCC_OWNER_MASK
}

/// Whether `x0` carries the "not implemented" sentinel.
///
/// SMC32 returns 0xFFFF_FFFF in w0; some monitors sign-extend it to x0.
pub fn is_unknown_function(x0: u64) -> bool {
    x0 == SMCCC_RET_UNKNOWN_FUNCTION as u64 || x0 == u64::MAX
}

/// Argument block for an SMC (x0-x7).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmcArgs {
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
    pub x4: u64,
    pub x5: u64,
    pub x6: u64,
    pub x7: u64,
}

impl SmcArgs {
    /// Call with only a function identifier.
    pub fn new(function_id: u32) -> Self {
        Self {
            x0: function_id as u64,
            ..Self::default()
        }
    }

    /// Store a 64-bit value split across two 32-bit registers.
    pub fn set_pair(&mut self, hi: usize, lo: usize, value: u64) {
        self.set(hi, value >> 32);
        self.set(lo, value & 0xFFFF_FFFF);
    }

    pub fn get(&self, n: usize) -> u64 {
        match n {
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

    pub fn set(&mut self, n: usize, value: u64) {
        match n {
            0 => self.x0 = value,
            1 => self.x1 = value,
            2 => self.x2 = value,
            3 => self.x3 = value,
            4 => self.x4 = value,
            5 => self.x5 = value,
            6 => self.x6 = value,
            7 => self.x7 = value,
            _ => {}
        }
    }
}

/// Result of an SMC (x0-x3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmcResult {
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
}

impl SmcResult {
    /// 64-bit value returned as two 32-bit halves in registers `hi` and `lo`.
    pub fn pair(&self, hi: usize, lo: usize) -> u64 {
        let reg = |n: usize| match n {
            0 => self.x0,
            1 => self.x1,
            2 => self.x2,
            3 => self.x3,
            _ => 0,
        };
        ((reg(hi) & 0xFFFF_FFFF) << 32) | (reg(lo) & 0xFFFF_FFFF)
    }
}

/// Something that can issue an SMC to the Secure Monitor.
pub trait SmcConduit: Send + Sync {
    fn call(&self, args: &SmcArgs) -> SmcResult;
}

/// 128-bit service UID as returned by `CALL_UID`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    /// Decode a UID from w0-w3, four bytes per register, first byte in the
    /// low-order bits (DEN 0028B 5.3).
    pub fn from_smc_result(res: &SmcResult) -> Self {
        let regs = [res.x0, res.x1, res.x2, res.x3];
        let mut bytes = [0u8; 16];
        for (n, byte) in bytes.iter_mut().enumerate() {
            *byte = (regs[n / 4] >> ((n & 3) * 8)) as u8;
        }
        Self(bytes)
    }

    /// Build the UID a service reports through the given four 32-bit words.
    pub const fn from_words(words: [u32; 4]) -> Self {
        let mut bytes = [0u8; 16];
        let mut n = 0;
        while n < 16 {
            bytes[n] = (words[n / 4] >> ((n & 3) * 8)) as u8;
            n += 1;
        }
        Self(bytes)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
