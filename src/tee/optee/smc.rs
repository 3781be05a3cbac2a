//! OP-TEE SMC interface (`optee_smc.h`).
//!
//! All calls are SMC32 with owner Trusted OS (50). Fast calls have bit 31
//! set, yielding (standard) calls leave it clear.

use bitflags::bitflags;

use crate::smccc::{call_val, SMCCC_FUNC_CALL_COUNT, SMCCC_FUNC_CALL_REVISION};
use crate::smccc::{SMCCC_OWNER_TRUSTED_OS, SMCCC_OWNER_TRUSTED_OS_API, TRUSTED_OS_CALL_UID};
use crate::smccc::Uuid;

const fn fast_call(func: u32) -> u32 {
    call_val(true, SMCCC_OWNER_TRUSTED_OS, func)
}

const fn std_call(func: u32) -> u32 {
    call_val(false, SMCCC_OWNER_TRUSTED_OS, func)
}

// Generic Trusted OS queries answered by OP-TEE
pub const OPTEE_SMC_CALLS_COUNT: u32 =
    call_val(true, SMCCC_OWNER_TRUSTED_OS_API, SMCCC_FUNC_CALL_COUNT);
pub const OPTEE_SMC_CALLS_UID: u32 = TRUSTED_OS_CALL_UID;
pub const OPTEE_SMC_CALLS_REVISION: u32 =
    call_val(true, SMCCC_OWNER_TRUSTED_OS_API, SMCCC_FUNC_CALL_REVISION);

pub const OPTEE_SMC_GET_OS_UUID: u32 = fast_call(0);
pub const OPTEE_SMC_GET_OS_REVISION: u32 = fast_call(1);
pub const OPTEE_SMC_CALL_RETURN_FROM_RPC: u32 = std_call(3);
pub const OPTEE_SMC_CALL_WITH_ARG: u32 = std_call(4);
pub const OPTEE_SMC_GET_SHM_CONFIG: u32 = fast_call(7);
pub const OPTEE_SMC_EXCHANGE_CAPABILITIES: u32 = fast_call(9);
pub const OPTEE_SMC_DISABLE_SHM_CACHE: u32 = fast_call(10);
pub const OPTEE_SMC_ENABLE_SHM_CACHE: u32 = fast_call(11);
pub const OPTEE_SMC_VM_CREATED: u32 = fast_call(13);
pub const OPTEE_SMC_VM_DESTROYED: u32 = fast_call(14);

// Return codes in w0
pub const OPTEE_SMC_RETURN_OK: u32 = 0x0;
pub const OPTEE_SMC_RETURN_ETHREAD_LIMIT: u32 = 0x1;
pub const OPTEE_SMC_RETURN_EBUSY: u32 = 0x2;
pub const OPTEE_SMC_RETURN_ERESUME: u32 = 0x3;
pub const OPTEE_SMC_RETURN_EBADADDR: u32 = 0x4;
pub const OPTEE_SMC_RETURN_EBADCMD: u32 = 0x5;
pub const OPTEE_SMC_RETURN_ENOMEM: u32 = 0x6;
pub const OPTEE_SMC_RETURN_ENOTAVAIL: u32 = 0x7;
pub const OPTEE_SMC_RETURN_UNKNOWN_FUNCTION: u32 = 0xFFFF_FFFF;

/// Return codes with these bits set ask the normal world to service an RPC.
pub const OPTEE_SMC_RETURN_RPC_PREFIX_MASK: u32 = 0xFFFF_0000;
pub const OPTEE_SMC_RETURN_RPC_PREFIX: u32 = 0xFFFF_0000;
pub const OPTEE_SMC_RETURN_RPC_FUNC_MASK: u32 = 0x0000_FFFF;

pub const OPTEE_SMC_RPC_FUNC_ALLOC: u32 = 0;
pub const OPTEE_SMC_RPC_FUNC_FREE: u32 = 2;
pub const OPTEE_SMC_RPC_FUNC_FOREIGN_INTR: u32 = 4;
pub const OPTEE_SMC_RPC_FUNC_CMD: u32 = 5;

/// Whether a standard call return code is an RPC request.
pub const fn is_rpc_return(ret: u32) -> bool {
    ret != OPTEE_SMC_RETURN_UNKNOWN_FUNCTION
        && ret & OPTEE_SMC_RETURN_RPC_PREFIX_MASK == OPTEE_SMC_RETURN_RPC_PREFIX
}

pub const fn rpc_func(ret: u32) -> u32 {
    ret & OPTEE_SMC_RETURN_RPC_FUNC_MASK
}

/// `CALLS_UID` reply identifying OP-TEE's message protocol.
pub const OPTEE_MSG_UID: Uuid =
    Uuid::from_words([0x384f_b3e0, 0xe7f8_11e3, 0xaf63_0002, 0xa5d5_c51b]);

pub const OPTEE_MSG_REVISION_MAJOR: u32 = 2;
pub const OPTEE_MSG_REVISION_MINOR: u32 = 0;

bitflags! {
    /// Normal world capabilities passed in w1 of `EXCHANGE_CAPABILITIES`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NsecCaps: u32 {
        const UNIPROCESSOR = 1 << 0;
    }
}

bitflags! {
    /// Secure world capabilities returned in w1 of `EXCHANGE_CAPABILITIES`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecCaps: u32 {
        const HAVE_RESERVED_SHM = 1 << 0;
        const UNREGISTERED_SHM = 1 << 1;
        const DYNAMIC_SHM = 1 << 2;
    }
}
