//! OP-TEE message layouts (`optee_msg.h`).
//!
//! An argument buffer is a header followed by `num_params` parameters and
//! always lives in a single page here. The structures are plain data, so
//! they are moved in and out of page copies with `zerocopy`.

use bitflags::bitflags;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::mm::PAGE_SIZE;

// Parameter attribute types
pub const OPTEE_MSG_ATTR_TYPE_NONE: u64 = 0x0;
pub const OPTEE_MSG_ATTR_TYPE_VALUE_INPUT: u64 = 0x1;
pub const OPTEE_MSG_ATTR_TYPE_VALUE_OUTPUT: u64 = 0x2;
pub const OPTEE_MSG_ATTR_TYPE_VALUE_INOUT: u64 = 0x3;
pub const OPTEE_MSG_ATTR_TYPE_RMEM_INPUT: u64 = 0x5;
pub const OPTEE_MSG_ATTR_TYPE_RMEM_OUTPUT: u64 = 0x6;
pub const OPTEE_MSG_ATTR_TYPE_RMEM_INOUT: u64 = 0x7;
pub const OPTEE_MSG_ATTR_TYPE_TMEM_INPUT: u64 = 0x9;
pub const OPTEE_MSG_ATTR_TYPE_TMEM_OUTPUT: u64 = 0xa;
pub const OPTEE_MSG_ATTR_TYPE_TMEM_INOUT: u64 = 0xb;
pub const OPTEE_MSG_ATTR_TYPE_MASK: u64 = 0xff;

bitflags! {
    /// Flag bits above the attribute type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrFlags: u64 {
        const META = 1 << 8;
        const NONCONTIG = 1 << 9;
    }
}

pub const OPTEE_MSG_ATTR_NONCONTIG: u64 = AttrFlags::NONCONTIG.bits();

// Commands in OpteeMsgArgHeader::cmd for CALL_WITH_ARG
pub const OPTEE_MSG_CMD_OPEN_SESSION: u32 = 0;
pub const OPTEE_MSG_CMD_INVOKE_COMMAND: u32 = 1;
pub const OPTEE_MSG_CMD_CLOSE_SESSION: u32 = 2;
pub const OPTEE_MSG_CMD_CANCEL: u32 = 3;
pub const OPTEE_MSG_CMD_REGISTER_SHM: u32 = 4;
pub const OPTEE_MSG_CMD_UNREGISTER_SHM: u32 = 5;

// Commands firmware sends through RPC_FUNC_CMD
pub const OPTEE_RPC_CMD_LOAD_TA: u32 = 0;
pub const OPTEE_RPC_CMD_RPMB: u32 = 1;
pub const OPTEE_RPC_CMD_FS: u32 = 2;
pub const OPTEE_RPC_CMD_GET_TIME: u32 = 3;
pub const OPTEE_RPC_CMD_WAIT_QUEUE: u32 = 4;
pub const OPTEE_RPC_CMD_SUSPEND: u32 = 5;
pub const OPTEE_RPC_CMD_SHM_ALLOC: u32 = 6;
pub const OPTEE_RPC_CMD_SHM_FREE: u32 = 7;

/// GlobalPlatform `TEE_ERROR_OUT_OF_MEMORY`.
pub const TEE_ERROR_OUT_OF_MEMORY: u32 = 0xFFFF_000C;

/// Fixed part of an argument buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct OpteeMsgArgHeader {
    pub cmd: u32,
    pub func: u32,
    pub session: u32,
    pub cancel_id: u32,
    pub pad: u32,
    pub ret: u32,
    pub ret_origin: u32,
    pub num_params: u32,
}

/// One parameter. The meaning of `u` depends on the attribute type:
/// tmem `{buf_ptr, size, shm_ref}`, rmem `{offs, size, shm_ref}`,
/// value `{a, b, c}`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct OpteeMsgParam {
    pub attr: u64,
    pub u: [u64; 3],
}

const_assert_eq!(core::mem::size_of::<OpteeMsgArgHeader>(), 32);
const_assert_eq!(core::mem::size_of::<OpteeMsgParam>(), 32);

pub const OPTEE_MSG_ARG_HEADER_SIZE: usize = core::mem::size_of::<OpteeMsgArgHeader>();
pub const OPTEE_MSG_PARAM_SIZE: usize = core::mem::size_of::<OpteeMsgParam>();

/// Bytes needed for an argument buffer with `num_params` parameters.
pub const fn get_arg_size(num_params: usize) -> usize {
    OPTEE_MSG_ARG_HEADER_SIZE + OPTEE_MSG_PARAM_SIZE * num_params
}

/// Most parameters that fit in the single page we shadow.
pub const MAX_PARAMS_PER_PAGE: usize = (PAGE_SIZE - OPTEE_MSG_ARG_HEADER_SIZE) / OPTEE_MSG_PARAM_SIZE;

impl OpteeMsgParam {
    pub fn attr_type(&self) -> u64 {
        self.attr & OPTEE_MSG_ATTR_TYPE_MASK
    }

    pub fn flags(&self) -> AttrFlags {
        AttrFlags::from_bits_truncate(self.attr)
    }

    pub fn is_tmem(&self) -> bool {
        matches!(
            self.attr_type(),
            OPTEE_MSG_ATTR_TYPE_TMEM_INPUT | OPTEE_MSG_ATTR_TYPE_TMEM_OUTPUT | OPTEE_MSG_ATTR_TYPE_TMEM_INOUT
        )
    }

    // tmem
    pub fn buf_ptr(&self) -> u64 {
        self.u[0]
    }

    pub fn set_buf_ptr(&mut self, ptr: u64) {
        self.u[0] = ptr;
    }

    /// `size` of a tmem or rmem parameter.
    pub fn size(&self) -> u64 {
        self.u[1]
    }
}

/// Read/write view of a page holding an argument buffer.
///
/// Indices are not checked against `num_params`; callers validate the
/// header with [`MsgArg::checked_num_params`] first.
pub struct MsgArg<'a> {
    buf: &'a mut [u8],
}

impl<'a> MsgArg<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        assert!(buf.len() >= PAGE_SIZE);
        Self { buf }
    }

    pub fn header(&self) -> OpteeMsgArgHeader {
        let mut hdr = OpteeMsgArgHeader::new_zeroed();
        hdr.as_mut_bytes()
            .copy_from_slice(&self.buf[..OPTEE_MSG_ARG_HEADER_SIZE]);
        hdr
    }

    pub fn set_header(&mut self, hdr: &OpteeMsgArgHeader) {
        self.buf[..OPTEE_MSG_ARG_HEADER_SIZE].copy_from_slice(hdr.as_bytes());
    }

    /// `num_params`, if the whole buffer fits in one page.
    pub fn checked_num_params(&self) -> Option<usize> {
        let num = self.header().num_params as usize;
        (get_arg_size(num) <= PAGE_SIZE).then_some(num)
    }

    fn param_range(idx: usize) -> core::ops::Range<usize> {
        let start = get_arg_size(idx);
        start..start + OPTEE_MSG_PARAM_SIZE
    }

    pub fn param(&self, idx: usize) -> OpteeMsgParam {
        let mut param = OpteeMsgParam::new_zeroed();
        param
            .as_mut_bytes()
            .copy_from_slice(&self.buf[Self::param_range(idx)]);
        param
    }

    pub fn set_param(&mut self, idx: usize, param: &OpteeMsgParam) {
        self.buf[Self::param_range(idx)].copy_from_slice(param.as_bytes());
    }
}

/// Entries in one page-list block; the last slot links to the next block.
pub const PAGELIST_ENTRIES_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<u64>() - 1;

/// One page of a non-contiguous buffer descriptor.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageListBlock {
    pub pages_list: [u64; PAGELIST_ENTRIES_PER_PAGE],
    pub next_page_data: u64,
}

const_assert_eq!(core::mem::size_of::<PageListBlock>(), PAGE_SIZE);

/// Byte offset of `pages_list[idx]` within a block.
pub const fn pagelist_entry_offset(idx: usize) -> usize {
    idx * core::mem::size_of::<u64>()
}

/// Byte offset of `next_page_data` within a block.
pub const PAGELIST_NEXT_OFFSET: usize = pagelist_entry_offset(PAGELIST_ENTRIES_PER_PAGE);
