//! `CALL_WITH_ARG` and `RETURN_FROM_RPC`.
//!
//! The guest's argument page is copied into hypervisor memory, every
//! guest-physical reference in it is replaced by a host one, and firmware
//! works on that copy. On completion only the output fields travel back.

use core::mem::offset_of;

use log::{debug, error, trace, warn};

use super::call::{CallState, PendingRpc, StdCallCtx, MAX_PARAM_PAGE_LISTS};
use super::msg::*;
use super::noncontig::translate_noncontig;
use super::shm::ShmRegion;
use super::smc::*;
use super::OpteeMediator;
use crate::arch::GuestRegs;
use crate::error::{TeeError, TeeResult};
use crate::hal::{DomainId, TeeHal};
use crate::mm::{lookup_guest_ram, HostPages, MappedPage, PAGE_SIZE};
use crate::smccc::SmcArgs;

impl<H: TeeHal> StdCallCtx<H> {
    fn arg_view(&mut self) -> MsgArg<'_> {
        MsgArg::new(self.arg.as_mut_slice())
    }
}

fn param_field_offset(idx: usize, word: usize) -> usize {
    get_arg_size(idx) + offset_of!(OpteeMsgParam, u) + word * core::mem::size_of::<u64>()
}

impl<H: TeeHal> OpteeMediator<H> {
    /// Start a new standard call.
    pub(super) fn handle_std_call(&self, domain: DomainId, regs: &mut GuestRegs) -> TeeResult<()> {
        if self.calls.count(domain) >= self.config.max_std_calls_per_domain {
            warn!("{}: too many standard calls in flight", domain);
            return Err(TeeError::Resource("standard call limit reached"));
        }

        let mut ctx = self.copy_std_request(domain, regs)?;
        let hdr = ctx.arg_view().header();
        match hdr.cmd {
            OPTEE_MSG_CMD_OPEN_SESSION
            | OPTEE_MSG_CMD_INVOKE_COMMAND
            | OPTEE_MSG_CMD_CLOSE_SESSION
            | OPTEE_MSG_CMD_CANCEL
            | OPTEE_MSG_CMD_REGISTER_SHM
            | OPTEE_MSG_CMD_UNREGISTER_SHM => {}
            cmd => {
                warn!("{}: unknown OP-TEE command {}", domain, cmd);
                ctx.state = CallState::Failed;
                return Err(TeeError::Protocol("unknown OP-TEE command"));
            }
        }

        if let Err(e) = self.translate_params(&mut ctx) {
            ctx.state = CallState::Failed;
            return Err(e);
        }

        let mut args = regs.to_smc_args(domain.client_id());
        args.set_pair(1, 2, ctx.arg.maddr());
        self.execute_std_call(ctx, args, regs)
    }

    /// Copy the guest's argument page into a fresh context.
    fn copy_std_request(&self, domain: DomainId, regs: &GuestRegs) -> TeeResult<StdCallCtx<H>> {
        let gaddr = regs.reg_pair(1, 2);
        // OP-TEE ABI: the argument buffer starts at a page boundary
        if gaddr & (PAGE_SIZE as u64 - 1) != 0 {
            warn!("{}: unaligned argument buffer {:#x}", domain, gaddr);
            return Err(TeeError::Param("unaligned argument buffer"));
        }

        let mfn = lookup_guest_ram(&*self.hal, domain, gaddr)?;
        let mut arg = HostPages::alloc(&self.hal, 0)?;
        {
            let guest = MappedPage::map(&self.hal, mfn)?;
            guest.read(0, arg.as_mut_slice());
        }

        let mut ctx = StdCallCtx::new(domain, gaddr, arg);
        ctx.state = CallState::ArgCopied;

        // Now the copy can be examined safely
        if ctx.arg_view().checked_num_params().is_none() {
            warn!("{}: argument buffer does not fit in a page", domain);
            ctx.state = CallState::Failed;
            return Err(TeeError::Param("argument buffer too large"));
        }
        Ok(ctx)
    }

    fn translate_params(&self, ctx: &mut StdCallCtx<H>) -> TeeResult<()> {
        let domain = ctx.domain();
        let num_params = ctx
            .arg_view()
            .checked_num_params()
            .ok_or(TeeError::Param("argument buffer too large"))?;

        for idx in 0..num_params {
            let mut param = ctx.arg_view().param(idx);
            match param.attr_type() {
                OPTEE_MSG_ATTR_TYPE_TMEM_INPUT
                | OPTEE_MSG_ATTR_TYPE_TMEM_OUTPUT
                | OPTEE_MSG_ATTR_TYPE_TMEM_INOUT => {
                    if !param.flags().contains(AttrFlags::NONCONTIG) {
                        warn!("{}: contiguous temporary memory is not supported", domain);
                        return Err(TeeError::Param("contiguous temporary memory"));
                    }
                    // Null memory reference
                    if param.buf_ptr() == 0 {
                        continue;
                    }
                    if ctx.page_list_count() == MAX_PARAM_PAGE_LISTS {
                        warn!("{}: too many page list parameters", domain);
                        return Err(TeeError::Param("too many page list parameters"));
                    }
                    let list = translate_noncontig(
                        &self.hal,
                        domain,
                        &mut param,
                        self.config.max_noncontig_pages,
                    )?;
                    ctx.push_page_list(list)?;
                    ctx.arg_view().set_param(idx, &param);
                }
                OPTEE_MSG_ATTR_TYPE_NONE
                | OPTEE_MSG_ATTR_TYPE_VALUE_INPUT
                | OPTEE_MSG_ATTR_TYPE_VALUE_OUTPUT
                | OPTEE_MSG_ATTR_TYPE_VALUE_INOUT
                | OPTEE_MSG_ATTR_TYPE_RMEM_INPUT
                | OPTEE_MSG_ATTR_TYPE_RMEM_OUTPUT
                | OPTEE_MSG_ATTR_TYPE_RMEM_INOUT => {}
                other => {
                    // Firmware rejects these itself
                    debug!("{}: param {} has unknown type {:#x}", domain, idx, other);
                }
            }
        }
        ctx.state = CallState::ParamsTranslated;
        Ok(())
    }

    /// Hand the call to firmware and act on what comes back.
    fn execute_std_call(
        &self,
        mut ctx: StdCallCtx<H>,
        args: SmcArgs,
        regs: &mut GuestRegs,
    ) -> TeeResult<()> {
        let domain = ctx.domain();
        ctx.state = CallState::Forwarded;
        let res = self.hal.call_smc(&args);
        regs.set_result(&res);

        let ret = res.x0 as u32;
        if is_rpc_return(ret) {
            let rpc = PendingRpc {
                func: rpc_func(ret),
                a1: res.x1,
                a2: res.x2,
            };
            trace!("{}: RPC {} on thread {}", domain, rpc.func, res.x3 as u32);
            if rpc.func == OPTEE_SMC_RPC_FUNC_CMD {
                match self.shm.find(domain, rpc.payload()) {
                    Some(shm) => {
                        shm.lock().copy_to_guest();
                    }
                    None => error!("{}: RPC command in unknown shm {:#x}", domain, rpc.payload()),
                }
            }
            ctx.thread_id = Some(res.x3 as u32);
            ctx.rpc = Some(rpc);
            ctx.state = CallState::RpcPending;
            return self.calls.park(ctx);
        }

        if ret == OPTEE_SMC_RETURN_OK {
            self.copy_std_request_back(&mut ctx);
        }
        ctx.state = CallState::Done;
        Ok(())
    }

    /// Publish the outputs of a completed call to the guest's page.
    fn copy_std_request_back(&self, ctx: &mut StdCallCtx<H>) {
        let domain = ctx.domain();
        // The guest may have remapped the page while firmware ran
        let mfn = match lookup_guest_ram(&*self.hal, domain, ctx.guest_arg) {
            Ok(mfn) => mfn,
            Err(_) => {
                warn!("{}: argument page vanished, dropping results", domain);
                return;
            }
        };
        let mut guest = match MappedPage::map(&self.hal, mfn) {
            Ok(page) => page,
            Err(e) => {
                error!("{}: {}", domain, e);
                return;
            }
        };

        let arg = ctx.arg_view();
        let hdr = arg.header();
        guest.write_u32(offset_of!(OpteeMsgArgHeader, ret), hdr.ret);
        guest.write_u32(offset_of!(OpteeMsgArgHeader, ret_origin), hdr.ret_origin);
        guest.write_u32(offset_of!(OpteeMsgArgHeader, session), hdr.session);

        let num_params = arg.checked_num_params().unwrap_or(0);
        for idx in 0..num_params {
            let param = arg.param(idx);
            match param.attr_type() {
                OPTEE_MSG_ATTR_TYPE_TMEM_OUTPUT
                | OPTEE_MSG_ATTR_TYPE_TMEM_INOUT
                | OPTEE_MSG_ATTR_TYPE_RMEM_OUTPUT
                | OPTEE_MSG_ATTR_TYPE_RMEM_INOUT => {
                    guest.write_u64(param_field_offset(idx, 1), param.u[1]);
                }
                OPTEE_MSG_ATTR_TYPE_VALUE_OUTPUT | OPTEE_MSG_ATTR_TYPE_VALUE_INOUT => {
                    guest.write_u64(param_field_offset(idx, 0), param.u[0]);
                    guest.write_u64(param_field_offset(idx, 1), param.u[1]);
                }
                _ => {}
            }
        }
        debug!("{}: call done, ret {:#x}", domain, hdr.ret);
    }

    /// Resume a call parked on an RPC.
    pub(super) fn handle_rpc(&self, domain: DomainId, regs: &mut GuestRegs) -> TeeResult<()> {
        let thread_id = regs.x3 as u32;
        let mut ctx = self.calls.take(domain, thread_id).ok_or_else(|| {
            warn!("{}: no call waiting on thread {}", domain, thread_id);
            TeeError::Protocol("no call waiting on this thread")
        })?;
        let rpc = match ctx.rpc.take() {
            Some(rpc) => rpc,
            None => {
                ctx.state = CallState::Failed;
                return Err(TeeError::Protocol("parked call has no RPC"));
            }
        };

        let mut args = regs.to_smc_args(domain.client_id());
        match rpc.func {
            OPTEE_SMC_RPC_FUNC_ALLOC => {
                self.handle_rpc_func_alloc(domain, rpc.payload(), regs, &mut args)
            }
            OPTEE_SMC_RPC_FUNC_FREE => {
                if !self.shm.release(domain, rpc.payload()) {
                    debug!("{}: RPC free of unknown shm {:#x}", domain, rpc.payload());
                }
            }
            OPTEE_SMC_RPC_FUNC_FOREIGN_INTR => {}
            OPTEE_SMC_RPC_FUNC_CMD => self.handle_rpc_cmd(&mut ctx, rpc.payload()),
            func => warn!("{}: unknown RPC function {}", domain, func),
        }
        ctx.state = CallState::RpcHandled;

        self.execute_std_call(ctx, args, regs)
    }

    /// The guest allocated a buffer of `size` bytes: give firmware a shadow
    /// of it.
    fn handle_rpc_func_alloc(&self, domain: DomainId, size: u64, regs: &GuestRegs, args: &mut SmcArgs) {
        let gaddr = regs.reg_pair(1, 2);
        let maddr = if gaddr == 0 {
            0
        } else if size > PAGE_SIZE as u64 {
            // The shadow is a single page
            warn!("{}: RPC buffer of {:#x} bytes is too large", domain, size);
            0
        } else {
            let cookie = regs.reg_pair(4, 5);
            match ShmRegion::new(&self.hal, domain, cookie, gaddr)
                .and_then(|region| self.shm.insert(region))
            {
                Ok(shm) => {
                    let maddr = shm.lock().shadow_maddr();
                    maddr
                }
                Err(e) => {
                    warn!("{}: failed to allocate shm {:#x}: {}", domain, cookie, e);
                    0
                }
            }
        };
        args.set_pair(1, 2, maddr);
    }

    /// The guest answered an RPC command in the buffer named by `cookie`.
    fn handle_rpc_cmd(&self, ctx: &mut StdCallCtx<H>, cookie: u64) {
        let domain = ctx.domain();
        let Some(shm) = self.shm.find(domain, cookie) else {
            error!("{}: can't find shm with cookie {:#x}", domain, cookie);
            return;
        };
        let mut shm = shm.lock();
        shm.copy_from_guest();
        let mut arg = shm.shadow_arg();
        let hdr = arg.header();
        let num_params = (hdr.num_params as usize).min(MAX_PARAMS_PER_PAGE);

        let mut first_unchecked = 0;
        let mut translated = None;
        match hdr.cmd {
            OPTEE_RPC_CMD_SHM_ALLOC => {
                translated = self.handle_rpc_cmd_alloc(ctx, &mut arg, num_params);
                first_unchecked = 1;
            }
            OPTEE_RPC_CMD_GET_TIME
            | OPTEE_RPC_CMD_WAIT_QUEUE
            | OPTEE_RPC_CMD_SUSPEND
            | OPTEE_RPC_CMD_SHM_FREE => trace!("{}: RPC command {}", domain, hdr.cmd),
            cmd => debug!("{}: RPC command {} passed through", domain, cmd),
        }

        // Any other memory reference would reach firmware untranslated
        for idx in first_unchecked..num_params {
            let mut param = arg.param(idx);
            if param.is_tmem() && param.buf_ptr() != 0 {
                warn!("{}: clearing untranslated buffer in RPC param {}", domain, idx);
                param.set_buf_ptr(0);
                arg.set_param(idx, &param);
            }
        }

        if let Some((guest_ptr, host_ptr)) = translated {
            shm.note_translated(0, guest_ptr, host_ptr);
        }
    }

    /// Translate the buffer of an `SHM_ALLOC` reply. Returns the guest's and
    /// the host's `buf_ptr` of param 0 on success.
    fn handle_rpc_cmd_alloc(
        &self,
        ctx: &mut StdCallCtx<H>,
        arg: &mut MsgArg<'_>,
        num_params: usize,
    ) -> Option<(u64, u64)> {
        let domain = ctx.domain();
        // Only one RPC buffer per call; the previous one is done with
        ctx.rpc_page_list = None;

        if num_params == 0 {
            warn!("{}: SHM_ALLOC reply without parameters", domain);
            Self::fail_rpc_cmd_alloc(arg);
            return None;
        }

        let mut param = arg.param(0);
        if param.attr != OPTEE_MSG_ATTR_TYPE_TMEM_OUTPUT | OPTEE_MSG_ATTR_NONCONTIG {
            warn!("{}: invalid attrs for shared mem buffer", domain);
            param.set_buf_ptr(0);
            arg.set_param(0, &param);
            Self::fail_rpc_cmd_alloc(arg);
            return None;
        }

        let guest_ptr = param.buf_ptr();
        match translate_noncontig(&self.hal, domain, &mut param, self.config.max_noncontig_pages) {
            Ok(list) => {
                ctx.rpc_page_list = Some(list);
                arg.set_param(0, &param);
                Some((guest_ptr, param.buf_ptr()))
            }
            Err(e) => {
                warn!("{}: can't translate RPC buffer: {}", domain, e);
                param.set_buf_ptr(0);
                arg.set_param(0, &param);
                Self::fail_rpc_cmd_alloc(arg);
                None
            }
        }
    }

    fn fail_rpc_cmd_alloc(arg: &mut MsgArg<'_>) {
        let mut hdr = arg.header();
        hdr.ret = TEE_ERROR_OUT_OF_MEMORY;
        arg.set_header(&hdr);
    }
}
