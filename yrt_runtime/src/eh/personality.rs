// Personality routine structure follows the rust compiler's
// `library/std/src/personality/gcc.rs` and `dwarf/eh.rs`
// Copyright the rust project's contributors: https://github.com/rust-lang/rust/blob/master/COPYRIGHT

use libc::c_int;
use yrt_dwarf::{self as dwarf, RelocationBases};
use yrt_unwind as uw;

use crate::error::{EhError, Result};

use super::header::{ExceptionHeader, ExceptionObject, HandlerRecord, YRT_EXCEPTION_CLASS};
use super::lsda::{self, LsdaHeader};

/// The parts of an unwinder frame the personality routine looks at.
pub trait FrameContext: RelocationBases {
    fn lsda(&self) -> *const u8;
    fn region_start(&self) -> usize;
    fn cfa(&self) -> usize;
    /// Address of the instruction that is unwound through, already adjusted
    /// when the unwinder reports a return address.
    fn ip(&self) -> usize;
    fn set_gr(&mut self, index: c_int, value: usize);
    fn set_ip(&mut self, ip: usize);
}

/// A return address points after the call, which may already be outside the
/// call site.
pub fn adjust_ip(ip: usize, ip_before_insn: bool) -> usize {
    if ip_before_insn {
        ip
    } else {
        ip.wrapping_sub(1)
    }
}

pub struct UnwindFrame(pub *mut uw::_Unwind_Context);

impl RelocationBases for UnwindFrame {
    fn text_rel_base(&self) -> dwarf::Result<usize> {
        Ok(unsafe { uw::_Unwind_GetTextRelBase(self.0) })
    }

    fn data_rel_base(&self) -> dwarf::Result<usize> {
        Ok(unsafe { uw::_Unwind_GetDataRelBase(self.0) })
    }

    fn func_rel_base(&self) -> dwarf::Result<usize> {
        Ok(self.region_start())
    }
}

impl FrameContext for UnwindFrame {
    fn lsda(&self) -> *const u8 {
        unsafe { uw::_Unwind_GetLanguageSpecificData(self.0) as *const u8 }
    }

    fn region_start(&self) -> usize {
        unsafe { uw::_Unwind_GetRegionStart(self.0) }
    }

    fn cfa(&self) -> usize {
        unsafe { uw::_Unwind_GetCFA(self.0) }
    }

    fn ip(&self) -> usize {
        let mut ip_before_insn: c_int = 0;
        let ip = unsafe { uw::_Unwind_GetIPInfo(self.0, &mut ip_before_insn) };
        adjust_ip(ip, ip_before_insn != 0)
    }

    fn set_gr(&mut self, index: c_int, value: usize) {
        unsafe { uw::_Unwind_SetGR(self.0, index, value) }
    }

    fn set_ip(&mut self, ip: usize) {
        unsafe { uw::_Unwind_SetIP(self.0, ip) }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum EHAction {
    None,
    Cleanup(HandlerRecord),
    Catch(HandlerRecord),
}

unsafe fn find_eh_action<F: FrameContext>(frame: &F, handlers_allowed: bool) -> Result<EHAction> {
    let lsda = frame.lsda();
    if lsda.is_null() {
        return Ok(EHAction::None);
    }

    let func_start = frame.region_start();
    let header = LsdaHeader::parse(lsda, func_start, frame)?;
    let site = match header.find_call_site(frame.ip(), func_start)? {
        Some(site) => site,
        None => return Ok(EHAction::None),
    };

    let record = HandlerRecord {
        handler: 0,
        lsda,
        landing_pad: site.landing_pad,
        cfa: frame.cfa(),
    };
    let scan = match site.action {
        Some(action) => lsda::scan_actions(action, handlers_allowed),
        None => return Ok(EHAction::Cleanup(record)),
    };

    Ok(match scan.handler {
        Some(handler) => EHAction::Catch(HandlerRecord { handler, ..record }),
        None if scan.cleanup => EHAction::Cleanup(record),
        None => EHAction::None,
    })
}

/// Folds older exceptions that were headed for the same frame activation
/// into `header`: their payloads go first in the chain, their handler index
/// wins, and their headers are unlinked and passed to `retire`.
///
/// # Safety
/// `header` and every header reachable through `next` must be valid.
pub unsafe fn merge_in_flight(
    header: *mut ExceptionHeader,
    mut record: HandlerRecord,
    mut retire: impl FnMut(*mut ExceptionHeader),
) -> c_int {
    loop {
        let older = (*header).next();
        if older.is_null() {
            break;
        }

        let saved = (*older).restore();
        if saved.lsda != record.lsda || saved.cfa != record.cfa {
            break;
        }

        log::debug!(
            "exception {:p} raised while unwinding {:p} to the same frame, chaining",
            header,
            older
        );
        (*header).object = ExceptionObject::append((*older).object, (*header).object);
        record.handler = saved.handler;
        (*header).save(record);
        (*header).next = (*older).next;
        retire(older);
    }
    record.handler
}

/// One personality step for `exception` in `frame`.
///
/// # Safety
/// `exception` must be a live exception; when its class is ours it must be
/// embedded in an [`ExceptionHeader`].
pub unsafe fn personality<F: FrameContext>(
    actions: uw::_Unwind_Action,
    exception_class: uw::_Unwind_Exception_Class,
    exception: *mut uw::_Unwind_Exception,
    frame: &mut F,
    retire: impl FnMut(*mut ExceptionHeader),
) -> Result<uw::_Unwind_Reason_Code> {
    let ours = exception_class == YRT_EXCEPTION_CLASS;

    let record = if ours && actions == uw::_UA_CLEANUP_PHASE | uw::_UA_HANDLER_FRAME {
        let record = (*ExceptionHeader::from_unwind(exception)).restore();
        if record.landing_pad == 0 {
            return Err(EhError::MissingLandingPad);
        }
        record
    } else {
        // foreign exceptions and forced unwinds only ever run cleanups
        let handlers_allowed = ours && actions & uw::_UA_FORCE_UNWIND == 0;
        let eh_action = find_eh_action(frame, handlers_allowed)?;
        log::trace!("personality actions={:#x} ip={:#x}: {:?}", actions, frame.ip(), eh_action);

        if actions & uw::_UA_SEARCH_PHASE != 0 {
            return Ok(match eh_action {
                EHAction::None | EHAction::Cleanup(_) => uw::_URC_CONTINUE_UNWIND,
                EHAction::Catch(record) => {
                    (*ExceptionHeader::from_unwind(exception)).save(record);
                    uw::_URC_HANDLER_FOUND
                }
            });
        }
        match eh_action {
            EHAction::None => return Ok(uw::_URC_CONTINUE_UNWIND),
            EHAction::Cleanup(record) | EHAction::Catch(record) => record,
        }
    };

    let handler = if ours {
        merge_in_flight(ExceptionHeader::from_unwind(exception), record, retire)
    } else {
        record.handler
    };

    frame.set_gr(uw::UNWIND_DATA_REG.0, exception as usize);
    frame.set_gr(uw::UNWIND_DATA_REG.1, handler as usize);
    frame.set_ip(record.landing_pad);
    Ok(uw::_URC_INSTALL_CONTEXT)
}

#[no_mangle]
pub unsafe extern "C" fn __gyc_personality_v0(
    version: c_int,
    actions: uw::_Unwind_Action,
    exception_class: uw::_Unwind_Exception_Class,
    exception: *mut uw::_Unwind_Exception,
    context: *mut uw::_Unwind_Context,
) -> uw::_Unwind_Reason_Code {
    if version != 1 {
        return uw::_URC_FATAL_PHASE1_ERROR;
    }

    let mut frame = UnwindFrame(context);
    let retire = |older: *mut ExceptionHeader| uw::_Unwind_DeleteException(ExceptionHeader::as_unwind(older));
    match personality(actions, exception_class, exception, &mut frame, retire) {
        Ok(code) => code,
        Err(err) => crate::panic::fatal(&err, "__gyc_personality_v0"),
    }
}

const _: uw::_Unwind_Personality_Fn = __gyc_personality_v0;
