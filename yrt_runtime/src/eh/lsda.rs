//! Decoding of the language-specific data area emitted for each function
//! with landing pads (the `.gcc_except_table` format):
//!
//! ```text
//! lpstart encoding, [lpstart]
//! ttype encoding, [uleb128 ttype offset]
//! call-site encoding, uleb128 call-site table length
//! call sites: start, length, landing pad, uleb128 action (1-based, 0 = none)
//! actions:    sleb128 filter, sleb128 displacement to the next action
//! ```

use libc::c_int;
use yrt_dwarf::{self as dwarf, DwarfReader, NoBases, RelocationBases};

use crate::error::Result;

pub struct LsdaHeader {
    /// Landing pads are offsets from this address.
    pub lp_start: usize,
    pub call_site_encoding: u8,
    call_sites: *const u8,
    action_table: *const u8,
}

/// The call-site entry covering an instruction pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub landing_pad: usize,
    /// First action record, `None` for a cleanup-only landing pad.
    pub action: Option<*const u8>,
}

/// What a chain of action records asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionScan {
    /// Filter of the first catch clause, the index handed to the landing pad.
    pub handler: Option<c_int>,
    pub cleanup: bool,
}

impl LsdaHeader {
    /// # Safety
    /// `lsda` must point to a well-formed LSDA.
    pub unsafe fn parse(lsda: *const u8, func_start: usize, bases: &dyn RelocationBases) -> Result<Self> {
        let mut reader = DwarfReader::new(lsda);

        let lp_start_encoding = reader.read::<u8>();
        let lp_start = if lp_start_encoding != dwarf::DW_EH_PE_omit {
            reader.read_encoded(lp_start_encoding, bases)?
        } else {
            func_start
        };

        // catch clauses are matched by type in generated code, the type table
        // itself is never read here
        let ttype_encoding = reader.read::<u8>();
        if ttype_encoding != dwarf::DW_EH_PE_omit {
            reader.read_uleb128();
        }

        let call_site_encoding = reader.read::<u8>();
        let call_site_table_length = reader.read_uleb128();
        let call_sites = reader.ptr;
        let action_table = call_sites.add(call_site_table_length as usize);

        Ok(Self {
            lp_start,
            call_site_encoding,
            call_sites,
            action_table,
        })
    }

    /// Finds the call site covering `ip`. `None` means the frame has nothing
    /// to run for this ip: no entry, or an entry without landing pad.
    ///
    /// # Safety
    /// The header must come from a well-formed LSDA.
    pub unsafe fn find_call_site(&self, ip: usize, func_start: usize) -> Result<Option<CallSite>> {
        let mut reader = DwarfReader::new(self.call_sites);

        while reader.ptr < self.action_table {
            // offsets from the function start, never relocated
            let cs_start = reader.read_encoded(self.call_site_encoding, &NoBases)?;
            let cs_len = reader.read_encoded(self.call_site_encoding, &NoBases)?;
            let cs_lpad = reader.read_encoded(self.call_site_encoding, &NoBases)?;
            let cs_action = reader.read_uleb128();

            // Callsite table is sorted by cs_start, so if we've passed the ip, we
            // may stop searching.
            if ip < func_start + cs_start {
                break;
            }
            if ip < func_start + cs_start + cs_len {
                if cs_lpad == 0 {
                    return Ok(None);
                }
                let action = match cs_action {
                    0 => None,
                    n => Some(self.action_table.add(n as usize - 1)),
                };
                return Ok(Some(CallSite {
                    landing_pad: self.lp_start + cs_lpad,
                    action,
                }));
            }
        }
        Ok(None)
    }
}

/// Walks an action chain. Positive filters are catch clauses and are only
/// taken when `handlers_allowed`; zero marks a cleanup; a negative filter (an
/// exception specification) ends the walk unless handlers are being skipped.
///
/// # Safety
/// `record` must point into the action table of a well-formed LSDA.
pub unsafe fn scan_actions(record: *const u8, handlers_allowed: bool) -> ActionScan {
    let mut scan = ActionScan::default();
    let mut record = record;

    loop {
        let mut reader = DwarfReader::new(record);
        let filter = reader.read_sleb128();
        let displacement_at = reader.ptr;
        let displacement = reader.read_sleb128();

        match filter {
            0 => scan.cleanup = true,
            _ if !handlers_allowed => {}
            f if f > 0 => {
                scan.handler = Some(f as c_int);
                return scan;
            }
            _ => break,
        }

        if displacement == 0 {
            break;
        }
        record = displacement_at.offset(displacement as isize);
    }
    scan
}
