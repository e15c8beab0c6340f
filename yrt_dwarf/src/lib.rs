//! Utilities for parsing DWARF-encoded data streams.
//! See <http://www.dwarfstd.org>,
//! DWARF-4 standard, Section 7 - "Data Representation"
//! and the LSB's description of `.eh_frame` pointer encodings.

#![allow(non_upper_case_globals)]


use core::mem;

use thiserror::Error;

pub const DW_EH_PE_omit: u8 = 0xFF;
pub const DW_EH_PE_absptr: u8 = 0x00;

pub const DW_EH_PE_uleb128: u8 = 0x01;
pub const DW_EH_PE_udata2: u8 = 0x02;
pub const DW_EH_PE_udata4: u8 = 0x03;
pub const DW_EH_PE_udata8: u8 = 0x04;
pub const DW_EH_PE_signed: u8 = 0x08;
pub const DW_EH_PE_sleb128: u8 = 0x09;
pub const DW_EH_PE_sdata2: u8 = 0x0A;
pub const DW_EH_PE_sdata4: u8 = 0x0B;
pub const DW_EH_PE_sdata8: u8 = 0x0C;

pub const DW_EH_PE_pcrel: u8 = 0x10;
pub const DW_EH_PE_textrel: u8 = 0x20;
pub const DW_EH_PE_datarel: u8 = 0x30;
pub const DW_EH_PE_funcrel: u8 = 0x40;
pub const DW_EH_PE_aligned: u8 = 0x50;

pub const DW_EH_PE_indirect: u8 = 0x80;

const FORMAT_MASK: u8 = 0x0F;
const APPLICATION_MASK: u8 = 0x70;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwarfError {
    #[error("unknown pointer encoding {0:#04x}")]
    UnknownEncoding(u8),
    #[error("tried to read a value whose encoding is DW_EH_PE_omit")]
    OmittedValue,
    #[error("no relocation base available for encoding {0:#04x}")]
    MissingBase(u8),
    #[error("cannot align to {0} bytes")]
    BadAlignment(usize),
}

pub type Result<T> = std::result::Result<T, DwarfError>;

/// Supplies the bases for text-, data- and function-relative values.
/// Bases are queried only when an encoding asks for them: some unwinders
/// abort when asked for a base they do not track.
pub trait RelocationBases {
    fn text_rel_base(&self) -> Result<usize>;
    fn data_rel_base(&self) -> Result<usize>;
    fn func_rel_base(&self) -> Result<usize>;
}

/// For values that must not be relocated, e.g. call-site offsets.
pub struct NoBases;

impl RelocationBases for NoBases {
    fn text_rel_base(&self) -> Result<usize> {
        Err(DwarfError::MissingBase(DW_EH_PE_textrel))
    }

    fn data_rel_base(&self) -> Result<usize> {
        Err(DwarfError::MissingBase(DW_EH_PE_datarel))
    }

    fn func_rel_base(&self) -> Result<usize> {
        Err(DwarfError::MissingBase(DW_EH_PE_funcrel))
    }
}

/// Size in bytes of a fixed-width encoded value. LEB128 shapes have no fixed
/// size and are rejected.
pub fn encoded_size(encoding: u8) -> Result<usize> {
    if encoding == DW_EH_PE_omit {
        return Ok(0);
    }

    match encoding & 0x07 {
        DW_EH_PE_absptr => Ok(mem::size_of::<usize>()),
        DW_EH_PE_udata2 => Ok(2),
        DW_EH_PE_udata4 => Ok(4),
        DW_EH_PE_udata8 => Ok(8),
        _ => Err(DwarfError::UnknownEncoding(encoding)),
    }
}

/// The base an encoded value is relative to, excluding `pcrel` whose base is
/// the address of the value itself.
pub fn encoded_base(encoding: u8, bases: &dyn RelocationBases) -> Result<usize> {
    if encoding == DW_EH_PE_omit {
        return Ok(0);
    }

    match encoding & APPLICATION_MASK {
        DW_EH_PE_absptr | DW_EH_PE_pcrel | DW_EH_PE_aligned => Ok(0),
        DW_EH_PE_textrel => bases.text_rel_base(),
        DW_EH_PE_datarel => bases.data_rel_base(),
        DW_EH_PE_funcrel => bases.func_rel_base(),
        _ => Err(DwarfError::UnknownEncoding(encoding)),
    }
}

pub struct DwarfReader {
    pub ptr: *const u8,
}

#[repr(C, packed)]
struct Unaligned<T>(T);

impl DwarfReader {
    pub fn new(ptr: *const u8) -> DwarfReader {
        DwarfReader { ptr }
    }

    // DWARF streams are packed, so e.g., a u32 would not necessarily be aligned
    // on a 4-byte boundary. This may cause problems on platforms with strict
    // alignment requirements. By wrapping data in a "packed" struct, we are
    // telling the backend to generate "misalignment-safe" code.
    pub unsafe fn read<T: Copy>(&mut self) -> T {
        let Unaligned(result) = self.ptr.cast::<Unaligned<T>>().read();
        self.ptr = self.ptr.add(mem::size_of::<T>());
        result
    }

    // ULEB128 and SLEB128 encodings are defined in Section 7.6 - "Variable
    // Length Data". Groups past the 64th bit are consumed and dropped.
    pub unsafe fn read_uleb128(&mut self) -> u64 {
        let mut shift: u32 = 0;
        let mut result: u64 = 0;
        loop {
            let byte = self.read::<u8>();
            if shift < u64::BITS {
                result |= ((byte & 0x7F) as u64) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        result
    }

    pub unsafe fn read_sleb128(&mut self) -> i64 {
        let mut shift: u32 = 0;
        let mut result: u64 = 0;
        let mut byte: u8;
        loop {
            byte = self.read::<u8>();
            if shift < u64::BITS {
                result |= ((byte & 0x7F) as u64) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        // sign-extend
        if shift < u64::BITS && (byte & 0x40) != 0 {
            result |= u64::MAX << shift;
        }
        result as i64
    }

    /// Reads one value of the given `DW_EH_PE_*` encoding. A zero value is
    /// returned as-is, without relocation, so that null pointers stay null.
    pub unsafe fn read_encoded(&mut self, encoding: u8, bases: &dyn RelocationBases) -> Result<usize> {
        if encoding == DW_EH_PE_omit {
            return Err(DwarfError::OmittedValue);
        }

        // DW_EH_PE_aligned implies it's an absolute pointer value
        if encoding == DW_EH_PE_aligned {
            self.ptr = round_up(self.ptr as usize, mem::size_of::<usize>())? as *const u8;
            return Ok(self.read::<usize>());
        }

        let value_addr = self.ptr as usize;
        let value = match encoding & FORMAT_MASK {
            DW_EH_PE_absptr => self.read::<usize>(),
            DW_EH_PE_uleb128 => self.read_uleb128() as usize,
            DW_EH_PE_udata2 => self.read::<u16>() as usize,
            DW_EH_PE_udata4 => self.read::<u32>() as usize,
            DW_EH_PE_udata8 => self.read::<u64>() as usize,
            DW_EH_PE_sleb128 => self.read_sleb128() as usize,
            DW_EH_PE_sdata2 => self.read::<i16>() as usize,
            DW_EH_PE_sdata4 => self.read::<i32>() as usize,
            DW_EH_PE_sdata8 => self.read::<i64>() as usize,
            _ => return Err(DwarfError::UnknownEncoding(encoding)),
        };

        if value == 0 {
            return Ok(0);
        }

        let mut result = match encoding & APPLICATION_MASK {
            // relative to address of the encoded value, despite the name
            DW_EH_PE_pcrel => value_addr.wrapping_add(value),
            _ => encoded_base(encoding, bases)?.wrapping_add(value),
        };

        if encoding & DW_EH_PE_indirect != 0 {
            result = (result as *const usize).read_unaligned();
        }

        Ok(result)
    }
}

#[inline]
fn round_up(unrounded: usize, align: usize) -> Result<usize> {
    if align.is_power_of_two() {
        Ok((unrounded + align - 1) & !(align - 1))
    } else {
        Err(DwarfError::BadAlignment(align))
    }
}
