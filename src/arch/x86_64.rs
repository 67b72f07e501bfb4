//! x86-64 ABI verification and relocation semantics.

use super::{Port, RelocInput, RelocWrite};
use crate::elf_defs::Ehdr;
use crate::error::{self, Result};

pub(super) struct X86_64;

// There's no x86-64-specific e_flags content to check; the generic class,
// endianness and machine checks in `FileContext::open` are all this ABI needs.
const R_X86_64_NONE: u32 = 0;
const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_COPY: u32 = 5;
const R_X86_64_GLOB_DAT: u32 = 6;
const R_X86_64_JUMP_SLOT: u32 = 7;
const R_X86_64_RELATIVE: u32 = 8;
const R_X86_64_32: u32 = 10;
const R_X86_64_32S: u32 = 11;
const R_X86_64_16: u32 = 12;
const R_X86_64_8: u32 = 14;

impl Port for X86_64 {
    fn verify(&self, _ehdr: &Ehdr) -> Result<()> {
        Ok(())
    }

    fn apply(&self, input: RelocInput) -> Result<RelocWrite> {
        let s = input.sym_value as i64;
        let a = input.addend;
        let b = input.base_diff;

        Ok(match input.r_type {
            R_X86_64_NONE => RelocWrite::None,
            R_X86_64_64 => RelocWrite::U64(s.wrapping_add(a) as u64),
            R_X86_64_PC32 => {
                let p = input.place as i64;
                RelocWrite::U32(s.wrapping_add(a).wrapping_sub(p) as u32)
            }
            R_X86_64_COPY => RelocWrite::None,
            R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => RelocWrite::U64(s as u64),
            R_X86_64_RELATIVE => RelocWrite::U64(b.wrapping_add(a) as u64),
            R_X86_64_32 | R_X86_64_32S => RelocWrite::U32(s.wrapping_add(a) as u32),
            R_X86_64_16 => RelocWrite::U16(s.wrapping_add(a) as u16),
            R_X86_64_8 => RelocWrite::U8(s.wrapping_add(a) as u8),
            other => return Err(error::unsupported_relocation(other)),
        })
    }
}
