//! RISC-V ABI verification and relocation semantics.

use super::{Port, RelocInput, RelocWrite};
use crate::elf_defs::Ehdr;
use crate::error::{self, Result};

pub(super) struct RiscV;

const EF_RISCV_RVC: u32 = 0x1;
const EF_RISCV_FLOAT_ABI_MASK: u32 = 0x6;
const EF_RISCV_FLOAT_ABI_SOFT: u32 = 0x0;
const EF_RISCV_FLOAT_ABI_SINGLE: u32 = 0x2;
const EF_RISCV_FLOAT_ABI_DOUBLE: u32 = 0x4;
const EF_RISCV_RVE: u32 = 0x8;

const R_RISCV_ABS32: u32 = 1;
const R_RISCV_ABS64: u32 = 2;
const R_RISCV_RELATIVE: u32 = 3;
const R_RISCV_JUMP_SLOT: u32 = 5;

impl Port for RiscV {
    fn verify(&self, ehdr: &Ehdr) -> Result<()> {
        let flags = ehdr.e_flags;

        if flags & EF_RISCV_RVC != 0 && !cfg!(target_feature = "c") {
            return Err(error::unsupported(
                "object requires the compressed instruction extension, host build lacks it",
            ));
        }

        let host_float_abi = if cfg!(target_feature = "d") {
            EF_RISCV_FLOAT_ABI_DOUBLE
        } else if cfg!(target_feature = "f") {
            EF_RISCV_FLOAT_ABI_SINGLE
        } else {
            EF_RISCV_FLOAT_ABI_SOFT
        };
        if flags & EF_RISCV_FLOAT_ABI_MASK != host_float_abi {
            return Err(error::unsupported("object's float ABI does not match this build"));
        }

        let wants_rve = flags & EF_RISCV_RVE != 0;
        if wants_rve != cfg!(target_feature = "e") {
            return Err(error::unsupported("object's RVE-ness does not match this build"));
        }

        Ok(())
    }

    fn apply(&self, input: RelocInput) -> Result<RelocWrite> {
        let s = input.sym_value as i64;
        let a = input.addend;
        let b = input.base_diff;

        Ok(match input.r_type {
            R_RISCV_ABS32 => RelocWrite::U32(s.wrapping_add(a) as u32),
            R_RISCV_ABS64 => RelocWrite::U64(s.wrapping_add(a) as u64),
            R_RISCV_RELATIVE => RelocWrite::U64(b.wrapping_add(a) as u64),
            R_RISCV_JUMP_SLOT => RelocWrite::U64(s as u64),
            other => return Err(error::unsupported_relocation(other)),
        })
    }
}
