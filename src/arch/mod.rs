//! Architecture-specific pieces of the loader: ABI verification and
//! relocation application. Exactly one of the submodules below is compiled
//! in, selected by `target_arch`.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(any(target_arch = "riscv64", target_arch = "riscv32"))]
mod riscv;

use crate::elf_defs::Ehdr;
use crate::error::Result;

/// Inputs to one relocation's application, already resolved to plain
/// numbers: symbol resolution and addend decoding happen in
/// [`crate::relocation`], leaving the port only the arithmetic and the
/// choice of write width that's actually architecture-specific.
#[derive(Debug, Clone, Copy)]
pub struct RelocInput {
    pub r_type: u32,
    /// `S`: the resolved symbol value, or 0 for relocations that don't
    /// reference a symbol.
    pub sym_value: u64,
    /// `A`: the addend.
    pub addend: i64,
    /// `P`: the virtual address of the relocation's own location, needed by
    /// PC-relative relocation types.
    pub place: u64,
    /// `B`: the difference between an object's real and requested load
    /// base, needed by `RELATIVE`-style relocation types.
    pub base_diff: i64,
}

/// The value a relocation resolves to, tagged with how many bytes of target
/// memory it's written to.
#[derive(Debug, Clone, Copy)]
pub enum RelocWrite {
    /// The relocation is a recognized no-op (e.g. `R_*_NONE`, `R_*_COPY`
    /// without copy-relocation support).
    None,
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

/// Per-architecture ABI verification and relocation semantics.
pub trait Port {
    /// Checks ABI details the generic header validation in
    /// [`crate::file::FileContext::open`] doesn't know about (e.g. RISC-V's
    /// compressed-instruction and float-ABI flags).
    fn verify(&self, ehdr: &Ehdr) -> Result<()>;

    /// Computes the value and write width for one relocation, or an error
    /// if this port doesn't implement that relocation type.
    fn apply(&self, input: RelocInput) -> Result<RelocWrite>;
}

#[cfg(target_arch = "x86_64")]
pub fn port() -> &'static dyn Port {
    &x86_64::X86_64
}

#[cfg(any(target_arch = "riscv64", target_arch = "riscv32"))]
pub fn port() -> &'static dyn Port {
    &riscv::RiscV
}

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Decodes the symbol table index out of a 64-bit `r_info` field.
        pub fn r_sym(info: u64) -> u32 {
            (info >> 32) as u32
        }

        /// Decodes the relocation type out of a 64-bit `r_info` field.
        pub fn r_type(info: u64) -> u32 {
            (info & 0xffff_ffff) as u32
        }

        /// Decodes `(symbol index, relocation type)` out of one `r_info` field.
        pub fn r_info_parts(info: u64) -> (u32, u32) {
            (r_sym(info), r_type(info))
        }
    } else {
        /// Decodes the symbol table index out of a 32-bit `r_info` field.
        pub fn r_sym(info: u32) -> u32 {
            info >> 8
        }

        /// Decodes the relocation type out of a 32-bit `r_info` field.
        pub fn r_type(info: u32) -> u32 {
            info & 0xff
        }

        /// Decodes `(symbol index, relocation type)` out of one `r_info` field.
        pub fn r_info_parts(info: u32) -> (u32, u32) {
            (r_sym(info), r_type(info))
        }
    }
}
