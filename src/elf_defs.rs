//! Thin, compile-time-selected view over the ELF structures this crate reads.
//!
//! Struct *shapes* come from the `elf` crate (the same dependency the rest of
//! the ecosystem uses for ELF constant and layout definitions); the symbol
//! table entry is hand-defined for both word-size classes because the 32-bit
//! shape isn't exposed by that crate in a form we can read byte-for-byte off
//! the wire.
use bitflags::bitflags;

pub use elf::abi::{
    DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_HASH, DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ,
    DT_NEEDED, DT_NULL, DT_PREINIT_ARRAY, DT_PREINIT_ARRAYSZ, DT_REL, DT_RELA, DT_RELAENT,
    DT_RELASZ, DT_RELENT, DT_RELSZ, DT_STRSZ, DT_STRTAB, DT_SYMTAB, EI_CLASS, EI_DATA,
    EI_VERSION, ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFMAGIC, ET_DYN, ET_EXEC, EV_CURRENT,
    PF_R, PF_W, PF_X, PT_DYNAMIC, PT_LOAD, SHN_ABS, SHN_UNDEF, STB_GLOBAL, STB_LOCAL, STB_WEAK,
};

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        pub const E_CLASS: u8 = ELFCLASS64;
        pub type Ehdr = elf::file::Elf64_Ehdr;
        pub type Phdr = elf::segment::Elf64_Phdr;
        pub type Shdr = elf::section::Elf64_Shdr;
        pub type Dyn = elf::dynamic::Elf64_Dyn;
        pub type Rela = elf::relocation::Elf64_Rela;
        pub type Rel = elf::relocation::Elf64_Rel;
        pub type Sym = Sym64;
        pub const EHDR_SIZE: usize = core::mem::size_of::<Ehdr>();
        pub const PHDR_SIZE: usize = core::mem::size_of::<Phdr>();
        pub const SHDR_SIZE: usize = core::mem::size_of::<Shdr>();
        pub const DYN_SIZE: usize = core::mem::size_of::<Dyn>();
        pub const SYM_SIZE: usize = core::mem::size_of::<Sym>();
        pub const REL_SIZE: usize = core::mem::size_of::<Rel>();
        pub const RELA_SIZE: usize = core::mem::size_of::<Rela>();
    } else {
        pub const E_CLASS: u8 = ELFCLASS32;
        pub type Ehdr = elf::file::Elf32_Ehdr;
        pub type Phdr = elf::segment::Elf32_Phdr;
        pub type Shdr = elf::section::Elf32_Shdr;
        pub type Dyn = elf::dynamic::Elf32_Dyn;
        pub type Rela = elf::relocation::Elf32_Rela;
        pub type Rel = elf::relocation::Elf32_Rel;
        pub type Sym = Sym32;
        pub const EHDR_SIZE: usize = core::mem::size_of::<Ehdr>();
        pub const PHDR_SIZE: usize = core::mem::size_of::<Phdr>();
        pub const SHDR_SIZE: usize = core::mem::size_of::<Shdr>();
        pub const DYN_SIZE: usize = core::mem::size_of::<Dyn>();
        pub const SYM_SIZE: usize = core::mem::size_of::<Sym>();
        pub const REL_SIZE: usize = core::mem::size_of::<Rel>();
        pub const RELA_SIZE: usize = core::mem::size_of::<Rela>();
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub const EM_ARCH: u16 = elf::abi::EM_X86_64;
    } else if #[cfg(target_arch = "riscv64")] {
        pub const EM_ARCH: u16 = elf::abi::EM_RISCV;
    } else if #[cfg(target_arch = "riscv32")] {
        pub const EM_ARCH: u16 = elf::abi::EM_RISCV;
    } else if #[cfg(target_arch = "x86")] {
        pub const EM_ARCH: u16 = elf::abi::EM_386;
    } else {
        compile_error!("kbelf has no architecture port for this target; see src/arch/mod.rs");
    }
}

/// 64-bit symbol table entry (`Elf64_Sym`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Sym64 {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

/// 32-bit symbol table entry (`Elf32_Sym`) — field order differs from the
/// 64-bit shape, which is why this isn't simply a type alias.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Sym32 {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

impl Sym {
    #[inline]
    pub fn st_bind(&self) -> u8 {
        self.st_info >> 4
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.st_value as u64
    }

    #[inline]
    pub fn shndx(&self) -> u16 {
        self.st_shndx
    }

    #[inline]
    pub fn name_index(&self) -> u32 {
        self.st_name
    }
}

bitflags! {
    /// Read/write/execute permissions carried by a `PT_LOAD` segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const R = PF_R;
        const W = PF_W;
        const X = PF_X;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// Width in bytes of one entry in `DT_INIT_ARRAY`/`DT_FINI_ARRAY`/
        /// `DT_PREINIT_ARRAY` for this build's word size.
        pub const PTR_SIZE: usize = 8;
    } else {
        pub const PTR_SIZE: usize = 4;
    }
}

/// Reads a `repr(C)` struct out of a byte buffer that may not be aligned,
/// the way every host read lands in a plain `[u8]` rather than a mapped page.
pub(crate) fn read_struct<T: Copy>(buf: &[u8]) -> T {
    debug_assert!(buf.len() >= core::mem::size_of::<T>());
    unsafe { core::ptr::read_unaligned(buf.as_ptr().cast()) }
}
