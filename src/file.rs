//! Opening and validating an ELF file, and reading its program headers.
//!
//! Nothing here loads or relocates anything; a [`FileContext`] only proves
//! that a file has a well-formed ELF header matching this build's class,
//! endianness and machine, and lets callers pull the program header table
//! out on demand rather than buffering the whole thing up front.

use alloc::borrow::ToOwned;
use alloc::string::String;

use crate::elf_defs::{
    self, read_struct, Ehdr, Phdr, E_CLASS, EHDR_SIZE, EM_ARCH, ET_DYN, ET_EXEC, PHDR_SIZE,
    SHDR_SIZE,
};
use crate::error::{self, Result};
use crate::host::{Host, HostFile};

/// An opened, header-validated ELF file.
pub struct FileContext<H: Host> {
    file: H::File,
    path: String,
    name_start: usize,
    header: Ehdr,
}

impl<H: Host> FileContext<H> {
    /// Opens `path` through the host and validates the ELF header. Rejects
    /// anything that isn't a well-formed `ET_EXEC`/`ET_DYN` for this build's
    /// word size, endianness and machine.
    pub fn open(host: &mut H, path: &str) -> Result<Self> {
        let mut file = host.open(path)?;

        let mut raw = [0u8; EHDR_SIZE];
        let n = file.read_at(0, &mut raw)?;
        if n != EHDR_SIZE {
            return Err(error::malformed("file shorter than an ELF header"));
        }

        if raw[0] != elf_defs::ELFMAGIC[0]
            || raw[1] != elf_defs::ELFMAGIC[1]
            || raw[2] != elf_defs::ELFMAGIC[2]
            || raw[3] != elf_defs::ELFMAGIC[3]
        {
            return Err(error::malformed("bad ELF magic"));
        }
        if raw[elf_defs::EI_CLASS as usize] != E_CLASS {
            return Err(error::malformed("ELF class does not match this build"));
        }
        if raw[elf_defs::EI_DATA as usize] != elf_defs::ELFDATA2LSB {
            return Err(error::malformed("only little-endian ELF is supported"));
        }
        if raw[elf_defs::EI_VERSION as usize] != elf_defs::EV_CURRENT as u8 {
            return Err(error::malformed("unrecognized ELF ident version"));
        }

        let header: Ehdr = read_struct(&raw);

        if header.e_version != elf_defs::EV_CURRENT {
            return Err(error::malformed("unrecognized ELF version"));
        }
        if header.e_type != ET_EXEC && header.e_type != ET_DYN {
            return Err(error::malformed("not an executable or shared object"));
        }
        if header.e_machine != EM_ARCH {
            return Err(error::unsupported("machine does not match this build's architecture"));
        }
        if header.e_ehsize as usize != EHDR_SIZE {
            return Err(error::malformed("unexpected ELF header size"));
        }
        if header.e_phentsize as usize != PHDR_SIZE {
            return Err(error::malformed("unexpected program header entry size"));
        }
        // Section headers are never read at load time (§6), but a present
        // table still has to agree with this build's struct layout, the same
        // way the header/program-header entry sizes above do.
        if header.e_shnum != 0 && header.e_shentsize as usize != SHDR_SIZE {
            return Err(error::malformed("unexpected section header entry size"));
        }

        crate::arch::port().verify(&header)?;

        let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);

        Ok(FileContext {
            file,
            path: path.to_owned(),
            name_start,
            header,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.path[self.name_start..]
    }

    pub fn header(&self) -> &Ehdr {
        &self.header
    }

    pub fn entry(&self) -> u64 {
        self.header.e_entry
    }

    pub fn prog_len(&self) -> usize {
        self.header.e_phnum as usize
    }

    /// Reads program header entry `index`, failing if it's out of range.
    pub fn prog_get(&mut self, index: usize) -> Result<Phdr> {
        if index >= self.prog_len() {
            return Err(error::structural("program header index out of range"));
        }
        let offset = self.header.e_phoff + (index * PHDR_SIZE) as u64;
        let mut raw = [0u8; PHDR_SIZE];
        let n = self.file.read_at(offset, &mut raw)?;
        if n != PHDR_SIZE {
            return Err(error::io_error("short read of program header"));
        }
        Ok(read_struct(&raw))
    }

    pub(crate) fn file_mut(&mut self) -> &mut H::File {
        &mut self.file
    }
}
