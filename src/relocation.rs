//! Symbol resolution and relocation application across a graph of loaded
//! instances and the host's built-in libraries.

use alloc::string::ToString;
use alloc::vec::Vec;

use crate::address::VAddr;
use crate::arch::{self, Port, RelocInput, RelocWrite};
use crate::elf_defs::{
    self, read_struct, Rela, DT_RELA, DT_RELAENT, DT_RELASZ, RELA_SIZE, SHN_ABS, SHN_UNDEF,
    STB_LOCAL, STB_WEAK,
};
use crate::error::{self, Result};
use crate::host::{BuiltinLibrary, Host};
use crate::instance::Instance;

#[cfg(feature = "rel")]
use crate::elf_defs::{Rel, DT_REL, DT_RELENT, DT_RELSZ, REL_SIZE};

/// Everything a relocation pass can resolve symbols against: the host's
/// built-in libraries (checked first, as if they were always already
/// loaded) and every instance registered so far, in registration order.
pub struct RelocationContext<'a> {
    builtins: Vec<&'a BuiltinLibrary>,
    instances: Vec<&'a Instance>,
}

impl<'a> RelocationContext<'a> {
    pub fn new() -> Self {
        RelocationContext {
            builtins: Vec::new(),
            instances: Vec::new(),
        }
    }

    pub fn add_builtin(&mut self, lib: &'a BuiltinLibrary) {
        self.builtins.push(lib);
    }

    pub fn add(&mut self, inst: &'a Instance) {
        self.instances.push(inst);
    }

    /// Resolves `name` against builtins first, then every registered
    /// instance in order. A `STB_GLOBAL` (or `STB_GNU_UNIQUE`) definition
    /// wins outright; a `STB_WEAK` definition is used only if no global one
    /// is ever found.
    fn find_sym(&self, name: &str) -> Option<u64> {
        for lib in &self.builtins {
            if let Some(sym) = lib.find_symbol(name) {
                return Some(sym.vaddr.get());
            }
        }

        let mut weak: Option<u64> = None;
        for inst in &self.instances {
            for sym in inst.dynsym().iter().skip(1) {
                if sym.shndx() == SHN_UNDEF {
                    continue;
                }
                let bind = sym.st_bind();
                if bind == STB_LOCAL {
                    continue;
                }
                if inst.dynstr_at(sym.name_index()) != name {
                    continue;
                }
                let value = Self::sym_value(inst, sym);
                if bind == STB_WEAK {
                    weak.get_or_insert(value);
                    continue;
                }
                return Some(value);
            }
        }
        weak
    }

    fn sym_value(inst: &Instance, sym: &elf_defs::Sym) -> u64 {
        if sym.shndx() == SHN_ABS as u16 {
            sym.value()
        } else {
            inst.req_to_real(VAddr::new(sym.value()))
                .map(|v| v.get())
                .unwrap_or(0)
        }
    }

    /// Applies every relocation listed in `inst`'s dynamic section,
    /// resolving symbols against this context (which should already
    /// include every instance `inst` may reference, `inst` itself among
    /// them for self-referential relocations).
    pub fn perform<H: Host>(&self, host: &mut H, inst: &Instance) -> Result<()> {
        let port = arch::port();

        let mut rela_vaddr = None;
        let mut rela_size = None;
        let mut rela_ent = None;
        #[cfg(feature = "rel")]
        let mut rel_vaddr = None;
        #[cfg(feature = "rel")]
        let mut rel_size = None;
        #[cfg(feature = "rel")]
        let mut rel_ent = None;

        for entry in inst.dynamic() {
            let tag = entry.d_tag as i64;
            let val = entry.d_un as u64;
            if tag == DT_RELA as i64 {
                rela_vaddr = Some(val);
            } else if tag == DT_RELASZ as i64 {
                rela_size = Some(val);
            } else if tag == DT_RELAENT as i64 {
                rela_ent = Some(val);
            }
            #[cfg(feature = "rel")]
            {
                if tag == DT_REL as i64 {
                    rel_vaddr = Some(val);
                } else if tag == DT_RELSZ as i64 {
                    rel_size = Some(val);
                } else if tag == DT_RELENT as i64 {
                    rel_ent = Some(val);
                }
            }
        }

        if let (Some(vaddr), Some(size), Some(ent)) = (rela_vaddr, rela_size, rela_ent) {
            if ent != RELA_SIZE as u64 {
                return Err(error::structural("DT_RELAENT does not match this build's Elf_Rela size"));
            }
            self.rela_perform(host, inst, port, vaddr, size)?;
        } else if rela_vaddr.is_some() || rela_size.is_some() {
            // A partial RELA triple isn't one of the paired-tag invariants
            // (invariant 3 only covers SYMTAB/HASH, STRTAB/STRSZ and the
            // *_ARRAY/*_ARRAYSZ pairs); kbelf_reloc.c's kbelf_reloc_perform
            // just warns and skips the table in this case rather than
            // failing the whole load.
            #[cfg(feature = "log")]
            log::warn!("DT_RELA present without a complete RELA triple, skipping");
        }

        #[cfg(feature = "rel")]
        if let (Some(vaddr), Some(size), Some(ent)) = (rel_vaddr, rel_size, rel_ent) {
            if ent != REL_SIZE as u64 {
                return Err(error::structural("DT_RELENT does not match this build's Elf_Rel size"));
            }
            self.rel_perform(host, inst, port, vaddr, size)?;
        } else if rel_vaddr.is_some() || rel_size.is_some() {
            #[cfg(feature = "log")]
            log::warn!("DT_REL present without a complete REL triple, skipping");
        }

        Ok(())
    }

    fn rela_perform<H: Host>(
        &self,
        host: &mut H,
        inst: &Instance,
        port: &dyn Port,
        vaddr: u64,
        size: u64,
    ) -> Result<()> {
        let count = size as usize / RELA_SIZE;
        let laddr = inst
            .req_to_laddr(VAddr::new(vaddr))
            .ok_or_else(|| error::structural("DT_RELA does not fall within any loaded segment"))?;

        let mut buf = [0u8; RELA_SIZE];
        for i in 0..count {
            host.copy_from_user(laddr.wrapping_add((i * RELA_SIZE) as u64), &mut buf)?;
            let rela: Rela = read_struct(&buf);
            self.apply_one(host, inst, port, rela.r_offset, arch::r_info_parts(rela.r_info), rela.r_addend as i64)?;
        }
        Ok(())
    }

    #[cfg(feature = "rel")]
    fn rel_perform<H: Host>(
        &self,
        host: &mut H,
        inst: &Instance,
        port: &dyn Port,
        vaddr: u64,
        size: u64,
    ) -> Result<()> {
        let count = size as usize / REL_SIZE;
        let laddr = inst
            .req_to_laddr(VAddr::new(vaddr))
            .ok_or_else(|| error::structural("DT_REL does not fall within any loaded segment"))?;

        let mut buf = [0u8; REL_SIZE];
        for i in 0..count {
            host.copy_from_user(laddr.wrapping_add((i * REL_SIZE) as u64), &mut buf)?;
            let rel: Rel = read_struct(&buf);
            let (sym, ty) = arch::r_info_parts(rel.r_info);

            let place_laddr = inst
                .req_to_laddr(VAddr::new(rel.r_offset))
                .ok_or_else(|| error::structural("relocation offset does not fall within any loaded segment"))?;
            let mut existing = [0u8; elf_defs::PTR_SIZE];
            host.copy_from_user(place_laddr, &mut existing)?;
            let addend = if elf_defs::PTR_SIZE == 8 {
                i64::from_ne_bytes(existing)
            } else {
                i32::from_ne_bytes([existing[0], existing[1], existing[2], existing[3]]) as i64
            };

            self.apply_one(host, inst, port, rel.r_offset, (sym, ty), addend)?;
        }
        Ok(())
    }

    fn apply_one<H: Host>(
        &self,
        host: &mut H,
        inst: &Instance,
        port: &dyn Port,
        r_offset: u64,
        (sym_index, r_type): (u32, u32),
        addend: i64,
    ) -> Result<()> {
        let sym_value = if sym_index == 0 {
            0
        } else {
            let sym = *inst
                .dynsym()
                .get(sym_index as usize)
                .ok_or_else(|| error::structural("relocation symbol index out of range"))?;
            let name = inst.dynstr_at(sym.name_index()).to_string();
            self.find_sym(&name).ok_or_else(|| {
                #[cfg(feature = "log")]
                log::warn!("unable to find symbol '{name}'");
                error::resolution(alloc::format!("unable to resolve symbol '{name}'"))
            })?
        };

        #[cfg(feature = "log")]
        log::trace!("relocation type {r_type} at {:#x}, symbol value {sym_value:#x}", r_offset);

        let place = inst.req_to_real(VAddr::new(r_offset)).map(|v| v.get()).unwrap_or(r_offset);
        let base_diff = Self::base_diff_for(inst, VAddr::new(r_offset)).unwrap_or(0);

        let write = port.apply(RelocInput {
            r_type,
            sym_value,
            addend,
            place,
            base_diff,
        })?;

        let dst = inst
            .req_to_laddr(VAddr::new(r_offset))
            .ok_or_else(|| error::structural("relocation offset does not fall within any loaded segment"))?;

        match write {
            RelocWrite::None => {}
            RelocWrite::U8(v) => host.copy_to_user(dst, &v.to_ne_bytes())?,
            RelocWrite::U16(v) => host.copy_to_user(dst, &v.to_ne_bytes())?,
            RelocWrite::U32(v) => host.copy_to_user(dst, &v.to_ne_bytes())?,
            RelocWrite::U64(v) => host.copy_to_user(dst, &v.to_ne_bytes())?,
        }
        Ok(())
    }

    fn base_diff_for(inst: &Instance, vaddr: VAddr) -> Option<i64> {
        inst.segments()
            .iter()
            .find(|s| s.vaddr_req_range().contains(vaddr))
            .map(|s| s.vaddr_real.get().wrapping_sub(s.vaddr_req.get()) as i64)
    }
}

impl<'a> Default for RelocationContext<'a> {
    fn default() -> Self {
        Self::new()
    }
}
