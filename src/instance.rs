//! Loading one ELF file's segments into target memory and exposing the
//! dynamic-section data the rest of the crate needs: needed libraries,
//! symbol/string tables, lifecycle function pointers, and the six-way
//! address translation between a segment's requested address, its real
//! address, its physical address and its loader-visible address.

use alloc::string::String;
use alloc::vec::Vec;
use core::str;

use crate::address::{LAddr, PAddr, VAddr};
use crate::elf_defs::{
    self, read_struct, Dyn, Phdr, Sym, DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_HASH, DT_INIT,
    DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_NEEDED, DT_NULL, DT_PREINIT_ARRAY, DT_PREINIT_ARRAYSZ,
    DT_STRSZ, DT_STRTAB, DT_SYMTAB, DYN_SIZE, PTR_SIZE, PT_DYNAMIC, PT_LOAD, SYM_SIZE,
};
use crate::error::{self, Result};
use crate::file::FileContext;
use crate::host::{Host, SegmentRequest};
use crate::segment::Segment;

/// An array pointer found in the dynamic section: a base virtual address
/// and an entry count, resolved lazily since reading it means a round trip
/// through [`Host::copy_from_user`].
#[derive(Debug, Clone, Copy)]
struct ArrayRef {
    vaddr: VAddr,
    count: u64,
}

/// One ELF object's segments, loaded and ready to be relocated.
pub struct Instance {
    path: String,
    name_start: usize,
    segments: Vec<Segment>,
    entry: VAddr,
    init_func: Option<VAddr>,
    fini_func: Option<VAddr>,
    preinit_array: Option<ArrayRef>,
    init_array: Option<ArrayRef>,
    fini_array: Option<ArrayRef>,
    dynamic: Vec<Dyn>,
    dynstr: Vec<u8>,
    dynsym: Vec<Sym>,
    needed_offsets: Vec<u64>,
}

impl Instance {
    /// Loads every `PT_LOAD` segment of `file` through `host`, then parses
    /// its dynamic section (if any). Consumes `file`: once segments are
    /// loaded there's no further use for direct file reads, since dynamic
    /// section parsing continues from loader-visible memory like the rest
    /// of the crate's address-space model expects.
    pub fn load<H: Host>(host: &mut H, mut file: FileContext<H>) -> Result<Self> {
        let path: String = file.path().into();
        let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);

        let mut phdrs = Vec::new();
        for i in 0..file.prog_len() {
            phdrs.push(file.prog_get(i)?);
        }

        let mut segments = Vec::new();
        for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
            segments.push(Self::load_segment(host, &mut file, phdr)?);
        }

        let entry = VAddr::new(file.entry());

        let dynamic_phdr = phdrs.iter().find(|p| p.p_type == PT_DYNAMIC);

        let mut inst = Instance {
            path,
            name_start,
            segments,
            entry,
            init_func: None,
            fini_func: None,
            preinit_array: None,
            init_array: None,
            fini_array: None,
            dynamic: Vec::new(),
            dynstr: Vec::new(),
            dynsym: Vec::new(),
            needed_offsets: Vec::new(),
        };

        // Translate to the real V the segment allocator actually placed this
        // object at; for an `ET_EXEC` file (or an `ET_DYN` the host loaded at
        // its requested base) this is a no-op, but a rebased `ET_DYN` needs
        // the entrypoint adjusted the same way every other address in it is.
        if entry.get() != 0 {
            if let Some(real) = inst.req_to_real(entry) {
                inst.entry = real;
            }
        }

        if let Some(phdr) = dynamic_phdr {
            inst.load_dynamic(host, phdr)?;
        }

        Ok(inst)
    }

    fn load_segment<H: Host>(
        host: &mut H,
        file: &mut FileContext<H>,
        phdr: &Phdr,
    ) -> Result<Segment> {
        if phdr.p_memsz < phdr.p_filesz {
            return Err(error::structural("segment file size exceeds its memory size"));
        }

        let flags = elf_defs::SegmentFlags::from_bits_truncate(phdr.p_flags);
        let req = SegmentRequest {
            vaddr_req: VAddr::new(phdr.p_vaddr),
            size: phdr.p_memsz,
            align: phdr.p_align,
            flags,
        };
        let alloc = host.alloc_segment(req)?;

        #[cfg(feature = "log")]
        log::trace!(
            "segment vaddr_req={:#x} size={:#x} -> laddr={:#x} paddr={:#x}",
            phdr.p_vaddr,
            phdr.p_memsz,
            alloc.laddr.get(),
            alloc.paddr.get()
        );

        let mut offset = 0u64;
        let mut buf = [0u8; 4096];
        while offset < phdr.p_filesz {
            let chunk = core::cmp::min(buf.len() as u64, phdr.p_filesz - offset) as usize;
            let n = file.file_mut().read_at(phdr.p_offset + offset, &mut buf[..chunk])?;
            if n != chunk {
                host.free_segment(alloc);
                return Err(error::io_error("short read while copying segment contents"));
            }
            host.copy_to_user(alloc.laddr.wrapping_add(offset), &buf[..chunk])?;
            offset += chunk as u64;
        }
        if phdr.p_memsz > phdr.p_filesz {
            let zero = [0u8; 4096];
            let mut tail = phdr.p_filesz;
            while tail < phdr.p_memsz {
                let chunk = core::cmp::min(zero.len() as u64, phdr.p_memsz - tail) as usize;
                host.copy_to_user(alloc.laddr.wrapping_add(tail), &zero[..chunk])?;
                tail += chunk as u64;
            }
        }

        Ok(Segment {
            vaddr_req: VAddr::new(phdr.p_vaddr),
            vaddr_real: alloc.vaddr_real,
            paddr: alloc.paddr,
            laddr: alloc.laddr,
            size: phdr.p_memsz,
            file_off: phdr.p_offset,
            file_size: phdr.p_filesz,
            flags,
            alloc_cookie: alloc.cookie,
        })
    }

    fn load_dynamic<H: Host>(&mut self, host: &mut H, phdr: &Phdr) -> Result<()> {
        let count = phdr.p_memsz as usize / DYN_SIZE;
        let dyn_laddr = self
            .req_to_laddr(VAddr::new(phdr.p_vaddr))
            .ok_or_else(|| error::structural("PT_DYNAMIC does not fall within any loaded segment"))?;

        let mut strtab_vaddr = None;
        let mut strtab_size = None;
        let mut hash_vaddr = None;
        let mut symtab_vaddr = None;
        let mut init_array_vaddr = None;
        let mut init_array_size = None;
        let mut fini_array_vaddr = None;
        let mut fini_array_size = None;
        let mut preinit_array_vaddr = None;
        let mut preinit_array_size = None;

        let mut buf = [0u8; DYN_SIZE];
        for i in 0..count {
            host.copy_from_user(dyn_laddr.wrapping_add((i * DYN_SIZE) as u64), &mut buf)?;
            let entry: Dyn = read_struct(&buf);
            self.dynamic.push(entry);

            let tag = entry.d_tag as i64;
            let val = entry.d_un as u64;
            if tag == DT_NULL as i64 {
                break;
            } else if tag == DT_NEEDED as i64 {
                self.needed_offsets.push(val);
            } else if tag == DT_STRTAB as i64 {
                strtab_vaddr = Some(val);
            } else if tag == DT_STRSZ as i64 {
                strtab_size = Some(val);
            } else if tag == DT_HASH as i64 {
                hash_vaddr = Some(val);
            } else if tag == DT_SYMTAB as i64 {
                symtab_vaddr = Some(val);
            } else if tag == DT_INIT as i64 {
                self.init_func = Some(VAddr::new(val));
            } else if tag == DT_FINI as i64 {
                self.fini_func = Some(VAddr::new(val));
            } else if tag == DT_INIT_ARRAY as i64 {
                init_array_vaddr = Some(val);
            } else if tag == DT_INIT_ARRAYSZ as i64 {
                init_array_size = Some(val);
            } else if tag == DT_FINI_ARRAY as i64 {
                fini_array_vaddr = Some(val);
            } else if tag == DT_FINI_ARRAYSZ as i64 {
                fini_array_size = Some(val);
            } else if tag == DT_PREINIT_ARRAY as i64 {
                preinit_array_vaddr = Some(val);
            } else if tag == DT_PREINIT_ARRAYSZ as i64 {
                preinit_array_size = Some(val);
            }
        }

        if init_array_vaddr.is_some() != init_array_size.is_some() {
            return Err(error::structural("DT_INIT_ARRAY without matching DT_INIT_ARRAYSZ"));
        }
        if fini_array_vaddr.is_some() != fini_array_size.is_some() {
            return Err(error::structural("DT_FINI_ARRAY without matching DT_FINI_ARRAYSZ"));
        }
        if preinit_array_vaddr.is_some() != preinit_array_size.is_some() {
            return Err(error::structural("DT_PREINIT_ARRAY without matching DT_PREINIT_ARRAYSZ"));
        }
        if strtab_vaddr.is_some() != strtab_size.is_some() {
            return Err(error::structural("DT_STRTAB without matching DT_STRSZ"));
        }
        if symtab_vaddr.is_some() != hash_vaddr.is_some() {
            return Err(error::structural(
                "DT_SYMTAB present without DT_HASH (or vice versa): cannot size the symbol table",
            ));
        }

        self.init_array = init_array_vaddr.map(|v| ArrayRef {
            vaddr: VAddr::new(v),
            count: init_array_size.unwrap_or(0) / PTR_SIZE as u64,
        });
        self.fini_array = fini_array_vaddr.map(|v| ArrayRef {
            vaddr: VAddr::new(v),
            count: fini_array_size.unwrap_or(0) / PTR_SIZE as u64,
        });
        self.preinit_array = preinit_array_vaddr.map(|v| ArrayRef {
            vaddr: VAddr::new(v),
            count: preinit_array_size.unwrap_or(0) / PTR_SIZE as u64,
        });

        if let (Some(vaddr), Some(size)) = (strtab_vaddr, strtab_size) {
            let laddr = self
                .req_to_laddr(VAddr::new(vaddr))
                .ok_or_else(|| error::structural("DT_STRTAB does not fall within any loaded segment"))?;
            let mut strtab = alloc::vec![0u8; size as usize];
            host.copy_from_user(laddr, &mut strtab)?;
            self.dynstr = strtab;
        } else if !self.needed_offsets.is_empty() {
            return Err(error::structural("DT_NEEDED present without a string table"));
        }

        if let (Some(symtab), Some(hash)) = (symtab_vaddr, hash_vaddr) {
            let hash_laddr = self
                .req_to_laddr(VAddr::new(hash))
                .ok_or_else(|| error::structural("DT_HASH does not fall within any loaded segment"))?;
            let mut header = [0u8; 8];
            host.copy_from_user(hash_laddr, &mut header)?;
            let nchain = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]);

            let symtab_laddr = self
                .req_to_laddr(VAddr::new(symtab))
                .ok_or_else(|| error::structural("DT_SYMTAB does not fall within any loaded segment"))?;
            let mut syms = Vec::with_capacity(nchain as usize);
            let mut sym_buf = [0u8; SYM_SIZE];
            for i in 0..nchain as u64 {
                host.copy_from_user(symtab_laddr.wrapping_add(i * SYM_SIZE as u64), &mut sym_buf)?;
                syms.push(read_struct(&sym_buf));
            }
            self.dynsym = syms;
        }

        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.path[self.name_start..]
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn dynamic(&self) -> &[Dyn] {
        &self.dynamic
    }

    pub fn dynsym(&self) -> &[Sym] {
        &self.dynsym
    }

    pub fn entrypoint(&self) -> VAddr {
        self.entry
    }

    /// Names of this object's `DT_NEEDED` dependencies, in the order they
    /// appear in the dynamic section.
    pub fn needed_libs(&self) -> impl Iterator<Item = &str> + '_ {
        self.needed_offsets.iter().map(move |&off| self.dynstr_at(off))
    }

    pub(crate) fn dynstr_at(&self, offset: u64) -> &str {
        let start = offset as usize;
        if start >= self.dynstr.len() {
            return "";
        }
        let end = self.dynstr[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(self.dynstr.len());
        str::from_utf8(&self.dynstr[start..end]).unwrap_or("")
    }

    // -- address translation -------------------------------------------
    //
    // Every query is a linear scan over this instance's (typically small)
    // segment list, matching on the address space the caller is querying
    // from and returning the same offset translated into the address space
    // the caller wants.

    pub fn req_to_laddr(&self, vaddr: VAddr) -> Option<LAddr> {
        self.segments
            .iter()
            .find(|s| s.vaddr_req_range().contains(vaddr))
            .map(|s| s.laddr.wrapping_add(vaddr.offset_from(s.vaddr_req)))
    }

    pub fn req_to_paddr(&self, vaddr: VAddr) -> Option<PAddr> {
        self.segments
            .iter()
            .find(|s| s.vaddr_req_range().contains(vaddr))
            .map(|s| s.paddr.wrapping_add(vaddr.offset_from(s.vaddr_req)))
    }

    pub fn req_to_real(&self, vaddr: VAddr) -> Option<VAddr> {
        self.segments
            .iter()
            .find(|s| s.vaddr_req_range().contains(vaddr))
            .map(|s| s.vaddr_real.wrapping_add(vaddr.offset_from(s.vaddr_req)))
    }

    pub fn real_to_paddr(&self, vaddr: VAddr) -> Option<PAddr> {
        self.segments
            .iter()
            .find(|s| s.vaddr_real_range().contains(vaddr))
            .map(|s| s.paddr.wrapping_add(vaddr.offset_from(s.vaddr_real)))
    }

    pub fn real_to_laddr(&self, vaddr: VAddr) -> Option<LAddr> {
        self.segments
            .iter()
            .find(|s| s.vaddr_real_range().contains(vaddr))
            .map(|s| s.laddr.wrapping_add(vaddr.offset_from(s.vaddr_real)))
    }

    pub fn paddr_to_real(&self, paddr: PAddr) -> Option<VAddr> {
        self.segments
            .iter()
            .find(|s| s.paddr_range().contains(paddr))
            .map(|s| s.vaddr_real.wrapping_add(paddr.offset_from(s.paddr)))
    }

    pub fn paddr_to_laddr(&self, paddr: PAddr) -> Option<LAddr> {
        self.segments
            .iter()
            .find(|s| s.paddr_range().contains(paddr))
            .map(|s| s.laddr.wrapping_add(paddr.offset_from(s.paddr)))
    }

    pub fn laddr_to_real(&self, laddr: LAddr) -> Option<VAddr> {
        self.segments
            .iter()
            .find(|s| s.laddr_range().contains(laddr))
            .map(|s| s.vaddr_real.wrapping_add(laddr.offset_from(s.laddr)))
    }

    pub fn laddr_to_paddr(&self, laddr: LAddr) -> Option<PAddr> {
        self.segments
            .iter()
            .find(|s| s.laddr_range().contains(laddr))
            .map(|s| s.paddr.wrapping_add(laddr.offset_from(s.laddr)))
    }

    // -- lifecycle functions ---------------------------------------------

    pub fn preinit_len(&self) -> u64 {
        self.preinit_array.map_or(0, |a| a.count)
    }

    pub fn preinit_get<H: Host>(&self, host: &mut H, index: u64) -> Result<VAddr> {
        self.array_get(host, self.preinit_array, index)
    }

    /// `init_func` counts as entry 0 when present; `DT_INIT_ARRAY` entries
    /// follow it.
    pub fn init_len(&self) -> u64 {
        self.init_array.map_or(0, |a| a.count) + self.init_func.is_some() as u64
    }

    pub fn init_get<H: Host>(&self, host: &mut H, index: u64) -> Result<VAddr> {
        self.func_then_array_get(host, self.init_func, self.init_array, index)
    }

    /// `fini_func` counts as entry 0 when present; `DT_FINI_ARRAY` entries
    /// follow it. (Not `init_func`'s presence — an easy copy-paste trap
    /// when these two counts sit next to each other.)
    pub fn fini_len(&self) -> u64 {
        self.fini_array.map_or(0, |a| a.count) + self.fini_func.is_some() as u64
    }

    pub fn fini_get<H: Host>(&self, host: &mut H, index: u64) -> Result<VAddr> {
        self.func_then_array_get(host, self.fini_func, self.fini_array, index)
    }

    fn func_then_array_get<H: Host>(
        &self,
        host: &mut H,
        func: Option<VAddr>,
        array: Option<ArrayRef>,
        index: u64,
    ) -> Result<VAddr> {
        match func {
            Some(f) if index == 0 => Ok(f),
            Some(_) => self.array_get(host, array, index - 1),
            None => self.array_get(host, array, index),
        }
    }

    fn array_get<H: Host>(&self, host: &mut H, array: Option<ArrayRef>, index: u64) -> Result<VAddr> {
        let array = array.ok_or_else(|| error::structural("array index out of range"))?;
        if index >= array.count {
            return Err(error::structural("array index out of range"));
        }
        let entry_vaddr = array.vaddr.wrapping_add(index * PTR_SIZE as u64);
        let laddr = self
            .req_to_laddr(entry_vaddr)
            .ok_or_else(|| error::structural("function pointer array does not fall within a loaded segment"))?;

        let mut buf = [0u8; PTR_SIZE];
        host.copy_from_user(laddr, &mut buf)?;
        let raw = if PTR_SIZE == 8 {
            u64::from_ne_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ])
        } else {
            u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64
        };
        Ok(VAddr::new(raw))
    }

    /// Releases every segment's backing memory through `host`. Called by
    /// [`crate::loader::DynamicLoader`] when unwinding a partially loaded
    /// graph and when a fully loaded graph is explicitly unloaded.
    pub fn unload<H: Host>(&mut self, host: &mut H) {
        for seg in self.segments.drain(..) {
            host.free_segment(crate::host::AllocatedSegment {
                vaddr_real: seg.vaddr_real,
                laddr: seg.laddr,
                paddr: seg.paddr,
                cookie: seg.alloc_cookie,
            });
        }
    }
}

#[cfg(test)]
impl Instance {
    /// Builds a segment-less, dynamic-section-only `Instance` for testing
    /// dependency discovery and initialisation ordering without a `Host`.
    pub(crate) fn test_stub(name: &str, needed: &[&str]) -> Self {
        let path = alloc::format!("/lib/{name}");
        let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);

        let mut dynstr = alloc::vec![0u8];
        let mut needed_offsets = Vec::new();
        for dep in needed {
            needed_offsets.push(dynstr.len() as u64);
            dynstr.extend_from_slice(dep.as_bytes());
            dynstr.push(0);
        }

        Instance {
            path,
            name_start,
            segments: Vec::new(),
            entry: VAddr::new(0),
            init_func: None,
            fini_func: None,
            preinit_array: None,
            init_array: None,
            fini_array: None,
            dynamic: Vec::new(),
            dynstr,
            dynsym: Vec::new(),
            needed_offsets,
        }
    }
}
