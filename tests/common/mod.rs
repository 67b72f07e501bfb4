//! Shared fixtures for the integration tests: an in-memory [`Host`]
//! implementation and a handful of byte-level ELF image builders.
//!
//! Real test binaries can't be produced without running a toolchain in this
//! session, so every image here is assembled field-by-field against
//! `kbelf::elf_defs`'s layouts, the same way `DESIGN.md` describes.

use std::collections::HashMap;

use kbelf::elf_defs::{
    DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_HASH, DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_NEEDED, DT_NULL,
    DT_RELA, DT_RELAENT, DT_RELASZ, DT_STRSZ, DT_STRTAB, DT_SYMTAB, DYN_SIZE, EHDR_SIZE, EM_ARCH,
    PHDR_SIZE, RELA_SIZE, SHDR_SIZE, SYM_SIZE,
};
use kbelf::host::{AllocatedSegment, BuiltinLibrary, SegmentRequest};
use kbelf::{Error, Host, HostFile, LAddr, PAddr, Result, VAddr};

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;
pub const SHN_UNDEF: u16 = 0;

#[cfg(target_arch = "x86_64")]
pub const RELOC_ABS64: u32 = 1; // R_X86_64_64
#[cfg(any(target_arch = "riscv64", target_arch = "riscv32"))]
pub const RELOC_ABS64: u32 = 2; // R_RISCV_ABS64

// ---------------------------------------------------------------------
// In-memory host
// ---------------------------------------------------------------------

pub struct MockFile(Vec<u8>);

impl HostFile for MockFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let start = offset as usize;
        if start >= self.0.len() {
            return Ok(0);
        }
        let avail = self.0.len() - start;
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.0[start..start + n]);
        Ok(n)
    }
}

/// A `Host` that places segments in one growable buffer (standing in for
/// target memory) via a simple bump allocator, and never rebases a segment's
/// real address away from its requested one. Good enough to drive every
/// translation and relocation path without an actual MMU.
pub struct MockHost {
    files: HashMap<String, Vec<u8>>,
    resolve: HashMap<String, String>,
    builtins: &'static [BuiltinLibrary],
    mem: Vec<u8>,
    bump: u64,
    /// Added to every segment's requested address to produce its real
    /// address, standing in for a host that rebases position-independent
    /// objects away from their link-time base. Zero by default, matching a
    /// host that honors every requested address as-is.
    rebase_offset: u64,
    pub find_lib_calls: Vec<String>,
    pub outstanding_segments: usize,
}

impl MockHost {
    pub fn new() -> Self {
        MockHost {
            files: HashMap::new(),
            resolve: HashMap::new(),
            builtins: &[],
            mem: Vec::new(),
            bump: 0x1000,
            rebase_offset: 0,
            find_lib_calls: Vec::new(),
            outstanding_segments: 0,
        }
    }

    pub fn with_builtins(mut self, builtins: &'static [BuiltinLibrary]) -> Self {
        self.builtins = builtins;
        self
    }

    pub fn with_rebase_offset(mut self, offset: u64) -> Self {
        self.rebase_offset = offset;
        self
    }

    pub fn add_file(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }

    pub fn add_resolve(&mut self, needed_name: &str, path: &str) {
        self.resolve.insert(needed_name.to_string(), path.to_string());
    }

    /// Reads `len` bytes directly out of target memory at load address
    /// `laddr`, bypassing the `Host` trait — used by tests to check a
    /// relocation's result without threading another round trip through it.
    pub fn peek(&self, laddr: LAddr, len: usize) -> &[u8] {
        let start = laddr.get() as usize;
        &self.mem[start..start + len]
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for MockHost {
    type File = MockFile;

    fn open(&mut self, path: &str) -> Result<Self::File> {
        self.files
            .get(path)
            .cloned()
            .map(MockFile)
            .ok_or_else(|| kbelf::error::io_error(format!("no such file: {path}")))
    }

    fn find_lib(&mut self, name: &str) -> Option<std::borrow::Cow<'static, str>> {
        self.find_lib_calls.push(name.to_string());
        self.resolve.get(name).cloned().map(std::borrow::Cow::Owned)
    }

    fn builtin_libs(&self) -> &'static [BuiltinLibrary] {
        self.builtins
    }

    fn alloc_segment(&mut self, req: SegmentRequest) -> Result<AllocatedSegment> {
        let align = req.align.max(1);
        let base = (self.bump + align - 1) / align * align;
        let end = base + req.size;
        if self.mem.len() < end as usize {
            self.mem.resize(end as usize, 0);
        }
        self.bump = end;
        self.outstanding_segments += 1;
        Ok(AllocatedSegment {
            vaddr_real: VAddr::new(req.vaddr_req.get() + self.rebase_offset),
            laddr: LAddr::new(base),
            paddr: PAddr::new(base),
            cookie: base,
        })
    }

    fn free_segment(&mut self, _segment: AllocatedSegment) {
        self.outstanding_segments = self.outstanding_segments.saturating_sub(1);
    }

    fn copy_to_user(&mut self, dst: LAddr, data: &[u8]) -> Result<()> {
        let start = dst.get() as usize;
        let end = start + data.len();
        if self.mem.len() < end {
            self.mem.resize(end, 0);
        }
        self.mem[start..end].copy_from_slice(data);
        Ok(())
    }

    fn copy_from_user(&mut self, src: LAddr, out: &mut [u8]) -> Result<()> {
        let start = src.get() as usize;
        let end = start + out.len();
        if self.mem.len() < end {
            return Err(kbelf::error::io_error("read past mapped memory"));
        }
        out.copy_from_slice(&self.mem[start..end]);
        Ok(())
    }

    fn strlen_from_user(&mut self, src: LAddr) -> Result<usize> {
        let start = src.get() as usize;
        if start >= self.mem.len() {
            return Err(kbelf::error::io_error("strlen past mapped memory"));
        }
        self.mem[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| kbelf::error::io_error("no NUL terminator in mapped memory"))
    }
}

pub fn is_missing_resolution(err: &Error) -> bool {
    matches!(err, Error::Resolution { .. })
}

pub fn is_malformed(err: &Error) -> bool {
    matches!(err, Error::Malformed { .. })
}

// ---------------------------------------------------------------------
// Byte-level ELF image assembly
// ---------------------------------------------------------------------

/// A name/offset table, built up one `add()` at a time like a real
/// `.dynstr`: index 0 is the reserved empty string.
pub struct Dynstr {
    buf: Vec<u8>,
}

impl Dynstr {
    pub fn new() -> Self {
        Dynstr { buf: vec![0u8] }
    }

    pub fn add(&mut self, s: &str) -> u64 {
        let off = self.buf.len() as u64;
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        off
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for Dynstr {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
pub struct DynEntry {
    pub tag: i64,
    pub val: u64,
}

pub fn dt(tag: i64, val: u64) -> DynEntry {
    DynEntry { tag, val }
}

#[derive(Clone)]
pub struct RawSym {
    pub name: String,
    pub bind: u8,
    pub shndx: u16,
    pub value: u64,
}

/// One `Elf64_Rela` entry, already carrying a decoded `(sym, type)` pair
/// instead of a packed `r_info`, since callers think in those terms.
#[derive(Clone, Copy)]
pub struct RawRela {
    pub offset: u64,
    pub sym_index: u32,
    pub r_type: u32,
    pub addend: i64,
}

/// Lays out one loadable ELF object as a single `PT_LOAD` segment (covering
/// the whole file, as real linkers do) plus an optional `PT_DYNAMIC`
/// segment describing the dynamic section that lives inside it.
///
/// `needed`, `init_array`, `symbols` and `relocs` are all optional; an empty
/// `Vec` in each simply omits the corresponding `DT_*` tags (and, for
/// `symbols`/`relocs`, the whole hash/symtab/rela triple).
#[derive(Default)]
pub struct ImageBuilder {
    pub e_type: u16,
    pub base: u64,
    pub entry: u64,
    pub mem_size: Option<u64>,
    pub needed: Vec<String>,
    pub init_array: Vec<u64>,
    pub fini_array: Vec<u64>,
    pub symbols: Vec<RawSym>,
    pub relocs: Vec<RawRela>,
    /// Raw dynamic-section entries appended verbatim after every tag this
    /// builder otherwise computes and before the closing `DT_NULL` — used to
    /// exercise malformed combinations (e.g. a `DT_RELA` tag with no matching
    /// `DT_RELASZ`/`DT_RELAENT`) that `relocs` alone can't produce, since
    /// `relocs` always emits a complete, consistent RELA triple.
    pub extra_dyn: Vec<DynEntry>,
}

impl ImageBuilder {
    pub fn new(e_type: u16, base: u64) -> Self {
        ImageBuilder {
            e_type,
            base,
            entry: 0,
            mem_size: None,
            needed: Vec::new(),
            init_array: Vec::new(),
            fini_array: Vec::new(),
            symbols: Vec::new(),
            relocs: Vec::new(),
            extra_dyn: Vec::new(),
        }
    }

    fn has_dynamic(&self) -> bool {
        !self.needed.is_empty()
            || !self.init_array.is_empty()
            || !self.fini_array.is_empty()
            || !self.symbols.is_empty()
            || !self.relocs.is_empty()
            || !self.extra_dyn.is_empty()
    }

    pub fn build(&self) -> Vec<u8> {
        let has_dynamic = self.has_dynamic();
        let n_phdrs = if has_dynamic { 2 } else { 1 };
        let header_region = (EHDR_SIZE + PHDR_SIZE * n_phdrs) as u64;

        // -- lay out the dynstr table and decide every tail offset up front,
        // mirroring how a real linker fixes up section offsets before
        // emitting the final image.
        let mut dynstr = Dynstr::new();
        let needed_offsets: Vec<u64> = self.needed.iter().map(|n| dynstr.add(n)).collect();
        let sym_name_offsets: Vec<u64> = self.symbols.iter().map(|s| dynstr.add(&s.name)).collect();

        let n_dyn_entries = self.count_dyn_entries();
        let dyn_off = header_region;
        let dyn_table_len = DYN_SIZE as u64 * n_dyn_entries as u64;

        let mut cursor = dyn_off + dyn_table_len;

        let dynstr_off = cursor;
        cursor += dynstr.len();

        let hash_off = if !self.symbols.is_empty() {
            let off = cursor;
            cursor += 8;
            Some(off)
        } else {
            None
        };

        let symtab_off = if !self.symbols.is_empty() {
            let off = cursor;
            cursor += SYM_SIZE as u64 * (self.symbols.len() as u64 + 1);
            Some(off)
        } else {
            None
        };

        let init_array_off = if !self.init_array.is_empty() {
            let off = cursor;
            cursor += 8 * self.init_array.len() as u64;
            Some(off)
        } else {
            None
        };

        let fini_array_off = if !self.fini_array.is_empty() {
            let off = cursor;
            cursor += 8 * self.fini_array.len() as u64;
            Some(off)
        } else {
            None
        };

        let rela_off = if !self.relocs.is_empty() {
            let off = cursor;
            cursor += RELA_SIZE as u64 * self.relocs.len() as u64;
            Some(off)
        } else {
            None
        };

        let total_len = cursor;

        // -- now that every tail offset is known, build the dynamic entries.
        let mut entries = Vec::new();
        for (name, off) in self.needed.iter().zip(&needed_offsets) {
            let _ = name;
            entries.push(dt(DT_NEEDED as i64, *off));
        }
        if !self.needed.is_empty() || !self.symbols.is_empty() {
            entries.push(dt(DT_STRTAB as i64, self.base + dynstr_off));
            entries.push(dt(DT_STRSZ as i64, dynstr.len()));
        }
        if let (Some(symtab_off), Some(hash_off)) = (symtab_off, hash_off) {
            entries.push(dt(DT_SYMTAB as i64, self.base + symtab_off));
            entries.push(dt(DT_HASH as i64, self.base + hash_off));
        }
        if let Some(off) = init_array_off {
            entries.push(dt(DT_INIT_ARRAY as i64, self.base + off));
            entries.push(dt(DT_INIT_ARRAYSZ as i64, 8 * self.init_array.len() as u64));
        }
        if let Some(off) = fini_array_off {
            entries.push(dt(DT_FINI_ARRAY as i64, self.base + off));
            entries.push(dt(DT_FINI_ARRAYSZ as i64, 8 * self.fini_array.len() as u64));
        }
        if let Some(off) = rela_off {
            entries.push(dt(DT_RELA as i64, self.base + off));
            entries.push(dt(DT_RELASZ as i64, RELA_SIZE as u64 * self.relocs.len() as u64));
            entries.push(dt(DT_RELAENT as i64, RELA_SIZE as u64));
        }
        for e in &self.extra_dyn {
            entries.push(*e);
        }
        entries.push(dt(DT_NULL as i64, 0));
        debug_assert_eq!(entries.len(), n_dyn_entries);

        // -- assemble the final byte image.
        let mut buf = Vec::with_capacity(total_len as usize);
        write_ehdr(&mut buf, self.e_type, self.base + self.entry, n_phdrs as u16);

        let mem_size = self.mem_size.unwrap_or(total_len);
        write_phdr(
            &mut buf,
            RawPhdr {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_W | PF_X,
                p_offset: 0,
                p_vaddr: self.base,
                p_filesz: total_len,
                p_memsz: mem_size,
                p_align: 0x1000,
            },
        );
        if has_dynamic {
            write_phdr(
                &mut buf,
                RawPhdr {
                    p_type: PT_DYNAMIC,
                    p_flags: PF_R | PF_W,
                    p_offset: dyn_off,
                    p_vaddr: self.base + dyn_off,
                    p_filesz: dyn_table_len,
                    p_memsz: dyn_table_len,
                    p_align: 8,
                },
            );
        }
        debug_assert_eq!(buf.len() as u64, header_region);

        for e in &entries {
            push_i64(&mut buf, e.tag);
            push_u64(&mut buf, e.val);
        }
        debug_assert_eq!(buf.len() as u64, dynstr_off);

        buf.extend_from_slice(dynstr.bytes());
        debug_assert_eq!(buf.len() as u64, hash_off.unwrap_or(buf.len() as u64));

        if !self.symbols.is_empty() {
            // nbucket/nchain header; only nchain (word index 1) is ever read.
            push_u32(&mut buf, 1);
            push_u32(&mut buf, self.symbols.len() as u32 + 1);

            // reserved null symbol at dynsym[0].
            push_sym(&mut buf, 0, 0, SHN_UNDEF, 0);
            for (sym, name_off) in self.symbols.iter().zip(&sym_name_offsets) {
                push_sym(&mut buf, *name_off, sym.bind << 4, sym.shndx, sym.value);
            }
        }

        if !self.init_array.is_empty() {
            for v in &self.init_array {
                push_u64(&mut buf, *v);
            }
        }

        if !self.fini_array.is_empty() {
            for v in &self.fini_array {
                push_u64(&mut buf, *v);
            }
        }

        if !self.relocs.is_empty() {
            for r in &self.relocs {
                push_u64(&mut buf, r.offset);
                push_u64(&mut buf, ((r.sym_index as u64) << 32) | r.r_type as u64);
                push_i64(&mut buf, r.addend);
            }
        }

        debug_assert_eq!(buf.len() as u64, total_len);
        if mem_size > total_len {
            buf.resize(mem_size as usize, 0);
        }
        buf
    }

    fn count_dyn_entries(&self) -> usize {
        let mut n = 0;
        n += self.needed.len();
        // STRTAB/STRSZ: emitted whenever there's a dynstr table at all
        // (NEEDED names or symbol names draw from it).
        if !self.needed.is_empty() || !self.symbols.is_empty() {
            n += 2;
        }
        if !self.symbols.is_empty() {
            n += 2; // SYMTAB, HASH
        }
        if !self.init_array.is_empty() {
            n += 2; // INIT_ARRAY, INIT_ARRAYSZ
        }
        if !self.fini_array.is_empty() {
            n += 2; // FINI_ARRAY, FINI_ARRAYSZ
        }
        if !self.relocs.is_empty() {
            n += 3; // RELA, RELASZ, RELAENT
        }
        n += self.extra_dyn.len();
        n + 1 // DT_NULL
    }
}

struct RawPhdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

fn write_ehdr(buf: &mut Vec<u8>, e_type: u16, entry: u64, phnum: u16) {
    buf.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
    buf.push(2); // ELFCLASS64
    buf.push(1); // ELFDATA2LSB
    buf.push(1); // EI_VERSION = EV_CURRENT
    buf.push(0); // EI_OSABI
    buf.extend_from_slice(&[0u8; 8]); // EI_ABIVERSION + padding
    debug_assert_eq!(buf.len(), 16);

    push_u16(buf, e_type);
    push_u16(buf, EM_ARCH);
    push_u32(buf, 1); // e_version
    push_u64(buf, entry);
    push_u64(buf, EHDR_SIZE as u64); // e_phoff
    push_u64(buf, 0); // e_shoff
    push_u32(buf, 0); // e_flags
    push_u16(buf, EHDR_SIZE as u16);
    push_u16(buf, PHDR_SIZE as u16);
    push_u16(buf, phnum);
    push_u16(buf, SHDR_SIZE as u16);
    push_u16(buf, 0); // e_shnum
    push_u16(buf, 0); // e_shstrndx
    debug_assert_eq!(buf.len(), EHDR_SIZE);
}

fn write_phdr(buf: &mut Vec<u8>, p: RawPhdr) {
    push_u32(buf, p.p_type);
    push_u32(buf, p.p_flags);
    push_u64(buf, p.p_offset);
    push_u64(buf, p.p_vaddr);
    push_u64(buf, p.p_vaddr); // p_paddr: unused by this crate, mirror p_vaddr
    push_u64(buf, p.p_filesz);
    push_u64(buf, p.p_memsz);
    push_u64(buf, p.p_align);
}

fn push_sym(buf: &mut Vec<u8>, name_off: u64, info: u8, shndx: u16, value: u64) {
    push_u32(buf, name_off as u32);
    buf.push(info);
    buf.push(0); // st_other
    push_u16(buf, shndx);
    push_u64(buf, value);
    push_u64(buf, 0); // st_size
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
