//! The fixed interface a host environment implements so this crate never
//! touches a syscall, a page table, or `std::fs` directly.
//!
//! Every platform-dependent operation the loader needs — segment allocation,
//! file access, and copying bytes across whatever boundary separates the
//! loader's own address space from the space a loaded object will run in —
//! is a method here. A kernel implements this against its page allocator and
//! VFS; a hypervisor implements it against guest memory and a disk image; a
//! cross-development tool can implement it directly against a host file and
//! a plain `Vec<u8>` standing in for target memory.

use crate::address::{LAddr, PAddr, VAddr};
use crate::elf_defs::SegmentFlags;
use crate::error::Result;
use alloc::borrow::Cow;
use alloc::vec::Vec;

/// One symbol a [`BuiltinLibrary`] provides without backing code of its own.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinSymbol {
    pub name: &'static str,
    pub paddr: PAddr,
    pub vaddr: VAddr,
}

/// A host-provided pseudo-library: a fixed table of symbols standing in for
/// a library whose code is already resident (linked into the host itself,
/// or otherwise natively provided) rather than loaded from an ELF file.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinLibrary {
    pub path: &'static str,
    pub symbols: &'static [BuiltinSymbol],
}

impl BuiltinLibrary {
    pub fn find_symbol(&self, name: &str) -> Option<&'static BuiltinSymbol> {
        self.symbols.iter().find(|sym| sym.name == name)
    }
}

/// A placed, allocated segment, as handed back by [`Host::alloc_segment`].
///
/// `laddr` is where the loader itself may read and write the segment's
/// bytes; `paddr` is the address the segment will actually occupy once the
/// loaded object runs. On hosts where the loader runs in the same address
/// space it loads into, the two are typically equal.
#[derive(Debug, Clone, Copy)]
pub struct AllocatedSegment {
    /// Where the segment actually ended up in the object's own virtual
    /// address space. Equal to the request's `vaddr_req` unless the host is
    /// rebasing a position-independent object; RISC-V/x86-64 `RELATIVE`
    /// relocations are driven by the difference between the two.
    pub vaddr_real: VAddr,
    pub laddr: LAddr,
    pub paddr: PAddr,
    /// Opaque handle the host can use to free this allocation; round-tripped
    /// back into [`Host::free_segment`] unexamined.
    pub cookie: u64,
}

/// A request to place one `PT_LOAD` segment somewhere the host controls.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRequest {
    pub vaddr_req: VAddr,
    pub size: u64,
    pub align: u64,
    pub flags: SegmentFlags,
}

/// A host-supplied file handle: something this crate can seek and read
/// without knowing whether it's backed by a real filesystem, an in-memory
/// archive, or a block device.
pub trait HostFile {
    /// Reads starting at `offset`, filling as much of `buf` as the
    /// underlying file has remaining; returns the number of bytes read,
    /// which may be less than `buf.len()` only at end of file.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// The complete interface a host environment implements.
///
/// Every method can fail: segment allocation can exhaust memory, file
/// operations can hit I/O errors, and cross-address-space copies can fault
/// against memory the target hasn't mapped. All of that is reported through
/// [`crate::error::Error`] rather than panicking.
pub trait Host {
    type File: HostFile;

    /// Opens the file an instance or dependency load refers to, given the
    /// path the loader resolved (the literal `DT_NEEDED` string for a
    /// library, or the path the embedder supplied for the top-level object).
    fn open(&mut self, path: &str) -> Result<Self::File>;

    /// Resolves a `DT_NEEDED` library name to a path the host can [`Host::open`],
    /// e.g. by searching a library search path. Returns `None` if no such
    /// library exists on this host (distinct from an I/O error).
    fn find_lib(&mut self, name: &str) -> Option<Cow<'static, str>>;

    /// The built-in, codeless libraries this host provides. Consulted before
    /// any library is loaded from a file, and before any symbol lookup
    /// touches loaded instances. `'static` because this table is fixed for
    /// the process's lifetime, which lets a loader hold onto it across
    /// calls that otherwise need `&mut self` on the host.
    fn builtin_libs(&self) -> &'static [BuiltinLibrary];

    /// Reserves target memory for one loadable segment and returns where the
    /// loader may write its initial contents and where it will ultimately
    /// reside.
    fn alloc_segment(&mut self, req: SegmentRequest) -> Result<AllocatedSegment>;

    /// Releases a segment previously returned by [`Host::alloc_segment`].
    fn free_segment(&mut self, segment: AllocatedSegment);

    /// Copies `data` into target memory at load address `dst`.
    fn copy_to_user(&mut self, dst: LAddr, data: &[u8]) -> Result<()>;

    /// Copies `len` bytes of target memory at load address `src` into `out`.
    fn copy_from_user(&mut self, src: LAddr, out: &mut [u8]) -> Result<()>;

    /// Measures a NUL-terminated string in target memory starting at `src`,
    /// not including the terminator, without assuming any particular bound.
    fn strlen_from_user(&mut self, src: LAddr) -> Result<usize>;

    /// Convenience built on [`Host::strlen_from_user`] and
    /// [`Host::copy_from_user`]: reads a NUL-terminated string out of target
    /// memory into an owned buffer.
    fn read_cstr_from_user(&mut self, src: LAddr) -> Result<Vec<u8>> {
        let len = self.strlen_from_user(src)?;
        let mut buf = alloc::vec![0u8; len];
        self.copy_from_user(src, &mut buf)?;
        Ok(buf)
    }
}
