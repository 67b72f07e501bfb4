//! A single loaded `PT_LOAD` segment, placed across all three address
//! spaces this crate distinguishes.

use crate::address::{AddrRange, LAddr, PAddr, VAddr};
use crate::elf_defs::SegmentFlags;

/// One loadable segment, after the host has placed it.
///
/// `vaddr_req` is the address the ELF file asked for; `vaddr_real` is where
/// the segment actually ended up once the loader's own base-address choices
/// (if any) are folded in. For the common case of loading at the requested
/// address the two are equal; they can diverge for a `ET_DYN` object the
/// host chose to place elsewhere in its virtual address space.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr_req: VAddr,
    pub vaddr_real: VAddr,
    pub paddr: PAddr,
    pub laddr: LAddr,
    pub size: u64,
    pub file_off: u64,
    pub file_size: u64,
    pub flags: SegmentFlags,
    pub(crate) alloc_cookie: u64,
}

impl Segment {
    pub fn vaddr_req_range(&self) -> AddrRange<VAddr> {
        AddrRange {
            start: self.vaddr_req,
            len: self.size,
        }
    }

    pub fn vaddr_real_range(&self) -> AddrRange<VAddr> {
        AddrRange {
            start: self.vaddr_real,
            len: self.size,
        }
    }

    pub fn paddr_range(&self) -> AddrRange<PAddr> {
        AddrRange {
            start: self.paddr,
            len: self.size,
        }
    }

    pub fn laddr_range(&self) -> AddrRange<LAddr> {
        AddrRange {
            start: self.laddr,
            len: self.size,
        }
    }
}
