//! A host-embeddable ELF loader, relocator and dynamic linker.
//!
//! Every platform-dependent operation — allocating memory for a segment,
//! reading a file, or copying bytes into or out of the address space an
//! object is loaded into — goes through the [`Host`](host::Host) trait.
//! Nothing in this crate calls into an OS directly, which is what makes it
//! usable from an embedded kernel, a hypervisor, or a cross-development
//! tool that has no conventional loader of its own to lean on.
//!
//! Three address kinds are kept distinct throughout: the virtual address an
//! ELF file's own contents refer to ([`address::VAddr`]), the physical
//! address a segment actually occupies on the target
//! ([`address::PAddr`]), and the address the loader itself can dereference
//! to read or write a segment's bytes ([`address::LAddr`]). An
//! [`instance::Instance`] translates between all three; nothing upstream of
//! it ever needs to reason about more than one at a time.
//!
//! ```text
//! FileContext::open   -- validates an ELF header against this build
//!        |
//! Instance::load       -- places every PT_LOAD segment, parses PT_DYNAMIC
//!        |
//! DynamicLoader::load  -- discovers DT_NEEDED transitively, orders init,
//!        |                relocates the whole graph
//!    entrypoint()
//! ```
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod address;
pub mod arch;
pub mod elf_defs;
pub mod error;
pub mod file;
pub mod host;
pub mod instance;
pub mod loader;
pub mod relocation;
pub mod segment;

#[cfg(feature = "std")]
mod std_support;

pub use address::{LAddr, PAddr, VAddr};
pub use error::{Error, Result};
pub use file::FileContext;
pub use host::{AllocatedSegment, BuiltinLibrary, BuiltinSymbol, Host, HostFile, SegmentRequest};
pub use instance::Instance;
pub use loader::DynamicLoader;
pub use relocation::RelocationContext;
pub use segment::Segment;

#[cfg(feature = "std")]
pub use std_support::StdFile;
