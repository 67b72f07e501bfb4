//! Ties a file, its transitive `DT_NEEDED` dependencies and the host's
//! built-in libraries together into one graph: discovers and loads every
//! dependency, orders their initialisation so a library always runs after
//! everything it depends on, and relocates the whole graph against itself.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::error::{self, Result};
use crate::file::FileContext;
use crate::host::Host;
use crate::instance::Instance;
use crate::relocation::RelocationContext;

/// A fully loaded, relocated, initialisation-ordered graph rooted at one
/// executable.
pub struct DynamicLoader {
    exec: Option<Instance>,
    libs: Vec<Instance>,
    /// Topological order over indices into `libs`: their `preinit`/`init`
    /// functions run in this order, after the executable's own and before
    /// its `fini` functions run in the reverse of this order.
    lib_order: Vec<usize>,
}

impl DynamicLoader {
    pub fn new() -> Self {
        DynamicLoader {
            exec: None,
            libs: Vec::new(),
            lib_order: Vec::new(),
        }
    }

    /// The executable (if loaded) followed by every library, in
    /// initialisation order.
    fn ordered_instances(&self) -> impl Iterator<Item = &Instance> {
        self.exec
            .iter()
            .chain(self.lib_order.iter().map(move |&i| &self.libs[i]))
    }

    /// Loads `path` as the graph's root executable and every library it
    /// transitively needs, then relocates the whole graph. On any failure
    /// every instance loaded so far is unloaded before the error is
    /// returned, leaving the host with no dangling segment allocations.
    pub fn load<H: Host>(host: &mut H, path: &str) -> Result<Self> {
        let mut this = DynamicLoader::new();
        match this.load_inner(host, path) {
            Ok(()) => Ok(this),
            Err(e) => {
                this.unload(host);
                Err(e)
            }
        }
    }

    fn load_inner<H: Host>(&mut self, host: &mut H, path: &str) -> Result<()> {
        let exec_file = FileContext::open(host, path)?;
        let exec = Instance::load(host, exec_file)?;
        let needed: Vec<String> = exec.needed_libs().map(str::to_string).collect();
        // Register the executable before resolving its dependencies: if
        // resolution fails, the caller's `unload` still has to find and
        // free this instance's already-allocated segments.
        self.exec = Some(exec);
        self.check_deps(host, needed)?;

        // Fix up the transitive closure: every library pulled in above may
        // itself need libraries not yet loaded.
        let mut i = 0;
        while i < self.libs.len() {
            let needed: Vec<String> = self.libs[i].needed_libs().map(str::to_string).collect();
            self.check_deps(host, needed)?;
            i += 1;
        }

        self.lib_order = self.build_lib_order();

        let mut ctx = RelocationContext::new();
        for lib in host.builtin_libs() {
            ctx.add_builtin(lib);
        }
        if let Some(exec) = &self.exec {
            ctx.add(exec);
        }
        for lib in &self.libs {
            ctx.add(lib);
        }
        if let Some(exec) = &self.exec {
            ctx.perform(host, exec)?;
        }
        for lib in &self.libs {
            ctx.perform(host, lib)?;
        }

        Ok(())
    }

    /// Ensures every name in `needed` is either satisfied by a built-in
    /// library, already loaded, or gets loaded now (and its own
    /// dependencies get added to the work list via the caller's loop).
    fn check_deps<H: Host>(&mut self, host: &mut H, needed: Vec<String>) -> Result<()> {
        for name in needed {
            if host.builtin_libs().iter().any(|b| b.path == name) {
                continue;
            }
            if self.libs.iter().any(|l| l.name() == name) {
                continue;
            }
            let resolved = host.find_lib(&name).ok_or_else(|| {
                #[cfg(feature = "log")]
                log::warn!("missing library '{name}'");
                error::resolution(alloc::format!("missing library '{name}'"))
            })?;
            let file = FileContext::open(host, &resolved)?;
            let inst = Instance::load(host, file)?;

            #[cfg(feature = "log")]
            log::debug!("loaded dependency '{name}' from '{resolved}'");

            self.libs.push(inst);
        }
        Ok(())
    }

    /// Does library `a` depend (directly or transitively) on library `b`?
    /// `limit` guards against a dependency cycle looping forever; it starts
    /// at `libs.len() + 1`, one more than the longest possible acyclic
    /// chain, so a cycle is detected rather than mistaken for "no".
    fn depends_on(&self, a: usize, b: usize, limit: usize) -> bool {
        if limit == 0 {
            return false;
        }
        for name in self.libs[a].needed_libs() {
            if let Some(bi) = self.libs.iter().position(|l| l.name() == name) {
                if bi == b || self.depends_on(bi, b, limit - 1) {
                    return true;
                }
            }
        }
        false
    }

    fn build_lib_order(&self) -> Vec<usize> {
        let limit = self.libs.len() + 1;
        let mut lib_indices: Vec<usize> = (0..self.libs.len()).collect();
        lib_indices.sort_by(|&a, &b| {
            if self.depends_on(a, b, limit) {
                Ordering::Greater
            } else if self.depends_on(b, a, limit) {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        });
        lib_indices
    }

    pub fn preinit_len(&self) -> u64 {
        self.exec.as_ref().map_or(0, |e| e.preinit_len())
    }

    pub fn preinit_get<H: Host>(&self, host: &mut H, index: u64) -> Result<crate::address::VAddr> {
        match &self.exec {
            Some(exec) => exec.preinit_get(host, index),
            None => Err(error::structural("no executable loaded")),
        }
    }

    pub fn init_len(&self) -> u64 {
        self.ordered_instances().map(Instance::init_len).sum()
    }

    pub fn init_get<H: Host>(&self, host: &mut H, mut index: u64) -> Result<crate::address::VAddr> {
        for inst in self.ordered_instances() {
            let len = inst.init_len();
            if index < len {
                return inst.init_get(host, index);
            }
            index -= len;
        }
        Err(error::structural("init function index out of range"))
    }

    pub fn fini_len(&self) -> u64 {
        self.ordered_instances().map(Instance::fini_len).sum()
    }

    /// Finalisers run in the reverse of initialisation order: the same
    /// `exec`-then-`libs` traversal as [`Self::init_get`], but walked
    /// against the index mirrored around the total count.
    pub fn fini_get<H: Host>(&self, host: &mut H, index: u64) -> Result<crate::address::VAddr> {
        let total = self.fini_len();
        if index >= total {
            return Err(error::structural("fini function index out of range"));
        }
        let mut rev = total - index - 1;
        for inst in self.ordered_instances() {
            let len = inst.fini_len();
            if rev < len {
                return inst.fini_get(host, rev);
            }
            rev -= len;
        }
        Err(error::structural("fini function index out of range"))
    }

    pub fn entrypoint(&self) -> Result<crate::address::VAddr> {
        self.exec
            .as_ref()
            .map(|e| e.entrypoint())
            .ok_or_else(|| error::structural("no executable loaded"))
    }

    pub fn libs(&self) -> &[Instance] {
        &self.libs
    }

    pub fn exec(&self) -> Option<&Instance> {
        self.exec.as_ref()
    }

    /// Frees every loaded instance's segments through `host`. Safe to call
    /// on a graph that only partially loaded.
    pub fn unload<H: Host>(&mut self, host: &mut H) {
        if let Some(mut exec) = self.exec.take() {
            exec.unload(host);
        }
        for mut lib in self.libs.drain(..) {
            lib.unload(host);
        }
        self.lib_order.clear();
    }
}

impl Default for DynamicLoader {
    fn default() -> Self {
        Self::new()
    }
}
