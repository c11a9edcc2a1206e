//! 32-bit two-level x86 paging with a lazily filled software TLB.
//!
//! The unit owns CR2, CR3, the TLB and the page-fault context stack, and
//! exposes linear-address memory accesses plus the control operations a CPU
//! model needs (`set_dir_base`, `enable`, explicit link/unlink, translation
//! queries). It deliberately does not execute instructions: resolving a
//! guest page fault mid-access is delegated to an [`ExecCore`] through the
//! fault engine in [`fault`].
//!
//! Guest-visible page faults are ordinary values, raised and resolved (or
//! parked in [`CpuState::pending`]) without ever unwinding the host.
//! [`Error`] is reserved for conditions the host cannot recover from.

mod access;
mod cpu;
mod entry;
mod fault;
mod init_page;
mod tlb;
mod walker;

pub use cpu::{Architecture, CoreExit, CpuState, Env, ExecCore, PageFault};
pub use entry::{PageEntry, PTE_A, PTE_D, PTE_P, PTE_US, PTE_WR};
pub use tlb::{HostBias, ReadHandler, TlbSlot, WriteHandler};

use relic_mem::{MemFlags, MemoryMap};
use thiserror::Error as ThisError;
use tlb::Tlb;
use tracing::warn;

/// Number of TLB slots: one per 4 KiB page of the 32-bit linear space.
pub const TLB_SIZE: u32 = 1 << 20;
/// Pages covered by the flat remap table used while paging is disabled:
/// the first megabyte plus the HMA window above it.
pub const LINK_START: u32 = (1024 + 64) / 4;
/// Capacity of the linked-pages ledger.
pub const PAGING_LINKS: usize = 128 * 1024 / 4;
/// Maximum page-fault nesting depth.
pub const PF_STACK_SIZE: usize = 16;

/// Host-fatal conditions. Guest page faults are never reported here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("cannot link linear page {lin_page:#x} to physical page {phys_page:#x}")]
    IllegalPage { lin_page: u32, phys_page: u32 },
    #[error(
        "guest #PF handler returned without making the entry at {entry_addr:#010x} \
         present (fault at {lin_addr:#010x})"
    )]
    FaultNotResolved { lin_addr: u32, entry_addr: u32 },
    #[error("page fault context stack exhausted at depth {depth} (fault at {lin_addr:#010x})")]
    FaultStackOverflow { depth: usize, lin_addr: u32 },
    #[error("execution core stopped while resolving a page fault at {lin_addr:#010x}")]
    CoreStopped { lin_addr: u32 },
}

/// Counters for the cache behavior tests and for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PagingStats {
    pub page_walks: u64,
    pub page_faults: u64,
    pub links: u64,
    pub tlb_clears: u64,
}

struct DirBase {
    page: u32,
    addr: u32,
}

/// The paging unit.
pub struct Paging {
    cr3: u32,
    cr2: u32,
    base: DirBase,
    enabled: bool,
    tlb: Tlb,
    /// Physical page for each low linear page while paging is disabled.
    /// Identity-mapped until changed with [`Paging::map_page`].
    firstmb: [u32; LINK_START as usize],
    pf_stack: Vec<fault::PfEntry>,
    stats: PagingStats,
}

impl Paging {
    pub fn new() -> Self {
        let mut firstmb = [0u32; LINK_START as usize];
        for (page, phys) in firstmb.iter_mut().enumerate() {
            *phys = page as u32;
        }
        Self {
            cr3: 0,
            cr2: 0,
            base: DirBase { page: 0, addr: 0 },
            enabled: false,
            tlb: Tlb::new(),
            firstmb,
            pf_stack: Vec::with_capacity(PF_STACK_SIZE),
            stats: PagingStats::default(),
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn cr2(&self) -> u32 {
        self.cr2
    }

    #[inline]
    pub fn dir_base(&self) -> u32 {
        self.cr3
    }

    /// Current page-fault nesting depth.
    pub fn fault_depth(&self) -> usize {
        self.pf_stack.len()
    }

    pub fn stats(&self) -> PagingStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = PagingStats::default();
    }

    /// Loads CR3. Flushes all cached translations when paging is active.
    pub fn set_dir_base(&mut self, cr3: u32) {
        self.cr3 = cr3;
        self.base.page = cr3 >> 12;
        self.base.addr = cr3 & !0xFFF;
        if self.enabled {
            self.clear_tlb();
        }
    }

    /// Switches CR0.PG. Enabling reloads the directory base and gives the
    /// core a chance to drop cached code; both directions flush the TLB.
    pub fn enable(&mut self, core: &mut dyn ExecCore, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            core.on_paging_enabled();
            self.set_dir_base(self.cr3);
        }
        self.clear_tlb();
    }

    /// Drops every cached translation. Slots go back to lazy and the ledger
    /// empties.
    pub fn clear_tlb(&mut self) {
        self.stats.tlb_clears += 1;
        self.tlb.clear();
    }

    /// Resets a run of slots to lazy without touching the rest of the TLB.
    pub fn unlink_pages(&mut self, lin_page: u32, count: u32) {
        self.tlb.unlink(lin_page, count);
    }

    /// Caches `lin_page -> phys_page` with access rights taken from the
    /// physical page's backing.
    pub fn link_page(
        &mut self,
        mem: &MemoryMap,
        lin_page: u32,
        phys_page: u32,
    ) -> Result<(), Error> {
        self.link_inner(mem, lin_page, phys_page, false)
    }

    /// Like [`Paging::link_page`], but writes keep going through the
    /// re-checking handler. Used for lazy dirty tracking on the slow
    /// architectures.
    pub fn link_page_read_only(
        &mut self,
        mem: &MemoryMap,
        lin_page: u32,
        phys_page: u32,
    ) -> Result<(), Error> {
        self.link_inner(mem, lin_page, phys_page, true)
    }

    fn link_inner(
        &mut self,
        mem: &MemoryMap,
        lin_page: u32,
        phys_page: u32,
        read_only: bool,
    ) -> Result<(), Error> {
        if lin_page >= TLB_SIZE || phys_page >= TLB_SIZE {
            return Err(Error::IllegalPage {
                lin_page,
                phys_page,
            });
        }
        if self.tlb.links_full() {
            warn!("linked-pages ledger full, flushing all cached translations");
            self.clear_tlb();
        }

        let lin_base = lin_page << 12;
        let flags = mem.page_flags(phys_page);
        let host = mem.host_base(phys_page);
        let read = if flags.contains(MemFlags::READABLE) {
            host.map(|base| HostBias::new(base, lin_base))
        } else {
            None
        };
        let write = if !read_only && flags.contains(MemFlags::WRITEABLE) {
            host.map(|base| HostBias::new(base, lin_base))
        } else {
            None
        };

        *self.tlb.slot_mut(lin_page) = TlbSlot {
            read,
            write,
            phys_page,
            read_handler: ReadHandler::Mem,
            write_handler: if read_only {
                WriteHandler::InitUserRo
            } else {
                WriteHandler::Mem
            },
        };
        self.tlb.record_link(lin_page);
        self.stats.links += 1;
        Ok(())
    }

    /// Remaps one page of the paging-disabled view of low memory. Pages at
    /// or above [`LINK_START`] are linked directly instead.
    pub fn map_page(
        &mut self,
        mem: &MemoryMap,
        lin_page: u32,
        phys_page: u32,
    ) -> Result<(), Error> {
        if lin_page < LINK_START {
            self.firstmb[lin_page as usize] = phys_page;
            self.tlb.unlink(lin_page, 1);
            Ok(())
        } else {
            self.link_page(mem, lin_page, phys_page)
        }
    }

    /// Physical page behind a linear page, reading the tables directly.
    /// `None` when the mapping is not present. Never faults and never
    /// touches the TLB.
    pub fn make_phys_page(&self, mem: &MemoryMap, lin_page: u32) -> Option<u32> {
        if !self.enabled {
            return Some(self.disabled_phys_page(lin_page));
        }
        let table_addr = (self.base.page << 12).wrapping_add((lin_page >> 10) * 4);
        let table = PageEntry::from_raw(mem.phys_readd(table_addr));
        if !table.present() {
            return None;
        }
        let entry_addr = (table.base() << 12).wrapping_add((lin_page & 0x3FF) * 4);
        let entry = PageEntry::from_raw(mem.phys_readd(entry_addr));
        if !entry.present() {
            return None;
        }
        Some(entry.base())
    }

    /// Forces the slot for `lin_addr` into a fully linked state, resolving
    /// guest faults if the tables require it. Returns whether anything had
    /// to be done.
    pub fn force_resolve(&mut self, env: &mut Env<'_>, lin_addr: u32) -> Result<bool, Error> {
        let slot = *self.tlb.slot(lin_addr >> 12);
        if slot.read_handler == ReadHandler::Init {
            self.init_page_forced(env, lin_addr, false)?;
            Ok(true)
        } else if slot.write_handler == WriteHandler::InitUserRo {
            self.unlink_pages(lin_addr >> 12, 1);
            self.init_page_forced(env, lin_addr, true)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Translates a linear address, walking and linking on a TLB miss.
    /// With paging disabled this is the identity mapping filtered through
    /// the low-memory remap table, and the TLB is not consulted.
    pub fn translate(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        writing: bool,
    ) -> Result<u32, Error> {
        let lin_page = lin_addr >> 12;
        if !self.enabled {
            return Ok(self.disabled_phys_page(lin_page) << 12 | lin_addr & 0xFFF);
        }

        let slot = *self.tlb.slot(lin_page);
        let resolved = if writing {
            slot.write_handler == WriteHandler::Mem
        } else {
            slot.read_handler == ReadHandler::Mem
        };
        if !resolved {
            if writing && slot.write_handler == WriteHandler::InitUserRo {
                self.user_ro_init_page(env, lin_addr)?;
            } else {
                let relink = self.init_page(env, lin_addr, writing)?;
                // Capture the translation before a deferred check tears the
                // link back down.
                let phys = self.tlb.slot(lin_page).phys_addr(lin_addr);
                self.apply_relink(env.mem, relink, lin_addr)?;
                return Ok(phys);
            }
        }
        Ok(self.tlb.slot(lin_page).phys_addr(lin_addr))
    }

    /// Physical address for `lin_addr` if the TLB already holds a resolved
    /// read mapping for its page.
    pub fn cached_phys_addr(&self, lin_addr: u32) -> Option<u32> {
        let slot = self.tlb.slot(lin_addr >> 12);
        match slot.read_handler {
            ReadHandler::Mem => Some(slot.phys_addr(lin_addr)),
            ReadHandler::Init => None,
        }
    }

    /// Read-only view of a TLB slot.
    pub fn tlb_slot(&self, lin_page: u32) -> &TlbSlot {
        self.tlb.slot(lin_page)
    }

    /// Linear pages currently recorded in the link ledger, oldest first.
    pub fn linked_pages(&self) -> &[u32] {
        self.tlb.linked_pages()
    }

    pub(crate) fn disabled_phys_page(&self, lin_page: u32) -> u32 {
        if lin_page < LINK_START {
            self.firstmb[lin_page as usize]
        } else {
            lin_page
        }
    }
}

impl Default for Paging {
    fn default() -> Self {
        Self::new()
    }
}
