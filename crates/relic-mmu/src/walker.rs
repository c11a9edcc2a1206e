//! Two-level page table walk.

use tracing::debug;

use crate::cpu::{CpuState, Env, PageFault};
use crate::entry::PageEntry;
use crate::{Error, Paging};
use relic_mem::MemoryMap;

/// #PF error code for a not-present directory or table entry.
#[inline]
pub(crate) fn not_present_code(writing: bool, cpu: &CpuState) -> u32 {
    let write_bit = if writing { 0x02 } else { 0x00 };
    let user_bit = if cpu.cpl & cpu.mpl == 0 { 0x00 } else { 0x04 };
    write_bit | user_bit
}

/// #PF error code for a privilege violation on a present mapping.
#[inline]
pub(crate) fn protection_code(writing: bool) -> u32 {
    0x05 | if writing { 0x02 } else { 0x00 }
}

impl Paging {
    /// Physical address of the directory entry covering `lin_page`.
    #[inline]
    pub(crate) fn dir_entry_addr(&self, lin_page: u32) -> u32 {
        self.base.addr.wrapping_add((lin_page >> 10) * 4)
    }

    /// Walks both levels for `lin_addr`, resolving not-present faults
    /// through the fault engine as they are hit.
    ///
    /// On success both entries are present. A not-present entry that is
    /// still not present after its fault was resolved means the guest
    /// handler returned without fixing the table, which no real guest
    /// recovers from, so it is reported as a host error.
    pub(crate) fn walk(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        writing: bool,
    ) -> Result<(PageEntry, PageEntry), Error> {
        self.stats.page_walks += 1;
        let lin_page = lin_addr >> 12;

        let table_addr = self.dir_entry_addr(lin_page);
        let mut table = PageEntry::from_raw(env.mem.phys_readd(table_addr));
        if !table.present() {
            debug!("page directory entry for {lin_addr:#010x} not present");
            let code = not_present_code(writing, env.cpu);
            self.page_fault(env, lin_addr, table_addr, code)?;
            table = PageEntry::from_raw(env.mem.phys_readd(table_addr));
            if !table.present() {
                return Err(Error::FaultNotResolved {
                    lin_addr,
                    entry_addr: table_addr,
                });
            }
        }

        let entry_addr = (table.base() << 12).wrapping_add((lin_page & 0x3FF) * 4);
        let mut entry = PageEntry::from_raw(env.mem.phys_readd(entry_addr));
        if !entry.present() {
            debug!("page table entry for {lin_addr:#010x} not present");
            let code = not_present_code(writing, env.cpu);
            self.page_fault(env, lin_addr, entry_addr, code)?;
            entry = PageEntry::from_raw(env.mem.phys_readd(entry_addr));
            if !entry.present() {
                return Err(Error::FaultNotResolved {
                    lin_addr,
                    entry_addr,
                });
            }
        }

        Ok((table, entry))
    }

    /// Non-faulting walk. A not-present entry is recorded in CR2 and
    /// [`CpuState::pending`] and returned as the error value; the tables are
    /// left untouched.
    pub(crate) fn walk_checked(
        &mut self,
        mem: &MemoryMap,
        cpu: &mut CpuState,
        lin_addr: u32,
        writing: bool,
    ) -> Result<(PageEntry, PageEntry), PageFault> {
        self.stats.page_walks += 1;
        let lin_page = lin_addr >> 12;

        let table_addr = self.dir_entry_addr(lin_page);
        let table = PageEntry::from_raw(mem.phys_readd(table_addr));
        if !table.present() {
            return Err(self.record_pending(cpu, lin_addr, not_present_code(writing, cpu)));
        }

        let entry_addr = (table.base() << 12).wrapping_add((lin_page & 0x3FF) * 4);
        let entry = PageEntry::from_raw(mem.phys_readd(entry_addr));
        if !entry.present() {
            return Err(self.record_pending(cpu, lin_addr, not_present_code(writing, cpu)));
        }

        Ok((table, entry))
    }

    pub(crate) fn record_pending(
        &mut self,
        cpu: &mut CpuState,
        lin_addr: u32,
        error_code: u32,
    ) -> PageFault {
        let fault = PageFault {
            lin_addr,
            error_code,
        };
        self.cr2 = lin_addr;
        cpu.pending = Some(fault);
        fault
    }
}
