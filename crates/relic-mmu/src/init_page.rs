//! Lazy TLB fill.
//!
//! TLB slots start out routed to the handlers in this module. The first
//! access through a lazy slot walks the tables, runs the privilege checks
//! for the current CPL and architecture, updates accessed/dirty bits, and
//! links the slot. On the slow architectures a permitted-but-marginal access
//! is linked only for its own duration: [`Relink`] tells the interrupted
//! access how to tear the link down (or downgrade it to read-only) once the
//! access has gone through, so the next access re-runs the checks.

use tracing::debug;

use crate::cpu::Env;
use crate::walker::protection_code;
use crate::{Error, Paging};
use relic_mem::{MemFlags, MemoryMap};

/// Post-access fixup owed by an access that went through a lazy handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Relink {
    /// The link is permanent.
    None,
    /// Tear the link down so the next access is re-checked.
    Unlink,
    /// Replace the full link with a read-only link to this physical page,
    /// so reads stay fast while writes keep being re-checked.
    ReadOnly(u32),
}

/// How a write lands once the read-only handler has run its checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoWrite {
    /// Through the read bias: the slot stays linked read-only.
    ReadSide,
    /// Through the write bias of the promoted full link.
    WriteSide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrivCheck {
    Pass,
    DeferUser,
    DeferWrite,
    Deny,
}

impl Paging {
    /// First-access handler for a lazy slot. Walks, checks, links, and tells
    /// the caller what to do with the link after the access.
    pub(crate) fn init_page(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        writing: bool,
    ) -> Result<Relink, Error> {
        let lin_page = lin_addr >> 12;
        if !self.enabled {
            let phys_page = self.disabled_phys_page(lin_page);
            self.link_page(env.mem, lin_page, phys_page)?;
            return Ok(Relink::None);
        }

        let (mut table, mut entry) = self.walk(env, lin_addr, writing)?;

        let mut check = PrivCheck::Pass;
        if env.cpu.arch.user_access_blocked(entry.user(), table.user()) {
            if env.cpu.user_write_prohibited() {
                check = PrivCheck::Deny;
            } else if env.cpu.arch.defers_privilege_checks() {
                check = PrivCheck::DeferUser;
            }
        }
        if !entry.writable() || !table.writable() {
            if check == PrivCheck::Pass && env.cpu.arch.defers_privilege_checks() {
                check = PrivCheck::DeferWrite;
            }
            if writing && env.cpu.user_write_prohibited() {
                check = PrivCheck::Deny;
            }
        }

        let entry_addr = (table.base() << 12).wrapping_add((lin_page & 0x3FF) * 4);
        if check == PrivCheck::Deny {
            debug!(
                cpl = env.cpu.cpl,
                writing, "page access denied at {lin_addr:#010x}"
            );
            self.page_fault(env, lin_addr, entry_addr, protection_code(writing))?;
            check = PrivCheck::Pass;
        }

        if !table.accessed() {
            table.set_accessed();
            env.mem.phys_writed(self.dir_entry_addr(lin_page), table.raw());
        }
        if !entry.accessed() || !entry.dirty() {
            entry.set_accessed();
            // Reads dirty the page too when the slot is about to stay fully
            // linked, since later writes will bypass this handler entirely.
            if writing || check == PrivCheck::Pass {
                entry.set_dirty();
            }
            env.mem.phys_writed(entry_addr, entry.raw());
        }

        let phys_page = entry.base();
        match check {
            PrivCheck::Pass | PrivCheck::Deny => {
                self.link_page(env.mem, lin_page, phys_page)?;
                Ok(Relink::None)
            }
            PrivCheck::DeferUser => {
                self.link_page(env.mem, lin_page, phys_page)?;
                Ok(Relink::Unlink)
            }
            PrivCheck::DeferWrite => {
                if writing {
                    let flags = env.mem.page_flags(phys_page);
                    self.link_page(env.mem, lin_page, phys_page)?;
                    if !flags.contains(MemFlags::READABLE | MemFlags::WRITEABLE) {
                        return Ok(Relink::Unlink);
                    }
                    let slot = self.tlb.slot(lin_page);
                    if slot.read != slot.write {
                        return Ok(Relink::Unlink);
                    }
                    Ok(Relink::ReadOnly(phys_page))
                } else {
                    self.link_page_read_only(env.mem, lin_page, phys_page)?;
                    Ok(Relink::None)
                }
            }
        }
    }

    /// Applies the fixup owed by the current access, after it completed.
    pub(crate) fn apply_relink(
        &mut self,
        mem: &MemoryMap,
        relink: Relink,
        lin_addr: u32,
    ) -> Result<(), Error> {
        if relink == Relink::None {
            return Ok(());
        }
        let lin_page = lin_addr >> 12;
        if self.tlb.pop_link_if_tail(lin_page) {
            self.tlb.unlink(lin_page, 1);
        }
        if let Relink::ReadOnly(phys_page) = relink {
            self.link_page_read_only(mem, lin_page, phys_page)?;
        }
        Ok(())
    }

    /// Probe variant of [`Paging::init_page`]: decides whether the access
    /// would go through without raising a fault. A denied access is parked
    /// in [`crate::CpuState::pending`] and `false` is returned.
    pub(crate) fn init_page_check_only(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        writing: bool,
    ) -> Result<bool, Error> {
        let lin_page = lin_addr >> 12;
        if !self.enabled {
            let phys_page = self.disabled_phys_page(lin_page);
            self.link_page(env.mem, lin_page, phys_page)?;
            return Ok(true);
        }

        let (table, entry) = match self.walk_checked(env.mem, env.cpu, lin_addr, writing) {
            Ok(entries) => entries,
            Err(_) => return Ok(false),
        };
        if !env.cpu.user_write_prohibited() {
            return Ok(true);
        }
        if env.cpu.arch.user_access_blocked(entry.user(), table.user())
            || ((!entry.writable() || !table.writable()) && writing)
        {
            debug!(
                cpl = env.cpu.cpl,
                writing, "probed page access at {lin_addr:#010x} would fault"
            );
            self.record_pending(env.cpu, lin_addr, protection_code(writing));
            return Ok(false);
        }
        Ok(true)
    }

    /// Unconditional resolve for a lazy or read-only slot: walks, sets the
    /// accessed bits, and links fully without privilege checks. Used when
    /// the machine needs a usable translation outside any guest access,
    /// e.g. before patching guest code.
    pub(crate) fn init_page_forced(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        writing: bool,
    ) -> Result<(), Error> {
        let lin_page = lin_addr >> 12;
        let phys_page = if self.enabled {
            let (mut table, mut entry) = self.walk(env, lin_addr, writing)?;
            if !table.accessed() {
                table.set_accessed();
                env.mem.phys_writed(self.dir_entry_addr(lin_page), table.raw());
            }
            if !entry.accessed() {
                entry.set_accessed();
                let entry_addr = (table.base() << 12).wrapping_add((lin_page & 0x3FF) * 4);
                env.mem.phys_writed(entry_addr, entry.raw());
            }
            entry.base()
        } else {
            self.disabled_phys_page(lin_page)
        };
        self.link_page(env.mem, lin_page, phys_page)
    }

    /// Write handler for a slot linked read-only.
    ///
    /// A supervisor write (under the current MPL) is simply allowed through
    /// the read bias and the slot stays read-only. A user write raises the
    /// protection fault, then re-links the slot fully once the guest handler
    /// has made the page writable.
    pub(crate) fn user_ro_init_page(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
    ) -> Result<(), Error> {
        let lin_page = lin_addr >> 12;
        if !self.enabled {
            let phys_page = self.disabled_phys_page(lin_page);
            return self.link_page(env.mem, lin_page, phys_page);
        }
        if !env.cpu.user_write_prohibited() {
            return Ok(());
        }

        let (mut table, mut entry) = self.walk(env, lin_addr, true)?;
        debug!(
            cpl = env.cpu.cpl,
            "write to read-only linked page at {lin_addr:#010x} denied"
        );
        let entry_addr = (table.base() << 12).wrapping_add((lin_page & 0x3FF) * 4);
        self.page_fault(env, lin_addr, entry_addr, protection_code(true))?;

        if !table.accessed() {
            table.set_accessed();
            env.mem.phys_writed(self.dir_entry_addr(lin_page), table.raw());
        }
        if !entry.accessed() || !entry.dirty() {
            entry.set_accessed();
            entry.set_dirty();
            env.mem.phys_writed(entry_addr, entry.raw());
        }
        self.link_page(env.mem, lin_page, entry.base())
    }

    /// Probe variant of the read-only write handler. `None` means the write
    /// would fault (recorded in pending); otherwise says which bias the
    /// write should go through.
    pub(crate) fn user_ro_check_only(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
    ) -> Result<Option<RoWrite>, Error> {
        let lin_page = lin_addr >> 12;
        if !self.enabled {
            let phys_page = self.disabled_phys_page(lin_page);
            self.link_page(env.mem, lin_page, phys_page)?;
            return Ok(Some(RoWrite::WriteSide));
        }
        if !env.cpu.user_write_prohibited() {
            return Ok(Some(RoWrite::ReadSide));
        }

        let (table, entry) = match self.walk_checked(env.mem, env.cpu, lin_addr, true) {
            Ok(entries) => entries,
            Err(_) => return Ok(None),
        };
        if env.cpu.arch.user_access_blocked(entry.user(), table.user())
            || !entry.writable()
            || !table.writable()
        {
            debug!(
                cpl = env.cpu.cpl,
                "probed write to read-only linked page at {lin_addr:#010x} would fault"
            );
            self.record_pending(env.cpu, lin_addr, protection_code(true));
            return Ok(None);
        }
        self.link_page(env.mem, lin_page, entry.base())?;
        Ok(Some(RoWrite::WriteSide))
    }
}
