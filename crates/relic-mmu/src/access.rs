//! Linear-address memory accesses.
//!
//! Every access indexes the TLB slot for its linear page. A populated bias
//! turns the access into a single host RAM access. Otherwise the slot's
//! handler routing decides: a lazy slot is resolved (possibly raising and
//! resolving a guest page fault along the way) and the access retried, a
//! walked MMIO/ROM slot dispatches through physical memory.
//!
//! Word and dword accesses that cross a page boundary are split into byte
//! accesses, so each page applies its own translation and each side can
//! fault independently. Qword accesses split into two dwords for the same
//! reason.
//!
//! The `*_checked` variants never run the fault engine. A fault that would
//! have been raised is parked in [`crate::CpuState::pending`] instead and
//! signalled through the return value.

use crate::cpu::Env;
use crate::init_page::RoWrite;
use crate::tlb::{ReadHandler, WriteHandler};
use crate::{Error, Paging};

impl Paging {
    pub fn readb(&mut self, env: &mut Env<'_>, lin_addr: u32) -> Result<u8, Error> {
        let slot = *self.tlb.slot(lin_addr >> 12);
        if let Some(bias) = slot.read {
            return Ok(env.mem.phys_readb(bias.resolve(lin_addr)));
        }
        match slot.read_handler {
            ReadHandler::Init => {
                let relink = self.init_page(env, lin_addr, false)?;
                let val = self.readb(env, lin_addr)?;
                self.apply_relink(env.mem, relink, lin_addr)?;
                Ok(val)
            }
            ReadHandler::Mem => Ok(env.mem.readb(slot.phys_addr(lin_addr))),
        }
    }

    pub fn readw(&mut self, env: &mut Env<'_>, lin_addr: u32) -> Result<u16, Error> {
        if lin_addr & 0xFFF < 0xFFF {
            let slot = *self.tlb.slot(lin_addr >> 12);
            if let Some(bias) = slot.read {
                return Ok(env.mem.phys_readw(bias.resolve(lin_addr)));
            }
            match slot.read_handler {
                ReadHandler::Init => {
                    let relink = self.init_page(env, lin_addr, false)?;
                    let val = self.readw(env, lin_addr)?;
                    self.apply_relink(env.mem, relink, lin_addr)?;
                    Ok(val)
                }
                ReadHandler::Mem => Ok(env.mem.readw(slot.phys_addr(lin_addr))),
            }
        } else {
            let lo = self.readb(env, lin_addr)?;
            let hi = self.readb(env, lin_addr.wrapping_add(1))?;
            Ok(u16::from(lo) | u16::from(hi) << 8)
        }
    }

    pub fn readd(&mut self, env: &mut Env<'_>, lin_addr: u32) -> Result<u32, Error> {
        if lin_addr & 0xFFF < 0xFFD {
            let slot = *self.tlb.slot(lin_addr >> 12);
            if let Some(bias) = slot.read {
                return Ok(env.mem.phys_readd(bias.resolve(lin_addr)));
            }
            match slot.read_handler {
                ReadHandler::Init => {
                    let relink = self.init_page(env, lin_addr, false)?;
                    let val = self.readd(env, lin_addr)?;
                    self.apply_relink(env.mem, relink, lin_addr)?;
                    Ok(val)
                }
                ReadHandler::Mem => Ok(env.mem.readd(slot.phys_addr(lin_addr))),
            }
        } else {
            let lo = self.readw(env, lin_addr)?;
            let hi = self.readw(env, lin_addr.wrapping_add(2))?;
            Ok(u32::from(lo) | u32::from(hi) << 16)
        }
    }

    pub fn readq(&mut self, env: &mut Env<'_>, lin_addr: u32) -> Result<u64, Error> {
        let lo = self.readd(env, lin_addr)?;
        let hi = self.readd(env, lin_addr.wrapping_add(4))?;
        Ok(u64::from(lo) | u64::from(hi) << 32)
    }

    pub fn writeb(&mut self, env: &mut Env<'_>, lin_addr: u32, val: u8) -> Result<(), Error> {
        let slot = *self.tlb.slot(lin_addr >> 12);
        if let Some(bias) = slot.write {
            env.mem.phys_writeb(bias.resolve(lin_addr), val);
            return Ok(());
        }
        match slot.write_handler {
            WriteHandler::Init => {
                let relink = self.init_page(env, lin_addr, true)?;
                self.writeb(env, lin_addr, val)?;
                self.apply_relink(env.mem, relink, lin_addr)
            }
            WriteHandler::InitUserRo => {
                self.user_ro_init_page(env, lin_addr)?;
                self.write_through_read_side(env, lin_addr, |mem, addr| {
                    mem.phys_writeb(addr, val)
                }, |mem, addr| mem.writeb(addr, val));
                Ok(())
            }
            WriteHandler::Mem => {
                env.mem.writeb(slot.phys_addr(lin_addr), val);
                Ok(())
            }
        }
    }

    pub fn writew(&mut self, env: &mut Env<'_>, lin_addr: u32, val: u16) -> Result<(), Error> {
        if lin_addr & 0xFFF < 0xFFF {
            let slot = *self.tlb.slot(lin_addr >> 12);
            if let Some(bias) = slot.write {
                env.mem.phys_writew(bias.resolve(lin_addr), val);
                return Ok(());
            }
            match slot.write_handler {
                WriteHandler::Init => {
                    let relink = self.init_page(env, lin_addr, true)?;
                    self.writew(env, lin_addr, val)?;
                    self.apply_relink(env.mem, relink, lin_addr)
                }
                WriteHandler::InitUserRo => {
                    self.user_ro_init_page(env, lin_addr)?;
                    self.write_through_read_side(env, lin_addr, |mem, addr| {
                        mem.phys_writew(addr, val)
                    }, |mem, addr| mem.writew(addr, val));
                    Ok(())
                }
                WriteHandler::Mem => {
                    env.mem.writew(slot.phys_addr(lin_addr), val);
                    Ok(())
                }
            }
        } else {
            self.writeb(env, lin_addr, val as u8)?;
            self.writeb(env, lin_addr.wrapping_add(1), (val >> 8) as u8)
        }
    }

    pub fn writed(&mut self, env: &mut Env<'_>, lin_addr: u32, val: u32) -> Result<(), Error> {
        if lin_addr & 0xFFF < 0xFFD {
            let slot = *self.tlb.slot(lin_addr >> 12);
            if let Some(bias) = slot.write {
                env.mem.phys_writed(bias.resolve(lin_addr), val);
                return Ok(());
            }
            match slot.write_handler {
                WriteHandler::Init => {
                    let relink = self.init_page(env, lin_addr, true)?;
                    self.writed(env, lin_addr, val)?;
                    self.apply_relink(env.mem, relink, lin_addr)
                }
                WriteHandler::InitUserRo => {
                    self.user_ro_init_page(env, lin_addr)?;
                    self.write_through_read_side(env, lin_addr, |mem, addr| {
                        mem.phys_writed(addr, val)
                    }, |mem, addr| mem.writed(addr, val));
                    Ok(())
                }
                WriteHandler::Mem => {
                    env.mem.writed(slot.phys_addr(lin_addr), val);
                    Ok(())
                }
            }
        } else {
            self.writew(env, lin_addr, val as u16)?;
            self.writew(env, lin_addr.wrapping_add(2), (val >> 16) as u16)
        }
    }

    pub fn writeq(&mut self, env: &mut Env<'_>, lin_addr: u32, val: u64) -> Result<(), Error> {
        self.writed(env, lin_addr, val as u32)?;
        self.writed(env, lin_addr.wrapping_add(4), (val >> 32) as u32)
    }

    /// After the read-only write handler let a write through, the slot is
    /// either still read-only (supervisor write) or freshly promoted; in
    /// both cases the write lands through the read bias, falling back to
    /// dispatch for pages without host backing.
    fn write_through_read_side(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        host: impl FnOnce(&mut relic_mem::MemoryMap, u32),
        dispatch: impl FnOnce(&mut relic_mem::MemoryMap, u32),
    ) {
        let slot = *self.tlb.slot(lin_addr >> 12);
        match slot.read {
            Some(bias) => host(env.mem, bias.resolve(lin_addr)),
            None => dispatch(env.mem, slot.phys_addr(lin_addr)),
        }
    }

    // Checked variants. `Ok(None)` / `Ok(false)` mean the access was not
    // performed and the fault is waiting in `cpu.pending`.

    pub fn readb_checked(&mut self, env: &mut Env<'_>, lin_addr: u32) -> Result<Option<u8>, Error> {
        let slot = *self.tlb.slot(lin_addr >> 12);
        if let Some(bias) = slot.read {
            return Ok(Some(env.mem.phys_readb(bias.resolve(lin_addr))));
        }
        match slot.read_handler {
            ReadHandler::Init => {
                if self.init_page_check_only(env, lin_addr, false)? {
                    Ok(Some(self.readb(env, lin_addr)?))
                } else {
                    Ok(None)
                }
            }
            ReadHandler::Mem => Ok(Some(env.mem.readb(slot.phys_addr(lin_addr)))),
        }
    }

    pub fn readw_checked(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
    ) -> Result<Option<u16>, Error> {
        if lin_addr & 0xFFF < 0xFFF {
            let slot = *self.tlb.slot(lin_addr >> 12);
            if let Some(bias) = slot.read {
                return Ok(Some(env.mem.phys_readw(bias.resolve(lin_addr))));
            }
            match slot.read_handler {
                ReadHandler::Init => {
                    if self.init_page_check_only(env, lin_addr, false)? {
                        Ok(Some(self.readw(env, lin_addr)?))
                    } else {
                        Ok(None)
                    }
                }
                ReadHandler::Mem => Ok(Some(env.mem.readw(slot.phys_addr(lin_addr)))),
            }
        } else {
            let Some(lo) = self.readb_checked(env, lin_addr)? else {
                return Ok(None);
            };
            let Some(hi) = self.readb_checked(env, lin_addr.wrapping_add(1))? else {
                return Ok(None);
            };
            Ok(Some(u16::from(lo) | u16::from(hi) << 8))
        }
    }

    pub fn readd_checked(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
    ) -> Result<Option<u32>, Error> {
        if lin_addr & 0xFFF < 0xFFD {
            let slot = *self.tlb.slot(lin_addr >> 12);
            if let Some(bias) = slot.read {
                return Ok(Some(env.mem.phys_readd(bias.resolve(lin_addr))));
            }
            match slot.read_handler {
                ReadHandler::Init => {
                    if self.init_page_check_only(env, lin_addr, false)? {
                        Ok(Some(self.readd(env, lin_addr)?))
                    } else {
                        Ok(None)
                    }
                }
                ReadHandler::Mem => Ok(Some(env.mem.readd(slot.phys_addr(lin_addr)))),
            }
        } else {
            let Some(lo) = self.readw_checked(env, lin_addr)? else {
                return Ok(None);
            };
            let Some(hi) = self.readw_checked(env, lin_addr.wrapping_add(2))? else {
                return Ok(None);
            };
            Ok(Some(u32::from(lo) | u32::from(hi) << 16))
        }
    }

    /// Returns `Ok(true)` once the write has been performed.
    pub fn writeb_checked(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        val: u8,
    ) -> Result<bool, Error> {
        let slot = *self.tlb.slot(lin_addr >> 12);
        if let Some(bias) = slot.write {
            env.mem.phys_writeb(bias.resolve(lin_addr), val);
            return Ok(true);
        }
        match slot.write_handler {
            WriteHandler::Init => {
                if self.init_page_check_only(env, lin_addr, true)? {
                    self.writeb(env, lin_addr, val)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            WriteHandler::InitUserRo => match self.user_ro_check_only(env, lin_addr)? {
                Some(route) => {
                    self.write_ro_route(env, lin_addr, route, |mem, addr| {
                        mem.phys_writeb(addr, val)
                    }, |mem, addr| mem.writeb(addr, val));
                    Ok(true)
                }
                None => Ok(false),
            },
            WriteHandler::Mem => {
                env.mem.writeb(slot.phys_addr(lin_addr), val);
                Ok(true)
            }
        }
    }

    pub fn writew_checked(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        val: u16,
    ) -> Result<bool, Error> {
        if lin_addr & 0xFFF < 0xFFF {
            let slot = *self.tlb.slot(lin_addr >> 12);
            if let Some(bias) = slot.write {
                env.mem.phys_writew(bias.resolve(lin_addr), val);
                return Ok(true);
            }
            match slot.write_handler {
                WriteHandler::Init => {
                    if self.init_page_check_only(env, lin_addr, true)? {
                        self.writew(env, lin_addr, val)?;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                WriteHandler::InitUserRo => match self.user_ro_check_only(env, lin_addr)? {
                    Some(route) => {
                        self.write_ro_route(env, lin_addr, route, |mem, addr| {
                            mem.phys_writew(addr, val)
                        }, |mem, addr| mem.writew(addr, val));
                        Ok(true)
                    }
                    None => Ok(false),
                },
                WriteHandler::Mem => {
                    env.mem.writew(slot.phys_addr(lin_addr), val);
                    Ok(true)
                }
            }
        } else {
            if !self.writeb_checked(env, lin_addr, val as u8)? {
                return Ok(false);
            }
            self.writeb_checked(env, lin_addr.wrapping_add(1), (val >> 8) as u8)
        }
    }

    pub fn writed_checked(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        val: u32,
    ) -> Result<bool, Error> {
        if lin_addr & 0xFFF < 0xFFD {
            let slot = *self.tlb.slot(lin_addr >> 12);
            if let Some(bias) = slot.write {
                env.mem.phys_writed(bias.resolve(lin_addr), val);
                return Ok(true);
            }
            match slot.write_handler {
                WriteHandler::Init => {
                    if self.init_page_check_only(env, lin_addr, true)? {
                        self.writed(env, lin_addr, val)?;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                WriteHandler::InitUserRo => match self.user_ro_check_only(env, lin_addr)? {
                    Some(route) => {
                        self.write_ro_route(env, lin_addr, route, |mem, addr| {
                            mem.phys_writed(addr, val)
                        }, |mem, addr| mem.writed(addr, val));
                        Ok(true)
                    }
                    None => Ok(false),
                },
                WriteHandler::Mem => {
                    env.mem.writed(slot.phys_addr(lin_addr), val);
                    Ok(true)
                }
            }
        } else {
            if !self.writew_checked(env, lin_addr, val as u16)? {
                return Ok(false);
            }
            self.writew_checked(env, lin_addr.wrapping_add(2), (val >> 16) as u16)
        }
    }

    fn write_ro_route(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        route: RoWrite,
        host: impl FnOnce(&mut relic_mem::MemoryMap, u32),
        dispatch: impl FnOnce(&mut relic_mem::MemoryMap, u32),
    ) {
        let slot = *self.tlb.slot(lin_addr >> 12);
        let bias = match route {
            RoWrite::ReadSide => slot.read,
            RoWrite::WriteSide => slot.write,
        };
        match bias {
            Some(bias) => host(env.mem, bias.resolve(lin_addr)),
            None => dispatch(env.mem, slot.phys_addr(lin_addr)),
        }
    }
}
