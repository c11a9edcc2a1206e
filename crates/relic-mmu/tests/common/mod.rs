#![allow(dead_code)]

use relic_mem::MemoryMap;
use relic_mmu::{
    CoreExit, CpuState, Env, Error, ExecCore, Paging, PTE_P, PTE_US, PTE_WR,
};

pub const DIR_BASE: u32 = 0x1000;
pub const TABLE_BASE: u32 = 0x2000;

/// Marker EIP the scripted cores park the CPU at while a fault handler is
/// "running". Never dereferenced.
pub const HANDLER_EIP: u32 = 0xFFFF_0000;

pub fn pte_addr(index: u32) -> u32 {
    TABLE_BASE + index * 4
}

pub fn set_pte(mem: &mut MemoryMap, index: u32, val: u32) {
    mem.phys_writed(pte_addr(index), val);
}

/// A machine with paging enabled: directory at `DIR_BASE`, its first entry
/// pointing at an empty user/writable page table at `TABLE_BASE`.
pub fn paged_machine(pages: u32) -> (Paging, MemoryMap, CpuState) {
    let mut mem = MemoryMap::new(pages);
    mem.phys_writed(DIR_BASE, TABLE_BASE | PTE_P | PTE_WR | PTE_US);
    let mut paging = Paging::new();
    paging.set_dir_base(DIR_BASE);
    paging.enable(&mut NopCore, true);
    (paging, mem, CpuState::default())
}

/// Core for accesses that must not fault.
pub struct NopCore;

impl ExecCore for NopCore {
    fn step(
        &mut self,
        _paging: &mut Paging,
        _mem: &mut MemoryMap,
        _cpu: &mut CpuState,
    ) -> Result<CoreExit, Error> {
        Ok(CoreExit::Shutdown)
    }

    fn deliver_page_fault(
        &mut self,
        _paging: &mut Paging,
        _mem: &mut MemoryMap,
        _cpu: &mut CpuState,
        _error_code: u32,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Scripted guest #PF handler: each fault applies the next queued table fix
/// and returns to the faulting instruction in a single step.
pub struct FixupCore {
    pub fixes: std::collections::VecDeque<(u32, u32)>,
    pub delivered: Vec<u32>,
    saved: Vec<(u16, u32)>,
}

impl FixupCore {
    pub fn new(fixes: &[(u32, u32)]) -> Self {
        Self {
            fixes: fixes.iter().copied().collect(),
            delivered: Vec::new(),
            saved: Vec::new(),
        }
    }
}

impl ExecCore for FixupCore {
    fn step(
        &mut self,
        _paging: &mut Paging,
        mem: &mut MemoryMap,
        cpu: &mut CpuState,
    ) -> Result<CoreExit, Error> {
        assert_eq!(cpu.eip, HANDLER_EIP, "stepped outside the fault handler");
        if let Some((addr, val)) = self.fixes.pop_front() {
            mem.phys_writed(addr, val);
        }
        let (cs, eip) = self.saved.pop().unwrap();
        cpu.cs = cs;
        cpu.eip = eip;
        Ok(CoreExit::Continue)
    }

    fn deliver_page_fault(
        &mut self,
        _paging: &mut Paging,
        _mem: &mut MemoryMap,
        cpu: &mut CpuState,
        error_code: u32,
    ) -> Result<(), Error> {
        self.delivered.push(error_code);
        self.saved.push((cpu.cs, cpu.eip));
        cpu.eip = HANDLER_EIP;
        Ok(())
    }
}

/// Convenience for tests that only need one linear access.
pub fn with_env<R>(
    paging: &mut Paging,
    mem: &mut MemoryMap,
    cpu: &mut CpuState,
    core: &mut dyn ExecCore,
    f: impl FnOnce(&mut Paging, &mut Env<'_>) -> R,
) -> R {
    let mut env = Env::new(mem, cpu, core);
    f(paging, &mut env)
}
