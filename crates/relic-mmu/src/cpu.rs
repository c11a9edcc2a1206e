//! The CPU-side seam of the paging unit.
//!
//! The paging unit never executes instructions itself. When a guest page
//! fault has to be resolved it hands control to an [`ExecCore`], which
//! vectors into the guest's #PF handler and executes it one instruction at a
//! time while the fault engine watches for the handler to return. Everything
//! the unit needs to know about the CPU lives in [`CpuState`].

use crate::{Error, Paging};
use relic_mem::MemoryMap;

/// CPU generations with distinct paging privilege behavior.
///
/// The slow variants re-check user and write permission on every access
/// instead of trusting a fully linked TLB slot, which is what real silicon
/// of that generation did for supervisor writes to read-only user pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Permissive blend: fast linking, 386-style user checks.
    Mixed,
    I386Fast,
    I386Slow,
    I486OldSlow,
    I486NewSlow,
    PentiumSlow,
}

impl Architecture {
    /// 486 and later require the user bit in both levels; the 386 lets
    /// either level grant user access.
    #[inline]
    pub(crate) fn user_access_blocked(self, entry_user: bool, table_user: bool) -> bool {
        match self {
            Architecture::Mixed | Architecture::I386Fast | Architecture::I386Slow => {
                !entry_user && !table_user
            }
            Architecture::I486OldSlow
            | Architecture::I486NewSlow
            | Architecture::PentiumSlow => !entry_user || !table_user,
        }
    }

    /// Whether deferred permission checks apply: the slot is linked for the
    /// current access only and torn down (or downgraded) right after it.
    #[inline]
    pub(crate) fn defers_privilege_checks(self) -> bool {
        matches!(
            self,
            Architecture::I386Slow
                | Architecture::I486OldSlow
                | Architecture::I486NewSlow
                | Architecture::PentiumSlow
        )
    }
}

/// A guest page fault, as a value. These are resolved by the fault engine or
/// parked in [`CpuState::pending`] by the checked access paths; they are
/// never reported through [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub lin_addr: u32,
    pub error_code: u32,
}

/// CPU state the paging unit reads and, during fault resolution, edits.
#[derive(Debug, Clone)]
pub struct CpuState {
    /// Current privilege level of the executing code.
    pub cpl: u8,
    /// Memory privilege level. Masks `cpl` for paging checks; forced to 3
    /// while a page fault handler runs so the handler's own accesses are
    /// checked as user accesses.
    pub mpl: u8,
    pub cs: u16,
    pub eip: u32,
    pub arch: Architecture,
    /// Fault recorded by a checked (non-faulting) access, for the caller to
    /// deliver on its own terms.
    pub pending: Option<PageFault>,
}

impl CpuState {
    pub fn new(arch: Architecture) -> Self {
        Self {
            cpl: 0,
            mpl: 3,
            cs: 0,
            eip: 0,
            arch,
            pending: None,
        }
    }

    /// True when user-mode write protection applies to the current access.
    #[inline]
    pub fn user_write_prohibited(&self) -> bool {
        self.cpl & self.mpl == 3
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new(Architecture::Mixed)
    }
}

/// Outcome of executing one guest instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreExit {
    Continue,
    /// The machine is shutting down. Fatal while a fault is being resolved.
    Shutdown,
}

/// Instruction execution engine driven by the fault engine.
///
/// A core that touches guest memory from inside [`ExecCore::step`] reborrows
/// itself into a fresh [`Env`], which is what lets page faults nest: the
/// inner access runs the fault engine recursively with the same core.
pub trait ExecCore {
    /// Executes exactly one guest instruction.
    fn step(
        &mut self,
        paging: &mut Paging,
        mem: &mut MemoryMap,
        cpu: &mut CpuState,
    ) -> Result<CoreExit, Error>;

    /// Vectors the CPU into the guest #PF handler with the given error code.
    /// CR2 has already been set by the fault engine.
    fn deliver_page_fault(
        &mut self,
        paging: &mut Paging,
        mem: &mut MemoryMap,
        cpu: &mut CpuState,
        error_code: u32,
    ) -> Result<(), Error>;

    /// Called when CR0.PG is switched on, before the TLB is cleared. Cores
    /// that cache decoded code use this to drop translations made under the
    /// old address space.
    fn on_paging_enabled(&mut self) {}

    /// Arithmetic flag state saved around fault resolution, so the guest
    /// handler cannot clobber the flags of the faulting instruction.
    fn save_arith_flags(&self) -> u64 {
        0
    }

    fn restore_arith_flags(&mut self, _flags: u64) {}
}

/// The collaborators a linear memory access needs, bundled so the paging
/// unit's entry points take one borrow instead of three.
pub struct Env<'a> {
    pub mem: &'a mut MemoryMap,
    pub cpu: &'a mut CpuState,
    pub core: &'a mut dyn ExecCore,
}

impl<'a> Env<'a> {
    pub fn new(
        mem: &'a mut MemoryMap,
        cpu: &'a mut CpuState,
        core: &'a mut dyn ExecCore,
    ) -> Self {
        Self { mem, cpu, core }
    }
}
