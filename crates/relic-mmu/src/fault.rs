//! Page fault resolution engine.
//!
//! A lazy TLB handler that discovers a fault in the middle of a guest memory
//! access cannot simply unwind: the access must complete once the guest's
//! #PF handler has fixed the tables. The engine therefore delivers the fault
//! and then drives the execution core one instruction at a time, in place,
//! until the handler has made the faulting table entry present and returned
//! to the faulting instruction. Nested faults push further contexts and
//! resolve innermost-first.

use tracing::trace;

use crate::cpu::Env;
use crate::entry::PageEntry;
use crate::{Error, Paging, PF_STACK_SIZE};

/// One in-flight fault: where the guest was, which table entry faulted, and
/// the memory privilege level to restore on exit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PfEntry {
    pub cs: u16,
    pub eip: u32,
    /// Physical address of the directory or table entry that was not
    /// present, or of the leaf entry for a protection fault.
    pub page_addr: u32,
    pub mpl: u8,
}

impl Paging {
    /// Raises a guest page fault and runs the guest handler to completion.
    ///
    /// Returns once the entry at `page_addr` is present and execution is
    /// back at the faulting instruction, at which point the interrupted
    /// lazy handler retries its walk. `Err` means the host cannot continue
    /// (context stack exhausted or the core shut down mid-resolution).
    pub(crate) fn page_fault(
        &mut self,
        env: &mut Env<'_>,
        lin_addr: u32,
        page_addr: u32,
        error_code: u32,
    ) -> Result<(), Error> {
        self.cr2 = lin_addr;
        if self.pf_stack.len() >= PF_STACK_SIZE {
            return Err(Error::FaultStackOverflow {
                depth: self.pf_stack.len(),
                lin_addr,
            });
        }
        let saved = PfEntry {
            cs: env.cpu.cs,
            eip: env.cpu.eip,
            page_addr,
            mpl: env.cpu.mpl,
        };
        self.pf_stack.push(saved);
        self.stats.page_faults += 1;
        trace!(
            "entering page fault at {lin_addr:#010x} code {error_code:#04x} depth {}",
            self.pf_stack.len()
        );

        let flags = env.core.save_arith_flags();
        env.cpu.mpl = 3;
        let result = match env.core.deliver_page_fault(self, env.mem, env.cpu, error_code) {
            Err(e) => Err(e),
            Ok(()) => loop {
                match env.core.step(self, env.mem, env.cpu) {
                    Err(e) => break Err(e),
                    Ok(crate::CoreExit::Shutdown) => {
                        break Err(Error::CoreStopped { lin_addr });
                    }
                    Ok(crate::CoreExit::Continue) => {}
                }
                let entry = PageEntry::from_raw(env.mem.phys_readd(saved.page_addr));
                if entry.present() && env.cpu.cs == saved.cs && env.cpu.eip == saved.eip {
                    env.cpu.mpl = saved.mpl;
                    break Ok(());
                }
            },
        };
        self.pf_stack.pop();
        env.core.restore_arith_flags(flags);
        trace!(
            "leaving page fault at {lin_addr:#010x} depth {}",
            self.pf_stack.len()
        );
        result
    }
}
