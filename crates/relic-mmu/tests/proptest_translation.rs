//! Property test: the checked access layer agrees with a direct reading of
//! the page tables for arbitrary leaf permission combinations.

use proptest::prelude::*;
use relic_mem::MemoryMap;
use relic_mmu::{
    CoreExit, CpuState, Env, Error, ExecCore, PageFault, Paging, PTE_P, PTE_US, PTE_WR,
};

struct NopCore;

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

#[derive(Debug, Clone, Copy)]
struct Leaf {
    present: bool,
    writable: bool,
    user: bool,
}

prop_compose! {
    fn arb_leaf()(
        present in any::<bool>(),
        writable in any::<bool>(),
        user in any::<bool>(),
    ) -> Leaf {
        Leaf { present, writable, user }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn checked_accesses_match_the_tables(
        leaves in proptest::collection::vec(arb_leaf(), 16),
        writing in any::<bool>(),
        user_mode in any::<bool>(),
    ) {
        let mut mem = MemoryMap::new(64);
        // Supervisor-only, writable directory entry: the leaf alone decides
        // user access and write permission.
        mem.phys_writed(0x1000, 0x2000 | PTE_P | PTE_WR);
        for (i, leaf) in leaves.iter().enumerate() {
            let phys_page = 0x10 + i as u32;
            let mut raw = phys_page << 12;
            if leaf.present {
                raw |= PTE_P;
            }
            if leaf.writable {
                raw |= PTE_WR;
            }
            if leaf.user {
                raw |= PTE_US;
            }
            mem.phys_writed(0x2000 + i as u32 * 4, raw);
            mem.phys_writeb(phys_page << 12, 0x40 + i as u8);
        }

        let mut paging = Paging::new();
        paging.set_dir_base(0x1000);
        paging.enable(&mut NopCore, true);
        let mut cpu = CpuState::default();
        cpu.cpl = if user_mode { 3 } else { 0 };
        let mut core = NopCore;

        for (i, leaf) in leaves.iter().enumerate() {
            let lin = (i as u32) << 12;
            let phys = (0x10 + i as u32) << 12;
            cpu.pending = None;

            let expected_code = if !leaf.present {
                Some(
                    (if writing { 0x02 } else { 0x00 })
                        | if user_mode { 0x04 } else { 0x00 },
                )
            } else if user_mode && (!leaf.user || (writing && !leaf.writable)) {
                Some(0x05 | if writing { 0x02 } else { 0x00 })
            } else {
                None
            };

            let mut env = Env::new(&mut mem, &mut cpu, &mut core);
            if writing {
                let done = paging.writeb_checked(&mut env, lin, 0xA0 + i as u8).unwrap();
                prop_assert_eq!(done, expected_code.is_none());
            } else {
                let got = paging.readb_checked(&mut env, lin).unwrap();
                match expected_code {
                    Some(_) => prop_assert_eq!(got, None),
                    None => prop_assert_eq!(got, Some(0x40 + i as u8)),
                }
            }
            drop(env);

            match expected_code {
                Some(code) => prop_assert_eq!(
                    cpu.pending,
                    Some(PageFault { lin_addr: lin, error_code: code })
                ),
                None => {
                    prop_assert_eq!(cpu.pending, None);
                    if writing {
                        prop_assert_eq!(mem.phys_readb(phys), 0xA0 + i as u8);
                    }
                }
            }
        }
    }
}
