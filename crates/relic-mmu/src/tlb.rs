//! Flat software TLB, one slot per linear page.
//!
//! A linked slot caches the translation as a *host bias*: the host RAM
//! offset of the physical page minus the linear base of the slot's page.
//! Adding the full linear address to the bias yields the host offset
//! directly, so the hit path is one table index and one wrapping add.
//!
//! Pages that cannot be accessed through a bias (MMIO, or not yet walked)
//! fall back to the slot's read/write handlers. Every linked slot is also
//! recorded in the ledger so a full clear only visits slots that were
//! actually touched.

use crate::{PAGING_LINKS, TLB_SIZE};

/// Precomputed `host_base - lin_base`, in wrapping arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBias(u32);

impl HostBias {
    #[inline]
    pub(crate) fn new(host_base: u32, lin_base: u32) -> Self {
        Self(host_base.wrapping_sub(lin_base))
    }

    /// Host RAM offset for a linear address inside the slot's page.
    #[inline]
    pub fn resolve(self, lin_addr: u32) -> u32 {
        self.0.wrapping_add(lin_addr)
    }
}

/// Slow-path routing for reads through a slot without a read bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadHandler {
    /// Not walked yet; the first access performs the walk and links.
    Init,
    /// Walked; the access dispatches to physical memory (MMIO or ROM).
    Mem,
}

/// Slow-path routing for writes through a slot without a write bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHandler {
    Init,
    /// Linked read-only: a write re-checks privilege and either faults or
    /// promotes the slot to a full link.
    InitUserRo,
    Mem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbSlot {
    pub read: Option<HostBias>,
    pub write: Option<HostBias>,
    pub phys_page: u32,
    pub read_handler: ReadHandler,
    pub write_handler: WriteHandler,
}

impl TlbSlot {
    pub(crate) const LAZY: TlbSlot = TlbSlot {
        read: None,
        write: None,
        phys_page: 0,
        read_handler: ReadHandler::Init,
        write_handler: WriteHandler::Init,
    };

    /// Physical address of `lin_addr` through this slot. Only meaningful
    /// once the slot has been linked.
    #[inline]
    pub fn phys_addr(&self, lin_addr: u32) -> u32 {
        self.phys_page << 12 | lin_addr & 0xFFF
    }
}

pub(crate) struct Tlb {
    slots: Vec<TlbSlot>,
    links: Vec<u32>,
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self {
            slots: vec![TlbSlot::LAZY; TLB_SIZE as usize],
            links: Vec::with_capacity(PAGING_LINKS),
        }
    }

    #[inline]
    pub(crate) fn slot(&self, lin_page: u32) -> &TlbSlot {
        &self.slots[lin_page as usize]
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, lin_page: u32) -> &mut TlbSlot {
        &mut self.slots[lin_page as usize]
    }

    pub(crate) fn links_full(&self) -> bool {
        self.links.len() >= PAGING_LINKS
    }

    pub(crate) fn record_link(&mut self, lin_page: u32) {
        self.links.push(lin_page);
    }

    /// Pops the ledger tail if it is `lin_page`. Used by the deferred-check
    /// teardown, which always unlinks the page it just linked.
    pub(crate) fn pop_link_if_tail(&mut self, lin_page: u32) -> bool {
        if self.links.last() == Some(&lin_page) {
            self.links.pop();
            true
        } else {
            false
        }
    }

    pub(crate) fn linked_pages(&self) -> &[u32] {
        &self.links
    }

    pub(crate) fn unlink(&mut self, lin_page: u32, count: u32) {
        let end = lin_page.saturating_add(count).min(TLB_SIZE);
        for page in lin_page..end {
            self.slots[page as usize] = TlbSlot::LAZY;
        }
    }

    /// Resets every linked slot back to lazy and empties the ledger.
    pub(crate) fn clear(&mut self) {
        let Tlb { slots, links } = self;
        for &page in links.iter() {
            slots[page as usize] = TlbSlot::LAZY;
        }
        links.clear();
    }
}
