//! Physical memory map for a 32-bit PC-class machine.
//!
//! Guest RAM is a single flat allocation starting at physical address zero.
//! Every 4 KiB physical page carries a backing kind: plain RAM, ROM (reads go
//! to RAM, writes are dropped), or an MMIO handler registered for that page.
//! Pages past the end of the map behave as open bus.
//!
//! Two access layers are exposed:
//! * `phys_*` accessors read and write raw RAM directly, bypassing MMIO
//!   dispatch. Page walkers and other machine-internal consumers use these.
//! * `readb`/`writeb` and friends dispatch through the page backing, so a
//!   device register read lands in its [`MmioPage`] handler.

use bitflags::bitflags;
use tracing::warn;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

bitflags! {
    /// Access properties of one physical page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u8 {
        /// Reads may go straight to host RAM, no dispatch needed.
        const READABLE = 0x01;
        /// Writes may go straight to host RAM.
        const WRITEABLE = 0x02;
        /// Backed by ROM: readable, writes are silently dropped.
        const HAS_ROM = 0x04;
        /// Code must not be cached from this page (device registers).
        const NOCODE = 0x10;
    }
}

/// Handler for one or more MMIO-backed physical pages.
///
/// Only the byte accessors are mandatory; the wider ones default to
/// little-endian byte composition, which is good enough for most device
/// models and exact for the ones that only decode byte lanes.
pub trait MmioPage {
    fn readb(&mut self, addr: u32) -> u8;
    fn writeb(&mut self, addr: u32, val: u8);

    fn readw(&mut self, addr: u32) -> u16 {
        u16::from(self.readb(addr)) | u16::from(self.readb(addr.wrapping_add(1))) << 8
    }

    fn readd(&mut self, addr: u32) -> u32 {
        u32::from(self.readw(addr)) | u32::from(self.readw(addr.wrapping_add(2))) << 16
    }

    fn writew(&mut self, addr: u32, val: u16) {
        self.writeb(addr, val as u8);
        self.writeb(addr.wrapping_add(1), (val >> 8) as u8);
    }

    fn writed(&mut self, addr: u32, val: u32) {
        self.writew(addr, val as u16);
        self.writew(addr.wrapping_add(2), (val >> 16) as u16);
    }
}

#[derive(Clone, Copy)]
enum PageBacking {
    Ram,
    Rom,
    Mmio(usize),
}

/// The machine's physical address space.
pub struct MemoryMap {
    ram: Vec<u8>,
    backing: Vec<PageBacking>,
    mmio: Vec<Box<dyn MmioPage>>,
}

impl MemoryMap {
    /// Creates a map with `pages` 4 KiB pages of RAM starting at address zero.
    pub fn new(pages: u32) -> Self {
        Self {
            ram: vec![0u8; pages as usize * PAGE_SIZE],
            backing: vec![PageBacking::Ram; pages as usize],
            mmio: Vec::new(),
        }
    }

    pub fn pages(&self) -> u32 {
        self.backing.len() as u32
    }

    /// Marks a page range as ROM. Existing RAM contents become the ROM image.
    pub fn set_rom(&mut self, first_page: u32, count: u32) {
        for page in self.page_range(first_page, count) {
            self.backing[page] = PageBacking::Rom;
        }
    }

    /// Routes a page range to an MMIO handler.
    pub fn set_page_handler(&mut self, first_page: u32, count: u32, handler: Box<dyn MmioPage>) {
        let index = self.mmio.len();
        self.mmio.push(handler);
        for page in self.page_range(first_page, count) {
            self.backing[page] = PageBacking::Mmio(index);
        }
    }

    /// Puts a page range back to plain RAM backing.
    pub fn reset_page_handler(&mut self, first_page: u32, count: u32) {
        for page in self.page_range(first_page, count) {
            self.backing[page] = PageBacking::Ram;
        }
    }

    fn page_range(&self, first_page: u32, count: u32) -> std::ops::Range<usize> {
        let end = first_page.saturating_add(count).min(self.pages());
        first_page.min(self.pages()) as usize..end as usize
    }

    pub fn page_flags(&self, phys_page: u32) -> MemFlags {
        match self.backing.get(phys_page as usize) {
            Some(PageBacking::Ram) => MemFlags::READABLE | MemFlags::WRITEABLE,
            Some(PageBacking::Rom) => MemFlags::READABLE | MemFlags::HAS_ROM,
            Some(PageBacking::Mmio(_)) => MemFlags::NOCODE,
            None => MemFlags::empty(),
        }
    }

    /// Base offset into host RAM for a direct-access page, `None` when the
    /// page has no host backing (MMIO or out of range).
    pub fn host_base(&self, phys_page: u32) -> Option<u32> {
        match self.backing.get(phys_page as usize) {
            Some(PageBacking::Ram | PageBacking::Rom) => Some(phys_page << PAGE_SHIFT),
            _ => None,
        }
    }

    /// Copies `data` into RAM at `addr`, ignoring ROM protection. Used to
    /// seed firmware images and test fixtures.
    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        match self.ram.get_mut(start..start + data.len()) {
            Some(dst) => dst.copy_from_slice(data),
            None => warn!("load of {} bytes at {addr:#010x} is out of range", data.len()),
        }
    }

    // Raw RAM accessors. Out-of-range reads return all-ones, out-of-range
    // writes are dropped; both are logged since they indicate a bad guest
    // physical address rather than a device access.

    #[inline]
    pub fn phys_readb(&self, addr: u32) -> u8 {
        match self.ram.get(addr as usize) {
            Some(&b) => b,
            None => {
                warn!("physical byte read at {addr:#010x} is beyond RAM");
                0xFF
            }
        }
    }

    #[inline]
    pub fn phys_readw(&self, addr: u32) -> u16 {
        let a = addr as usize;
        match self.ram.get(a..a + 2) {
            Some(b) => {
                let mut buf = [0u8; 2];
                buf.copy_from_slice(b);
                u16::from_le_bytes(buf)
            }
            None => {
                warn!("physical word read at {addr:#010x} is beyond RAM");
                0xFFFF
            }
        }
    }

    #[inline]
    pub fn phys_readd(&self, addr: u32) -> u32 {
        let a = addr as usize;
        match self.ram.get(a..a + 4) {
            Some(b) => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(b);
                u32::from_le_bytes(buf)
            }
            None => {
                warn!("physical dword read at {addr:#010x} is beyond RAM");
                0xFFFF_FFFF
            }
        }
    }

    #[inline]
    pub fn phys_readq(&self, addr: u32) -> u64 {
        u64::from(self.phys_readd(addr)) | u64::from(self.phys_readd(addr.wrapping_add(4))) << 32
    }

    #[inline]
    pub fn phys_writeb(&mut self, addr: u32, val: u8) {
        match self.ram.get_mut(addr as usize) {
            Some(b) => *b = val,
            None => warn!("physical byte write at {addr:#010x} is beyond RAM"),
        }
    }

    #[inline]
    pub fn phys_writew(&mut self, addr: u32, val: u16) {
        let a = addr as usize;
        match self.ram.get_mut(a..a + 2) {
            Some(b) => b.copy_from_slice(&val.to_le_bytes()),
            None => warn!("physical word write at {addr:#010x} is beyond RAM"),
        }
    }

    #[inline]
    pub fn phys_writed(&mut self, addr: u32, val: u32) {
        let a = addr as usize;
        match self.ram.get_mut(a..a + 4) {
            Some(b) => b.copy_from_slice(&val.to_le_bytes()),
            None => warn!("physical dword write at {addr:#010x} is beyond RAM"),
        }
    }

    #[inline]
    pub fn phys_writeq(&mut self, addr: u32, val: u64) {
        self.phys_writed(addr, val as u32);
        self.phys_writed(addr.wrapping_add(4), (val >> 32) as u32);
    }

    // Dispatching accessors. Wide accesses that stay inside one page go to
    // that page's backing in one shot; accesses that straddle a page boundary
    // are split into bytes so each page sees its own backing.

    pub fn readb(&mut self, addr: u32) -> u8 {
        match self.backing.get((addr >> PAGE_SHIFT) as usize) {
            Some(PageBacking::Ram | PageBacking::Rom) => self.ram[addr as usize],
            Some(PageBacking::Mmio(i)) => {
                let i = *i;
                self.mmio[i].readb(addr)
            }
            None => {
                warn!("open-bus byte read at {addr:#010x}");
                0xFF
            }
        }
    }

    pub fn readw(&mut self, addr: u32) -> u16 {
        if addr & 0xFFF < 0xFFF {
            match self.backing.get((addr >> PAGE_SHIFT) as usize) {
                Some(PageBacking::Ram | PageBacking::Rom) => self.phys_readw(addr),
                Some(PageBacking::Mmio(i)) => {
                    let i = *i;
                    self.mmio[i].readw(addr)
                }
                None => {
                    warn!("open-bus word read at {addr:#010x}");
                    0xFFFF
                }
            }
        } else {
            u16::from(self.readb(addr)) | u16::from(self.readb(addr.wrapping_add(1))) << 8
        }
    }

    pub fn readd(&mut self, addr: u32) -> u32 {
        if addr & 0xFFF < 0xFFD {
            match self.backing.get((addr >> PAGE_SHIFT) as usize) {
                Some(PageBacking::Ram | PageBacking::Rom) => self.phys_readd(addr),
                Some(PageBacking::Mmio(i)) => {
                    let i = *i;
                    self.mmio[i].readd(addr)
                }
                None => {
                    warn!("open-bus dword read at {addr:#010x}");
                    0xFFFF_FFFF
                }
            }
        } else {
            u32::from(self.readw(addr)) | u32::from(self.readw(addr.wrapping_add(2))) << 16
        }
    }

    pub fn readq(&mut self, addr: u32) -> u64 {
        u64::from(self.readd(addr)) | u64::from(self.readd(addr.wrapping_add(4))) << 32
    }

    pub fn writeb(&mut self, addr: u32, val: u8) {
        match self.backing.get((addr >> PAGE_SHIFT) as usize) {
            Some(PageBacking::Ram) => self.ram[addr as usize] = val,
            Some(PageBacking::Rom) => warn!("byte write to ROM at {addr:#010x} dropped"),
            Some(PageBacking::Mmio(i)) => {
                let i = *i;
                self.mmio[i].writeb(addr, val);
            }
            None => warn!("open-bus byte write at {addr:#010x} dropped"),
        }
    }

    pub fn writew(&mut self, addr: u32, val: u16) {
        if addr & 0xFFF < 0xFFF {
            match self.backing.get((addr >> PAGE_SHIFT) as usize) {
                Some(PageBacking::Ram) => self.phys_writew(addr, val),
                Some(PageBacking::Rom) => warn!("word write to ROM at {addr:#010x} dropped"),
                Some(PageBacking::Mmio(i)) => {
                    let i = *i;
                    self.mmio[i].writew(addr, val);
                }
                None => warn!("open-bus word write at {addr:#010x} dropped"),
            }
        } else {
            self.writeb(addr, val as u8);
            self.writeb(addr.wrapping_add(1), (val >> 8) as u8);
        }
    }

    pub fn writed(&mut self, addr: u32, val: u32) {
        if addr & 0xFFF < 0xFFD {
            match self.backing.get((addr >> PAGE_SHIFT) as usize) {
                Some(PageBacking::Ram) => self.phys_writed(addr, val),
                Some(PageBacking::Rom) => warn!("dword write to ROM at {addr:#010x} dropped"),
                Some(PageBacking::Mmio(i)) => {
                    let i = *i;
                    self.mmio[i].writed(addr, val);
                }
                None => warn!("open-bus dword write at {addr:#010x} dropped"),
            }
        } else {
            self.writew(addr, val as u16);
            self.writew(addr.wrapping_add(2), (val >> 16) as u16);
        }
    }

    pub fn writeq(&mut self, addr: u32, val: u64) {
        self.writed(addr, val as u32);
        self.writed(addr.wrapping_add(4), (val >> 32) as u32);
    }
}
