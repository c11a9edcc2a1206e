//! 32-bit page directory / page table entry codec.
//!
//! Directory and table entries share one layout, so a single type covers
//! both levels of the walk.

pub const PTE_P: u32 = 1 << 0;
pub const PTE_WR: u32 = 1 << 1;
pub const PTE_US: u32 = 1 << 2;
pub const PTE_A: u32 = 1 << 5;
pub const PTE_D: u32 = 1 << 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry(u32);

impl PageEntry {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn present(self) -> bool {
        self.0 & PTE_P != 0
    }

    #[inline]
    pub const fn writable(self) -> bool {
        self.0 & PTE_WR != 0
    }

    #[inline]
    pub const fn user(self) -> bool {
        self.0 & PTE_US != 0
    }

    #[inline]
    pub const fn accessed(self) -> bool {
        self.0 & PTE_A != 0
    }

    #[inline]
    pub const fn dirty(self) -> bool {
        self.0 & PTE_D != 0
    }

    /// Physical page frame number held in bits 12..32.
    #[inline]
    pub const fn base(self) -> u32 {
        self.0 >> 12
    }

    #[inline]
    pub fn set_accessed(&mut self) {
        self.0 |= PTE_A;
    }

    #[inline]
    pub fn set_dirty(&mut self) {
        self.0 |= PTE_D;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_decode_independently() {
        let e = PageEntry::from_raw(PTE_P | PTE_US | PTE_D);
        assert!(e.present());
        assert!(!e.writable());
        assert!(e.user());
        assert!(!e.accessed());
        assert!(e.dirty());
    }

    #[test]
    fn base_is_bits_12_to_31() {
        let e = PageEntry::from_raw(0xABCD_E000 | PTE_P | PTE_WR);
        assert_eq!(e.base(), 0xABCDE);
        assert_eq!(e.raw() & 0xFFF, PTE_P | PTE_WR);
    }

    #[test]
    fn accessed_and_dirty_updates_preserve_base() {
        let mut e = PageEntry::from_raw(0x0001_2000 | PTE_P);
        e.set_accessed();
        e.set_dirty();
        assert_eq!(e.base(), 0x12);
        assert!(e.accessed());
        assert!(e.dirty());
        assert_eq!(e.raw(), 0x0001_2000 | PTE_P | PTE_A | PTE_D);
    }
}
