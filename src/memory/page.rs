//! Physical memory pages.

use serde::{Deserialize, Serialize};

use crate::error::{AccessKind, Fault};
use crate::memory::PAGE_SIZE;

/// Access flags carried by every physical page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFlags {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub dirty: bool,
    pub cached: bool,
    pub global: bool,
}

impl PageFlags {
    /// Readable + writable data page.
    pub fn rw() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    /// Readable + executable code page.
    pub fn rx() -> Self {
        Self {
            read: true,
            execute: true,
            ..Self::default()
        }
    }

    /// True when `kind` is permitted by these flags.
    pub fn permits(&self, kind: AccessKind) -> bool {
        match kind {
            AccessKind::Read => self.read,
            AccessKind::Write => self.write,
            AccessKind::Execute => self.execute,
        }
    }

    /// Pack into the low bits of a word (PTE layout, snapshot layout).
    pub fn to_bits(self) -> u32 {
        (self.read as u32) << 1
            | (self.write as u32) << 2
            | (self.execute as u32) << 3
            | (self.dirty as u32) << 4
            | (self.cached as u32) << 5
            | (self.global as u32) << 6
    }

    /// Inverse of [`PageFlags::to_bits`].
    pub fn from_bits(bits: u32) -> Self {
        Self {
            read: bits & (1 << 1) != 0,
            write: bits & (1 << 2) != 0,
            execute: bits & (1 << 3) != 0,
            dirty: bits & (1 << 4) != 0,
            cached: bits & (1 << 5) != 0,
            global: bits & (1 << 6) != 0,
        }
    }
}

impl std::fmt::Display for PageFlags {
    /// `RWXD` style string, `-` for a cleared flag.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}{}{}",
            if self.read { 'R' } else { '-' },
            if self.write { 'W' } else { '-' },
            if self.execute { 'X' } else { '-' },
            if self.dirty { 'D' } else { '-' },
            if self.global { 'G' } else { '-' },
        )
    }
}

/// One 256-byte page of physical memory. Pages are created zeroed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// Serial number of this page (base address >> PAGE_SHIFT).
    pub index: u32,
    pub flags: PageFlags,
    /// Core that allocated this page; `None` means machine-owned.
    /// Ownership is only enforced for non-global pages.
    pub owner: Option<usize>,
    data: Vec<u8>,
}

impl Page {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            flags: PageFlags::default(),
            owner: None,
            data: vec![0; PAGE_SIZE as usize],
        }
    }

    /// Physical base address of this page.
    pub fn base_address(&self) -> u32 {
        self.index << crate::memory::PAGE_SHIFT
    }

    /// Check `kind` against page flags and ownership.
    ///
    /// `core` identifies the requester; a non-global page owned by a
    /// different core denies every access.
    pub fn check_access(&self, offset: u32, kind: AccessKind, core: Option<usize>) -> Result<(), Fault> {
        let addr = self.base_address() + offset;

        if !self.flags.global {
            if let (Some(owner), Some(requester)) = (self.owner, core) {
                if owner != requester {
                    return Err(Fault::AccessViolation { addr, kind });
                }
            }
        }

        if !self.flags.permits(kind) {
            return Err(Fault::AccessViolation { addr, kind });
        }

        Ok(())
    }

    pub fn read_u8(&self, offset: u32) -> u8 {
        self.data[offset as usize]
    }

    pub fn read_u16(&self, offset: u32) -> u16 {
        let o = offset as usize;
        u16::from_le_bytes([self.data[o], self.data[o + 1]])
    }

    pub fn read_u32(&self, offset: u32) -> u32 {
        let o = offset as usize;
        u32::from_le_bytes([self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]])
    }

    pub fn write_u8(&mut self, offset: u32, value: u8) {
        self.data[offset as usize] = value;
        self.flags.dirty = true;
    }

    pub fn write_u16(&mut self, offset: u32, value: u16) {
        self.data[offset as usize..offset as usize + 2].copy_from_slice(&value.to_le_bytes());
        self.flags.dirty = true;
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) {
        self.data[offset as usize..offset as usize + 4].copy_from_slice(&value.to_le_bytes());
        self.flags.dirty = true;
    }

    /// Zero the page contents.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.flags.dirty = true;
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_zeroed_on_creation() {
        let page = Page::new(3);
        assert!(page.as_bytes().iter().all(|&b| b == 0));
        assert_eq!(page.base_address(), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_word_roundtrip_little_endian() {
        let mut page = Page::new(0);
        page.write_u32(8, 0x1234_5678);
        assert_eq!(page.read_u32(8), 0x1234_5678);
        assert_eq!(page.read_u8(8), 0x78);
        assert_eq!(page.read_u8(11), 0x12);
        assert_eq!(page.read_u16(10), 0x1234);
        assert!(page.flags.dirty);
    }

    #[test]
    fn test_access_checks() {
        let mut page = Page::new(0);
        page.flags = PageFlags::rw();

        assert!(page.check_access(0, AccessKind::Read, None).is_ok());
        assert!(page.check_access(0, AccessKind::Write, None).is_ok());
        assert!(matches!(
            page.check_access(4, AccessKind::Execute, None),
            Err(Fault::AccessViolation { addr: 4, .. })
        ));
    }

    #[test]
    fn test_ownership_blocks_foreign_core() {
        let mut page = Page::new(1);
        page.flags = PageFlags::rw();
        page.owner = Some(0);

        assert!(page.check_access(0, AccessKind::Read, Some(0)).is_ok());
        assert!(page.check_access(0, AccessKind::Read, None).is_ok());
        assert!(matches!(
            page.check_access(0, AccessKind::Read, Some(1)),
            Err(Fault::AccessViolation { .. })
        ));

        page.flags.global = true;
        assert!(page.check_access(0, AccessKind::Read, Some(1)).is_ok());
    }

    #[test]
    fn test_flag_bits_roundtrip() {
        let flags = PageFlags {
            read: true,
            write: false,
            execute: true,
            dirty: false,
            cached: true,
            global: true,
        };
        assert_eq!(PageFlags::from_bits(flags.to_bits()), flags);
    }
}
