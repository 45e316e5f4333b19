//! Memory management unit.
//!
//! Every guest memory operation of a core goes through its MMU, which
//! handles translation, access control, and the two per-core caches:
//!
//! - a translation cache (TLB) mapping virtual page -> (physical frame,
//!   flags), flushed on page-table changes;
//! - an instruction cache mapping physical instruction pointer -> decoded
//!   instruction, invalidated whenever an executable page is written (the
//!   memory controller's code epoch) or by cache-control instructions.
//!
//! Both caches are advisory: a miss falls back to the authoritative walk
//! or fetch.
//!
//! The page table is two-level. A virtual address splits into L1 index
//! (bits 20..32), L2 index (bits 8..20), and page offset (bits 0..8).
//! Table entries are words: bit 0 present, bits 1..7 page flags, bits
//! 8..32 physical frame number (for L1 entries, the frame of the L2
//! table base). Privileged mode bypasses translation entirely; user mode
//! with translation disabled maps virtual = physical but still honors
//! page flags and ownership.

use std::collections::HashMap;

use log::debug;

use crate::cpu::isa::{self, Instruction};
use crate::error::{AccessKind, Fault};
use crate::memory::{addr_to_page, layout, MemoryController, PageFlags, PAGE_SHIFT};

/// Present bit of a page-table entry.
pub const PTE_PRESENT: u32 = 1;

/// Build a page-table entry word.
pub fn pte(frame: u32, flags: PageFlags) -> u32 {
    PTE_PRESENT | flags.to_bits() | frame << 8
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    frame: u32,
    flags: PageFlags,
}

/// Per-core MMU state.
pub struct Mmu {
    core_id: usize,
    pt_base: u32,
    pt_enabled: bool,
    tlb: HashMap<u32, TlbEntry>,
    icache: HashMap<u32, Instruction>,
    icache_epoch: u64,
}

impl Mmu {
    pub fn new(core_id: usize) -> Self {
        Self {
            core_id,
            pt_base: layout::DEFAULT_PT_BASE,
            pt_enabled: false,
            tlb: HashMap::new(),
            icache: HashMap::new(),
            icache_epoch: 0,
        }
    }

    pub fn pt_base(&self) -> u32 {
        self.pt_base
    }

    /// Set the page-table root. Flushes the TLB.
    pub fn set_pt_base(&mut self, base: u32) {
        debug!("mmu.set_pt_base: core={}, base=0x{:08x}", self.core_id, base);
        self.pt_base = base;
        self.flush_tlb();
    }

    pub fn pt_enabled(&self) -> bool {
        self.pt_enabled
    }

    /// Enable or disable translation. Flushes the TLB.
    pub fn set_pt_enabled(&mut self, enabled: bool) {
        debug!("mmu.set_pt_enabled: core={}, enabled={}", self.core_id, enabled);
        self.pt_enabled = enabled;
        self.flush_tlb();
    }

    pub fn flush_tlb(&mut self) {
        self.tlb.clear();
    }

    pub fn flush_icache(&mut self) {
        self.icache.clear();
    }

    pub fn reset(&mut self) {
        self.pt_base = layout::DEFAULT_PT_BASE;
        self.pt_enabled = false;
        self.flush_tlb();
        self.flush_icache();
    }

    /// Translate a virtual address and enforce access rights.
    ///
    /// Returns the physical address. Addresses outside the memory region
    /// are returned untranslated for the bus to route (the MMIO path);
    /// access control for those belongs to the owning device.
    pub fn translate(
        &mut self,
        mem: &MemoryController,
        vaddr: u32,
        kind: AccessKind,
        privileged: bool,
    ) -> Result<u32, Fault> {
        if privileged || !self.pt_enabled {
            // Identity mapping. Page flags and ownership still apply to
            // unprivileged accesses of allocated RAM.
            if !privileged && mem.contains(vaddr) {
                if let Some(page) = mem.page(addr_to_page(vaddr)) {
                    page.check_access(vaddr & crate::memory::PAGE_OFFSET_MASK, kind, Some(self.core_id))?;
                }
            }
            return Ok(vaddr);
        }

        let vpn = vaddr >> PAGE_SHIFT;
        let offset = vaddr & crate::memory::PAGE_OFFSET_MASK;

        let entry = match self.tlb.get(&vpn) {
            Some(entry) => *entry,
            None => {
                let entry = self.walk(mem, vaddr, kind)?;
                self.tlb.insert(vpn, entry);
                entry
            }
        };

        if !entry.flags.permits(kind) {
            return Err(Fault::AccessViolation { addr: vaddr, kind });
        }

        Ok(entry.frame << PAGE_SHIFT | offset)
    }

    /// Authoritative two-level walk.
    fn walk(&self, mem: &MemoryController, vaddr: u32, kind: AccessKind) -> Result<TlbEntry, Fault> {
        let l1_index = vaddr >> 20;
        let l2_index = vaddr >> 8 & 0xFFF;

        let l1_entry = mem
            .read_u32(self.pt_base + l1_index * 4)
            .map_err(|_| Fault::PageFault { addr: vaddr, kind })?;
        if l1_entry & PTE_PRESENT == 0 {
            return Err(Fault::PageFault { addr: vaddr, kind });
        }

        let l2_table = (l1_entry >> 8) << PAGE_SHIFT;
        let l2_entry = mem
            .read_u32(l2_table + l2_index * 4)
            .map_err(|_| Fault::PageFault { addr: vaddr, kind })?;
        if l2_entry & PTE_PRESENT == 0 {
            return Err(Fault::PageFault { addr: vaddr, kind });
        }

        debug!(
            "mmu.walk: core={}, vaddr=0x{:08x}, l1=0x{:08x}, l2=0x{:08x}",
            self.core_id, vaddr, l1_entry, l2_entry
        );

        Ok(TlbEntry {
            frame: l2_entry >> 8,
            flags: PageFlags::from_bits(l2_entry),
        })
    }

    /// Fetch and decode the instruction at virtual address `ip`.
    ///
    /// The decoded-instruction cache is keyed by physical address and
    /// dropped wholesale when any executable page has been written since
    /// the last fetch.
    pub fn fetch_instruction(
        &mut self,
        mem: &MemoryController,
        ip: u32,
        privileged: bool,
    ) -> Result<Instruction, Fault> {
        let paddr = self.translate(mem, ip, AccessKind::Execute, privileged)?;

        if self.icache_epoch != mem.code_epoch() {
            self.icache.clear();
            self.icache_epoch = mem.code_epoch();
        }

        if let Some(&inst) = self.icache.get(&paddr) {
            return Ok(inst);
        }

        // Not privileged access: instruction fetch honors the execute
        // flag even in kernel mode when translation is off.
        if let Some(page) = mem.page(addr_to_page(paddr)) {
            if !page.flags.execute {
                return Err(Fault::AccessViolation {
                    addr: ip,
                    kind: AccessKind::Execute,
                });
            }
        }

        let word = mem.read_u32(paddr)?;
        let inst = isa::decode(word)?;
        self.icache.insert(paddr, inst);
        Ok(inst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::isa::{encode, Reg};

    fn memory() -> MemoryController {
        MemoryController::new(0x10_0000, false).unwrap()
    }

    /// Map virtual page `vpn` to physical frame `frame` in a fresh
    /// two-level table rooted at `pt_base`.
    fn map(mem: &mut MemoryController, pt_base: u32, vaddr: u32, frame: u32, flags: PageFlags) {
        let l1_index = vaddr >> 20;
        let l2_index = vaddr >> 8 & 0xFFF;
        let l2_table = pt_base + 0x4000;

        mem.alloc_area(pt_base, 0x4000).ok();
        mem.alloc_area(l2_table, 0x4000).ok();
        mem.write_u32(pt_base + l1_index * 4, pte(l2_table >> PAGE_SHIFT, PageFlags::default()))
            .unwrap();
        mem.write_u32(l2_table + l2_index * 4, pte(frame, flags)).unwrap();
    }

    #[test]
    fn test_privileged_mode_is_identity() {
        let mut mem = memory();
        let mut mmu = Mmu::new(0);
        mmu.set_pt_enabled(true);

        let paddr = mmu
            .translate(&mem, 0xDEAD_BEEF, AccessKind::Read, true)
            .unwrap();
        assert_eq!(paddr, 0xDEAD_BEEF);

        // User mode without a mapping faults instead.
        mem.alloc_specific_page(0).unwrap();
        let err = mmu
            .translate(&mem, 0xDEAD_BEEF, AccessKind::Read, false)
            .unwrap_err();
        assert!(matches!(
            err,
            Fault::PageFault {
                addr: 0xDEAD_BEEF,
                kind: AccessKind::Read
            }
        ));
    }

    #[test]
    fn test_two_level_translation() {
        let mut mem = memory();
        let mut mmu = Mmu::new(0);
        let pt = 0x2_0000;

        // Virtual 0x0040_1200 -> physical frame 0x30.
        map(&mut mem, pt, 0x0040_1200, 0x30, PageFlags::rw());
        mmu.set_pt_base(pt);
        mmu.set_pt_enabled(true);

        let paddr = mmu
            .translate(&mem, 0x0040_1234, AccessKind::Read, false)
            .unwrap();
        assert_eq!(paddr, 0x30 << PAGE_SHIFT | 0x34);
    }

    #[test]
    fn test_flags_enforced_on_hit_and_miss() {
        let mut mem = memory();
        let mut mmu = Mmu::new(0);
        let pt = 0x2_0000;

        map(&mut mem, pt, 0x1000, 0x40, PageFlags::rx());
        mmu.set_pt_base(pt);
        mmu.set_pt_enabled(true);

        assert!(mmu.translate(&mem, 0x1000, AccessKind::Read, false).is_ok());
        assert!(mmu
            .translate(&mem, 0x1000, AccessKind::Execute, false)
            .is_ok());
        // Write denied both on the cold walk and the cached entry.
        for _ in 0..2 {
            assert!(matches!(
                mmu.translate(&mem, 0x1000, AccessKind::Write, false),
                Err(Fault::AccessViolation { addr: 0x1000, .. })
            ));
        }
    }

    #[test]
    fn test_tlb_flush_on_pt_change() {
        let mut mem = memory();
        let mut mmu = Mmu::new(0);
        let pt = 0x2_0000;

        map(&mut mem, pt, 0x1000, 0x40, PageFlags::rw());
        mmu.set_pt_base(pt);
        mmu.set_pt_enabled(true);
        assert_eq!(
            mmu.translate(&mem, 0x1000, AccessKind::Read, false).unwrap(),
            0x4000
        );

        // Remap under a different root; the stale entry must not survive
        // the base change.
        let pt2 = 0x4_0000;
        map(&mut mem, pt2, 0x1000, 0x41, PageFlags::rw());
        mmu.set_pt_base(pt2);
        assert_eq!(
            mmu.translate(&mem, 0x1000, AccessKind::Read, false).unwrap(),
            0x4100
        );
    }

    #[test]
    fn test_mmio_addresses_pass_through() {
        let mem = memory();
        let mut mmu = Mmu::new(0);

        // Above the memory region: the bus will route it.
        let paddr = mmu
            .translate(&mem, 0xF000_0000, AccessKind::Write, false)
            .unwrap();
        assert_eq!(paddr, 0xF000_0000);
    }

    #[test]
    fn test_fetch_decodes_and_caches() {
        let mut mem = memory();
        let mut mmu = Mmu::new(0);

        let word = encode(Instruction::Li { dst: Reg(0), imm: 7 });
        mem.alloc_specific_page(addr_to_page(0x1000)).unwrap();
        mem.page_mut(addr_to_page(0x1000)).unwrap().flags = PageFlags {
            read: true,
            write: true,
            execute: true,
            ..Default::default()
        };
        mem.write_u32(0x1000, word).unwrap();

        let inst = mmu.fetch_instruction(&mem, 0x1000, true).unwrap();
        assert_eq!(inst, Instruction::Li { dst: Reg(0), imm: 7 });

        // Overwrite the instruction; the epoch bump must drop the cached
        // decode.
        let word2 = encode(Instruction::Li { dst: Reg(0), imm: 9 });
        mem.write_u32(0x1000, word2).unwrap();
        let inst = mmu.fetch_instruction(&mem, 0x1000, true).unwrap();
        assert_eq!(inst, Instruction::Li { dst: Reg(0), imm: 9 });
    }

    #[test]
    fn test_fetch_requires_executable_page() {
        let mut mem = memory();
        let mut mmu = Mmu::new(0);

        mem.alloc_specific_page(0).unwrap();
        mem.page_mut(0).unwrap().flags = PageFlags::rw();
        mem.write_u32(0, encode(Instruction::Nop)).unwrap();

        assert!(matches!(
            mmu.fetch_instruction(&mem, 0, true),
            Err(Fault::AccessViolation {
                kind: AccessKind::Execute,
                ..
            })
        ));
    }

    #[test]
    fn test_page_boundary_translation() {
        let mut mem = memory();
        let mut mmu = Mmu::new(0);
        let pt = 0x2_0000;

        map(&mut mem, pt, 0x1000, 0x40, PageFlags::rw());
        map(&mut mem, pt, 0x1100, 0x50, PageFlags::rw());
        mmu.set_pt_base(pt);
        mmu.set_pt_enabled(true);

        let last = mmu
            .translate(&mem, 0x10FF, AccessKind::Read, false)
            .unwrap();
        let first = mmu
            .translate(&mem, 0x1100, AccessKind::Read, false)
            .unwrap();
        assert_eq!(last, 0x40FF);
        assert_eq!(first, 0x5000);
    }
}
