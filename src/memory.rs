//! Module responsible for guest memory management. It allocates the guest physical memory and
//! builds the descriptor tables and the page tables of the freestanding guest.
//!
//! # Guest Layout
//!
//! Kernel structures are identity-mapped (guest virtual == guest physical) by a single supervisor
//! 2 MiB page. The sandbox page is the only user-accessible mapping and the page that follows it
//! is never present, so that an instruction crossing the end of the sandbox page faults on the
//! fetch.
//!
//! ```text
//! 0x0000_1000  GDT
//! 0x0000_2000  IDT
//! 0x0000_3000  TSS
//! 0x0000_4000  exception stubs (32 x 16 bytes)
//! 0x0000_4400  iretq trampoline
//! 0x0000_5000  kernel stack (grows down from 0x8000)
//! 0x0000_9000  PML4, PDPT and PD of the identity mapping
//! 0x0000_c000  PD and PT of the sandbox mapping
//! 0x0001_0000  sandbox backing page
//!
//! 0x1_0000_0000  sandbox page (user, RWX)
//! 0x1_0000_1000  not present
//! ```

use bitfield::bitfield;
use kvm_bindings::kvm_segment;
use rhexdump as rh;

use std::alloc;
use std::fmt::Write;

use crate::error::*;

// -----------------------------------------------------------------------------------------------
// Memory - Layout
// -----------------------------------------------------------------------------------------------

/// Page size of the guest.
pub const PAGE_SIZE: usize = 0x1000;
/// Size of the guest physical memory.
pub const GUEST_MEMORY_SIZE: usize = 0x20_0000;

/// Address of the Global Descriptor Table.
pub const GDT_ADDR: u64 = 0x1000;
/// Address of the Interrupt Descriptor Table.
pub const IDT_ADDR: u64 = 0x2000;
/// Address of the Task State Segment.
pub const TSS_ADDR: u64 = 0x3000;
/// Address of the exception stub table.
pub const STUBS_ADDR: u64 = 0x4000;
/// Size of one exception stub slot.
pub const STUB_SIZE: usize = 0x10;
/// Address of the `iretq` trampoline used to drop to ring 3.
pub const IRETQ_ADDR: u64 = 0x4400;
/// Lowest address of the kernel stack.
pub const KERNEL_STACK_BOTTOM: u64 = 0x5000;
/// Initial kernel stack pointer, also used as `RSP0` in the TSS.
pub const KERNEL_STACK_TOP: u64 = 0x8000;
/// Address of the PML4.
pub const PML4_ADDR: u64 = 0x9000;
/// Address of the PDPT.
pub const PDPT_ADDR: u64 = 0xa000;
/// Address of the page directory of the identity mapping.
pub const PD_ADDR: u64 = 0xb000;
/// Address of the page directory of the sandbox mapping.
pub const SANDBOX_PD_ADDR: u64 = 0xc000;
/// Address of the page table of the sandbox mapping.
pub const SANDBOX_PT_ADDR: u64 = 0xd000;
/// Guest physical address backing the sandbox page.
pub const SANDBOX_PHYS_ADDR: u64 = 0x10000;
/// Guest virtual address of the sandbox page.
pub const SANDBOX_VIRT_ADDR: u64 = 0x1_0000_0000;

/// Number of entries in the GDT.
pub const GDT_NB_ENTRIES: usize = 7;
/// Size of the 64-bit TSS.
pub const TSS_SIZE: usize = 0x68;

/// Ring 0 code segment selector.
pub const KERNEL_CS: u16 = 0x08;
/// Ring 0 data segment selector.
pub const KERNEL_DS: u16 = 0x10;
/// Ring 3 code segment selector (RPL 3).
pub const USER_CS: u16 = 0x18 | 3;
/// Ring 3 data segment selector (RPL 3).
pub const USER_DS: u16 = 0x20 | 3;
/// TSS selector.
pub const TSS_SELECTOR: u16 = 0x28;

/// Flags of a 64-bit ring 0 code segment (G, L, P, S, execute/read, accessed).
pub const GDT_FLAGS_KERNEL_CODE: u16 = 0xa09b;
/// Flags of a ring 0 data segment (G, D/B, P, S, read/write, accessed).
pub const GDT_FLAGS_KERNEL_DATA: u16 = 0xc093;
/// Flags of a 64-bit ring 3 code segment.
pub const GDT_FLAGS_USER_CODE: u16 = 0xa0fb;
/// Flags of a ring 3 data segment.
pub const GDT_FLAGS_USER_DATA: u16 = 0xc0f3;
/// Flags of a busy 64-bit TSS.
pub const GDT_FLAGS_TSS: u16 = 0x008b;

// The sandbox must not overlap any kernel structure and must fit in guest memory.
const _: () = assert!(SANDBOX_PHYS_ADDR >= SANDBOX_PT_ADDR + PAGE_SIZE as u64);
const _: () = assert!(SANDBOX_PHYS_ADDR + (PAGE_SIZE as u64) <= GUEST_MEMORY_SIZE as u64);
const _: () = assert!(STUBS_ADDR + 32 * STUB_SIZE as u64 <= IRETQ_ADDR);
const _: () = assert!(GUEST_MEMORY_SIZE == 0x20_0000);

// -----------------------------------------------------------------------------------------------
// Memory - Guest Physical Memory
// -----------------------------------------------------------------------------------------------

/// Guest physical memory, backed by a zeroed page-aligned host allocation.
///
/// Guest physical addresses are offsets into the allocation. All accesses are bounds checked.
#[derive(Debug)]
pub struct GuestMemory {
    /// Host address of the allocation.
    host_addr: *mut u8,
    /// Layout of the allocation, needed to free it.
    layout: alloc::Layout,
}

impl GuestMemory {
    /// Allocates `size` bytes of zeroed guest memory. `size` must be a non-zero multiple of
    /// [`PAGE_SIZE`].
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(MemoryError::InvalidSize(size))?;
        }
        let layout = alloc::Layout::from_size_align(size, PAGE_SIZE)?;
        // SAFETY: the layout has a non-zero size.
        let host_addr = unsafe { alloc::alloc_zeroed(layout) };
        if host_addr.is_null() {
            return Err(MemoryError::OutOfMemory)?;
        }
        Ok(Self { host_addr, layout })
    }

    /// Returns the host address of the allocation.
    #[inline]
    pub fn host_addr(&self) -> u64 {
        self.host_addr as u64
    }

    /// Returns the size of guest memory.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Checks that `[addr; addr + size[` is inside guest memory and returns the offset.
    fn check_range(&self, addr: u64, size: usize) -> Result<usize> {
        let end = addr
            .checked_add(size as u64)
            .ok_or(MemoryError::Overflow(addr, size))?;
        if end > self.size() as u64 {
            return Err(MemoryError::OutOfBounds(addr, size))?;
        }
        Ok(addr as usize)
    }

    /// Reads `data.len()` bytes at guest physical address `addr`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        let offset = self.check_range(addr, data.len())?;
        data.copy_from_slice(&self.as_slice()[offset..offset + data.len()]);
        Ok(())
    }

    /// Writes `data` at guest physical address `addr`.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let offset = self.check_range(addr, data.len())?;
        self.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reads a little-endian quad word at guest physical address `addr`.
    pub fn read_qword(&self, addr: u64) -> Result<u64> {
        let mut data = [0; 8];
        self.read(addr, &mut data)?;
        Ok(u64::from_le_bytes(data))
    }

    /// Writes a little-endian quad word at guest physical address `addr`.
    pub fn write_qword(&mut self, addr: u64, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Returns guest memory as a slice.
    fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is valid for `layout.size()` bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.host_addr, self.layout.size()) }
    }

    /// Returns guest memory as a mutable slice.
    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: same as `as_slice`, and `&mut self` guarantees exclusive access from the host.
        unsafe { std::slice::from_raw_parts_mut(self.host_addr, self.layout.size()) }
    }

    /// Returns a hexdump of `size` bytes at guest physical address `addr`, labeled with the
    /// address `display_addr`.
    ///
    /// Line offsets are 32-bit. When `display_addr` doesn't fit, lines are labeled relative to
    /// the start of the dump and the header says so.
    pub fn hexdump(&self, addr: u64, size: usize, display_addr: u64) -> Result<String> {
        let offset = self.check_range(addr, size)?;
        let (base, relative) = match u32::try_from(display_addr) {
            Ok(base) => (base, ""),
            Err(_) => (0, ", offsets relative"),
        };
        let mut out = String::new();
        writeln!(out, "Memory @{:#x} ({:#x} bytes{})", display_addr, size, relative)?;
        let mut rhx = rh::Rhexdump::default();
        rhx.display_duplicate_lines(false);
        write!(
            out,
            "{}",
            rhx.hexdump_offset(&self.as_slice()[offset..offset + size], base)
        )?;
        Ok(out)
    }

    /// Writes the GDT, the TSS and the page tables of the guest kernel.
    pub fn init_kernel_structures(&mut self) -> Result<()> {
        self.init_gdt()?;
        self.init_tss()?;
        self.init_page_tables()
    }

    /// Writes the Global Descriptor Table.
    fn init_gdt(&mut self) -> Result<()> {
        let [tss_low, tss_high] = tss_descriptor(TSS_ADDR, TSS_SIZE as u32 - 1);
        let gdt: [u64; GDT_NB_ENTRIES] = [
            0,
            SegmentDescriptor::new(GDT_FLAGS_KERNEL_CODE, 0, 0xfffff).0,
            SegmentDescriptor::new(GDT_FLAGS_KERNEL_DATA, 0, 0xfffff).0,
            SegmentDescriptor::new(GDT_FLAGS_USER_CODE, 0, 0xfffff).0,
            SegmentDescriptor::new(GDT_FLAGS_USER_DATA, 0, 0xfffff).0,
            tss_low.0,
            tss_high.0,
        ];
        for (i, entry) in gdt.iter().enumerate() {
            self.write_qword(GDT_ADDR + 8 * i as u64, *entry)?;
        }
        Ok(())
    }

    /// Writes the Task State Segment. Only `RSP0` matters: it's the stack used when a trap is
    /// taken from ring 3.
    fn init_tss(&mut self) -> Result<()> {
        let mut tss = [0u8; TSS_SIZE];
        tss[4..12].copy_from_slice(&KERNEL_STACK_TOP.to_le_bytes());
        // No I/O permission bitmap.
        tss[0x66..0x68].copy_from_slice(&(TSS_SIZE as u16).to_le_bytes());
        self.write(TSS_ADDR, &tss)
    }

    /// Writes the 4-level page tables.
    fn init_page_tables(&mut self) -> Result<()> {
        // Identity mapping of guest memory, supervisor only.
        self.write_qword(PML4_ADDR, PageTableEntry::table(PDPT_ADDR, true).0)?;
        self.write_qword(PDPT_ADDR, PageTableEntry::table(PD_ADDR, false).0)?;
        self.write_qword(PD_ADDR, PageTableEntry::huge_page(0).0)?;
        // Sandbox mapping. The page after the sandbox page stays not present.
        let pdpt_index = (SANDBOX_VIRT_ADDR >> 30) & 0x1ff;
        let pd_index = (SANDBOX_VIRT_ADDR >> 21) & 0x1ff;
        let pt_index = (SANDBOX_VIRT_ADDR >> 12) & 0x1ff;
        self.write_qword(
            PDPT_ADDR + 8 * pdpt_index,
            PageTableEntry::table(SANDBOX_PD_ADDR, true).0,
        )?;
        self.write_qword(
            SANDBOX_PD_ADDR + 8 * pd_index,
            PageTableEntry::table(SANDBOX_PT_ADDR, true).0,
        )?;
        self.write_qword(
            SANDBOX_PT_ADDR + 8 * pt_index,
            PageTableEntry::user_page(SANDBOX_PHYS_ADDR).0,
        )
    }
}

impl std::ops::Drop for GuestMemory {
    fn drop(&mut self) {
        // SAFETY: `host_addr` was allocated with `layout` and is freed only once.
        unsafe { alloc::dealloc(self.host_addr, self.layout) };
    }
}

// -----------------------------------------------------------------------------------------------
// Memory - Page Tables
// -----------------------------------------------------------------------------------------------

bitfield! {
    /// Entry of any level of a 4-level page table.
    ///
    /// - **P:** present
    /// - **RW:** writable
    /// - **US:** accessible from ring 3
    /// - **PS:** maps a large page instead of pointing to the next level
    /// - **XD:** execute disable (only honored when `EFER.NXE` is set)
    #[derive(Copy, Clone, Eq, Hash, PartialEq)]
    pub struct PageTableEntry(u64);
    impl Debug;
    get_present, set_present: 0;
    get_writable, set_writable: 1;
    get_user, set_user: 2;
    get_pwt, set_pwt: 3;
    get_pcd, set_pcd: 4;
    get_accessed, set_accessed: 5;
    get_dirty, set_dirty: 6;
    get_ps, set_ps: 7;
    get_global, set_global: 8;
    get_addr, set_addr: 51, 12;
    get_xd, set_xd: 63;
}

impl PageTableEntry {
    /// Creates an entry pointing to the next-level table at `addr`.
    pub fn table(addr: u64, user: bool) -> Self {
        let mut entry = PageTableEntry(0);
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_user(user);
        entry.set_addr(addr >> 12);
        entry
    }

    /// Creates a supervisor 2 MiB page entry mapping `addr`.
    pub fn huge_page(addr: u64) -> Self {
        let mut entry = PageTableEntry(0);
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_ps(true);
        entry.set_addr(addr >> 12);
        entry
    }

    /// Creates a user-accessible, writable and executable 4 KiB page entry mapping `addr`.
    pub fn user_page(addr: u64) -> Self {
        let mut entry = PageTableEntry::table(addr, true);
        entry.set_xd(false);
        entry
    }
}

// -----------------------------------------------------------------------------------------------
// Memory - Segment Descriptors
// -----------------------------------------------------------------------------------------------

bitfield! {
    /// Code, data or system segment descriptor, as stored in the GDT.
    ///
    /// The `flags` word used by [`SegmentDescriptor::new`] packs the access byte in bits `[7:0]`
    /// and the G, D/B, L and AVL flags in bits `[15:12]`.
    #[derive(Copy, Clone, Eq, Hash, PartialEq)]
    pub struct SegmentDescriptor(u64);
    impl Debug;
    get_limit_low, set_limit_low: 15, 0;
    get_base_low, set_base_low: 39, 16;
    get_type, set_type: 43, 40;
    get_s, set_s: 44;
    get_dpl, set_dpl: 46, 45;
    get_present, set_present: 47;
    get_limit_high, set_limit_high: 51, 48;
    get_avl, set_avl: 52;
    get_l, set_l: 53;
    get_db, set_db: 54;
    get_g, set_g: 55;
    get_base_high, set_base_high: 63, 56;
}

impl SegmentDescriptor {
    /// Creates a descriptor from its flags, base and limit.
    pub fn new(flags: u16, base: u32, limit: u32) -> Self {
        let (flags, base, limit) = (flags as u64, base as u64, limit as u64);
        let mut descriptor = SegmentDescriptor(0);
        descriptor.set_limit_low(limit & 0xffff);
        descriptor.set_limit_high((limit >> 16) & 0xf);
        descriptor.set_base_low(base & 0xff_ffff);
        descriptor.set_base_high((base >> 24) & 0xff);
        descriptor.set_type(flags & 0xf);
        descriptor.set_s((flags >> 4) & 1 == 1);
        descriptor.set_dpl((flags >> 5) & 3);
        descriptor.set_present((flags >> 7) & 1 == 1);
        descriptor.set_avl((flags >> 12) & 1 == 1);
        descriptor.set_l((flags >> 13) & 1 == 1);
        descriptor.set_db((flags >> 14) & 1 == 1);
        descriptor.set_g((flags >> 15) & 1 == 1);
        descriptor
    }

    /// Returns the segment base.
    pub fn base(&self) -> u64 {
        (self.get_base_high() << 24) | self.get_base_low()
    }

    /// Returns the segment limit, scaled by the granularity flag.
    pub fn limit(&self) -> u32 {
        let raw = ((self.get_limit_high() << 16) | self.get_limit_low()) as u32;
        match self.get_g() {
            true => (raw << 12) | 0xfff,
            false => raw,
        }
    }

    /// Converts the descriptor into the segment register state expected by KVM when it's loaded
    /// with `selector`.
    pub fn to_kvm_segment(&self, selector: u16) -> kvm_segment {
        kvm_segment {
            base: self.base(),
            limit: self.limit(),
            selector,
            type_: self.get_type() as u8,
            present: self.get_present() as u8,
            dpl: self.get_dpl() as u8,
            db: self.get_db() as u8,
            s: self.get_s() as u8,
            l: self.get_l() as u8,
            g: self.get_g() as u8,
            avl: self.get_avl() as u8,
            unusable: !self.get_present() as u8,
            padding: 0,
        }
    }
}

/// Creates the two GDT entries of a 64-bit TSS descriptor.
pub fn tss_descriptor(base: u64, limit: u32) -> [SegmentDescriptor; 2] {
    [
        SegmentDescriptor::new(GDT_FLAGS_TSS, base as u32, limit),
        SegmentDescriptor(base >> 32),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_bounds() {
        let mut mem = GuestMemory::new(0x2000).unwrap();
        assert_eq!(mem.size(), 0x2000);
        assert_eq!(mem.host_addr() % PAGE_SIZE as u64, 0);
        mem.write(0x1ffc, &[1, 2, 3, 4]).unwrap();
        let mut data = [0; 4];
        mem.read(0x1ffc, &mut data).unwrap();
        assert_eq!(data, [1, 2, 3, 4]);
        assert_eq!(
            mem.write(0x1ffd, &[1, 2, 3, 4]),
            Err(Error::Memory(MemoryError::OutOfBounds(0x1ffd, 4)))
        );
        assert_eq!(
            mem.read_qword(u64::MAX),
            Err(Error::Memory(MemoryError::Overflow(u64::MAX, 8)))
        );
        assert!(GuestMemory::new(0x1234).is_err());
        assert!(GuestMemory::new(0).is_err());
    }

    #[test]
    fn memory_qwords() {
        let mut mem = GuestMemory::new(PAGE_SIZE).unwrap();
        assert_eq!(mem.read_qword(0x10).unwrap(), 0);
        mem.write_qword(0x10, 0xdead_beef_cafe_babe).unwrap();
        assert_eq!(mem.read_qword(0x10).unwrap(), 0xdead_beef_cafe_babe);
        let mut data = [0; 2];
        mem.read(0x10, &mut data).unwrap();
        assert_eq!(data, [0xbe, 0xba]);
    }

    #[test]
    fn memory_segment_descriptors() {
        // Reference encodings of flat 64-bit segments.
        assert_eq!(
            SegmentDescriptor::new(GDT_FLAGS_KERNEL_CODE, 0, 0xfffff).0,
            0x00af_9b00_0000_ffff
        );
        assert_eq!(
            SegmentDescriptor::new(GDT_FLAGS_KERNEL_DATA, 0, 0xfffff).0,
            0x00cf_9300_0000_ffff
        );
        assert_eq!(
            SegmentDescriptor::new(GDT_FLAGS_USER_CODE, 0, 0xfffff).0,
            0x00af_fb00_0000_ffff
        );
        let ucode = SegmentDescriptor::new(GDT_FLAGS_USER_CODE, 0, 0xfffff).to_kvm_segment(USER_CS);
        assert_eq!(ucode.dpl, 3);
        assert_eq!(ucode.l, 1);
        assert_eq!(ucode.db, 0);
        assert_eq!(ucode.limit, 0xffff_ffff);
        assert_eq!(ucode.type_, 0xb);
        assert_eq!(ucode.unusable, 0);

        let [low, high] = tss_descriptor(0x1234_5678_9abc, 0x67);
        assert_eq!(low.base(), 0x5678_9abc);
        assert_eq!(high.0, 0x1234);
        let tr = low.to_kvm_segment(TSS_SELECTOR);
        assert_eq!(tr.type_, 0xb);
        assert_eq!(tr.s, 0);
        assert_eq!(tr.limit, 0x67);
    }

    #[test]
    fn memory_page_table_entries() {
        let table = PageTableEntry::table(SANDBOX_PT_ADDR, true);
        assert_eq!(table.0, SANDBOX_PT_ADDR | 0b111);
        let huge = PageTableEntry::huge_page(0);
        assert_eq!(huge.0, 0b1000_0011);
        assert!(!huge.get_user());
        assert!(!PageTableEntry::user_page(SANDBOX_PHYS_ADDR).get_xd());
    }

    #[test]
    fn memory_kernel_structures() {
        let mut mem = GuestMemory::new(GUEST_MEMORY_SIZE).unwrap();
        mem.init_kernel_structures().unwrap();
        // Sandbox page mapped, next page not present.
        let pt_index = (SANDBOX_VIRT_ADDR >> 12) & 0x1ff;
        let pte = PageTableEntry(mem.read_qword(SANDBOX_PT_ADDR + 8 * pt_index).unwrap());
        assert!(pte.get_present() && pte.get_user());
        assert_eq!(pte.get_addr() << 12, SANDBOX_PHYS_ADDR);
        let next = PageTableEntry(mem.read_qword(SANDBOX_PT_ADDR + 8 * (pt_index + 1)).unwrap());
        assert!(!next.get_present());
        // RSP0 in the TSS.
        assert_eq!(mem.read_qword(TSS_ADDR + 4).unwrap(), KERNEL_STACK_TOP);
        // User code segment.
        let ucode = SegmentDescriptor(mem.read_qword(GDT_ADDR + (USER_CS & !7) as u64).unwrap());
        assert_eq!(ucode.get_dpl(), 3);
    }

    #[test]
    fn memory_hexdump() {
        let mut mem = GuestMemory::new(PAGE_SIZE).unwrap();
        mem.write(0xff0, &[0x0f, 0x0b]).unwrap();
        let dump = mem.hexdump(0xff0, 0x10, 0xff0).unwrap();
        assert!(dump.starts_with("Memory @0xff0 (0x10 bytes)\n00000ff0: 0f 0b "));
        assert!(mem.hexdump(0xff0, 0x20, 0).is_err());
    }

    #[test]
    fn memory_hexdump_high_address() {
        let mut mem = GuestMemory::new(PAGE_SIZE).unwrap();
        mem.write(0xff0, &[0x0f, 0x0b]).unwrap();
        let dump = mem
            .hexdump(0xff0, 0x10, SANDBOX_VIRT_ADDR + 0xff0)
            .unwrap();
        assert!(dump.starts_with(
            "Memory @0x100000ff0 (0x10 bytes, offsets relative)\n00000000: 0f 0b "
        ));
    }
}
