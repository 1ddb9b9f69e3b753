//! The extended page table engine.
//!
//! Owns a 4-level paging hierarchy, parallel to the host's, that defines how
//! guest-physical addresses resolve to host-physical addresses. The
//! hierarchy is built once per session, populated either address-by-address
//! (identity mapping the index points of specific kernel allocations) or in
//! bulk (2MB large pages covering all of physical memory), queried and
//! mutated while the guest runs, and torn down on unwind.
//!
//! Two population details matter for correctness elsewhere:
//!
//! - Individual 4KB translations can be rewritten at runtime, which is how
//!   function hooking and page splitting are implemented; any such mutation
//!   must be followed by a translation-cache invalidation.
//! - The VM-exit handler runs at an execution priority where the general
//!   kernel allocator is off limits, so the leaf tables needed to split a
//!   2MB mapping from inside the handler come from a pool reserved at build
//!   time.

use alloc::vec::Vec;

use crate::{
    addressing::{Pa, PageIndices, Va, HUGE_PAGE_SIZE, LARGE_PAGE_SIZE, PAGE_SIZE, TABLE_ENTRY_COUNT},
    indexer::{self, IndexerError},
    mtrr::{MemTypeOracle, MemoryType},
    platform::{AllocError, KernelMemory, VmxAllocation},
    vm_control::{EptVpidCap, IA32_VMX_EPT_VPID_CAP},
    vmcs::InstructionError,
    vmx::{InveptScope, VmxFacility},
};

/// Leaf tables reserved at build time for splits performed inside the
/// VM-exit handler.
pub const LEAF_TABLE_CACHE: usize = 20;

bitflags::bitflags! {
    /// Access permissions of an EPT paging entry.
    pub struct EptPermission: u64 {
        /// Reads allowed from the region controlled by the entry.
        const READ = 1 << 0;
        /// Writes allowed to the region controlled by the entry.
        const WRITE = 1 << 1;
        /// Instruction fetches allowed from the region controlled by the entry.
        const EXECUTE = 1 << 2;
        /// Unrestricted access; permission checks stay with the guest OS.
        const FULL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// Errors reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptError {
    /// A base address violated the alignment its level requires.
    Unaligned,
    /// A walked entry was absent.
    NotPresent,
    /// The operation needs a present 2MB large-page entry.
    NotLargePage,
    /// The hierarchy contains a mapping shape this engine does not handle
    /// (a 1GB large page, or a collision between population policies).
    UnsupportedMapping,
    /// Bulk population was requested on an already populated hierarchy.
    AlreadyPopulated,
    /// The hierarchy has been torn down.
    TornDown,
    /// The cached leaf-table pool is exhausted and the calling context
    /// forbids the general allocator.
    CachedTableExhausted,
    /// The hardware does not support the requested invalidation scope.
    UnsupportedInvalidation(InveptScope),
    /// A table's physical base has no kernel virtual mapping.
    NoReverseMapping(Pa),
    /// The kernel allocator failed.
    Allocation(AllocError),
    /// The physical memory indexer failed.
    Indexer(IndexerError),
    /// INVEPT was refused.
    Instruction(InstructionError),
}

impl From<AllocError> for EptError {
    fn from(e: AllocError) -> Self {
        EptError::Allocation(e)
    }
}

impl From<IndexerError> for EptError {
    fn from(e: IndexerError) -> Self {
        EptError::Indexer(e)
    }
}

/// Which allocation tier a conversion may draw from.
///
/// The VM-exit handler executes at the platform's highest interrupt
/// priority, where calling the general kernel allocator is a contract
/// violation; work done there must come from the build-time pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationContext {
    /// Ordinary execution; fresh allocations are fine.
    Unconstrained,
    /// Inside the VM-exit handler; only the cached pool may be used.
    InterruptContext,
}

/// A generic EPT paging entry: one 64-bit word, interpreted per level.
///
/// The same word is a table reference, a 2MB large-page mapping, or a 4KB
/// leaf mapping; the caller selects the interpretation explicitly through
/// the encode/decode methods, guided by the hierarchy level and the
/// large-region bit. Reserved bits are kept zero throughout.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct EptEntry(u64);

impl EptEntry {
    const PERM_MASK: u64 = 0b111;
    const MEM_TYPE_SHIFT: u32 = 3;
    const MEM_TYPE_MASK: u64 = 0b111 << Self::MEM_TYPE_SHIFT;
    const LARGE_BIT: u64 = 1 << 7;
    const BASE_MASK: u64 = 0x000f_ffff_ffff_f000;
    const LARGE_BASE_MASK: u64 = 0x000f_ffff_ffe0_0000;

    /// The zero (absent) entry.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Reconstruct from a raw word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw word.
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// An entry with any of read/write/execute granted is present.
    #[inline]
    pub fn present(&self) -> bool {
        self.0 & Self::PERM_MASK != 0
    }

    /// The entry maps a large region directly instead of referencing the
    /// next table.
    #[inline]
    pub fn large_region(&self) -> bool {
        self.0 & Self::LARGE_BIT != 0
    }

    /// Access permissions.
    #[inline]
    pub fn permissions(&self) -> EptPermission {
        EptPermission::from_bits_truncate(self.0)
    }

    /// Replace the access permissions, leaving everything else intact.
    #[inline]
    pub fn set_permissions(&mut self, perm: EptPermission) {
        self.0 = (self.0 & !Self::PERM_MASK) | perm.bits();
    }

    /// Memory type of a data-mapping entry.
    #[inline]
    pub fn mem_type(&self) -> Option<MemoryType> {
        MemoryType::from_bits((self.0 & Self::MEM_TYPE_MASK) >> Self::MEM_TYPE_SHIFT)
    }

    /// Base of the next-level table, for a present table-reference entry.
    #[inline]
    pub fn table_base(&self) -> Option<Pa> {
        if self.present() {
            Pa::new((self.0 & Self::BASE_MASK) as usize)
        } else {
            None
        }
    }

    /// Base of the mapped 4KB page, for a present leaf entry.
    #[inline]
    pub fn page_base(&self) -> Option<Pa> {
        if self.present() {
            Pa::new((self.0 & Self::BASE_MASK) as usize)
        } else {
            None
        }
    }

    /// Base of the mapped 2MB region, for a present large-page entry.
    #[inline]
    pub fn large_base(&self) -> Option<Pa> {
        if self.present() && self.large_region() {
            Pa::new((self.0 & Self::LARGE_BASE_MASK) as usize)
        } else {
            None
        }
    }

    /// Encode a reference to a next-level table.
    pub fn set_table(&mut self, base: Pa) -> Result<(), EptError> {
        let base = unsafe { base.into_usize() } as u64;
        if base & !Self::BASE_MASK != 0 {
            return Err(EptError::Unaligned);
        }
        self.0 = base | EptPermission::FULL.bits();
        Ok(())
    }

    /// Encode a 4KB leaf mapping.
    pub fn set_page(
        &mut self,
        base: Pa,
        ty: MemoryType,
        perm: EptPermission,
    ) -> Result<(), EptError> {
        let base = unsafe { base.into_usize() } as u64;
        if base & !Self::BASE_MASK != 0 {
            return Err(EptError::Unaligned);
        }
        self.0 = base | (ty.bits() << Self::MEM_TYPE_SHIFT) | perm.bits();
        Ok(())
    }

    /// Encode a 2MB large-page mapping.
    pub fn set_large_page(
        &mut self,
        base: Pa,
        ty: MemoryType,
        perm: EptPermission,
    ) -> Result<(), EptError> {
        let base = unsafe { base.into_usize() } as u64;
        if base & !Self::LARGE_BASE_MASK != 0 {
            return Err(EptError::Unaligned);
        }
        self.0 = base | Self::LARGE_BIT | (ty.bits() << Self::MEM_TYPE_SHIFT) | perm.bits();
        Ok(())
    }

    /// Replace the mapped page base of a leaf entry, keeping permissions
    /// and memory type.
    pub fn set_page_base(&mut self, base: Pa) -> Result<(), EptError> {
        let base = unsafe { base.into_usize() } as u64;
        if base & !Self::BASE_MASK != 0 {
            return Err(EptError::Unaligned);
        }
        self.0 = (self.0 & !Self::BASE_MASK) | base;
        Ok(())
    }
}

impl core::fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EptEntry(0x{:x})", self.0)
    }
}

/// A handle on one live 64-bit entry within the hierarchy.
///
/// The handle stays valid for the lifetime of the table that holds the
/// entry, which the engine guarantees until teardown; the split
/// registration in the exit dispatcher relies on that to mutate the same
/// leaf entry across many exits.
#[derive(Debug, Clone, Copy)]
pub struct EntryRef(Va);

impl EntryRef {
    fn new(va: Va) -> Self {
        Self(va)
    }

    /// Kernel virtual address of the entry.
    #[inline]
    pub fn address(&self) -> Va {
        self.0
    }

    /// Read the entry.
    #[inline]
    pub fn read(&self) -> EptEntry {
        // SAFETY: the address was derived from a live table page.
        EptEntry(unsafe { (self.0.into_usize() as *const u64).read_volatile() })
    }

    /// Overwrite the entry.
    #[inline]
    pub fn write(&self, entry: EptEntry) {
        // SAFETY: as above; entries are 8-byte aligned within their page.
        unsafe { (self.0.into_usize() as *mut u64).write_volatile(entry.0) }
    }
}

/// The translation root: memory-type tag, walk length, accessed/dirty
/// control, and the physical base of the top-level table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eptp(u64);

impl Eptp {
    const WALK_LENGTH_4: u64 = 3 << 3;

    /// Build the root value for a top-level table: write-back paging
    /// structures, a full 4-level walk, accessed/dirty tracking disabled.
    pub fn new(top: Pa) -> Self {
        Self(unsafe { top.into_usize() } as u64 | Self::WALK_LENGTH_4 | MemoryType::WriteBack.bits())
    }

    /// The value written to the control structure.
    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Physical base of the top-level table.
    #[inline]
    pub fn table_base(&self) -> Pa {
        Pa::new((self.0 & 0x000f_ffff_ffff_f000) as usize).unwrap_or(Pa::ZERO)
    }
}

/// The cached leaf-table pool; a slot holding `None` is in use.
#[derive(Debug)]
struct LeafTablePool {
    slots: Vec<Option<VmxAllocation>>,
}

impl LeafTablePool {
    fn reserve<M: KernelMemory>(mem: &mut M, count: usize) -> Result<Self, AllocError> {
        let mut slots: Vec<Option<VmxAllocation>> = Vec::with_capacity(count);
        for _ in 0..count {
            match mem.allocate(PAGE_SIZE, true, true) {
                Ok(table) => slots.push(Some(table)),
                Err(e) => {
                    for slot in slots.drain(..) {
                        if let Some(table) = slot {
                            mem.free(table);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self { slots })
    }

    fn take(&mut self) -> Option<VmxAllocation> {
        self.slots.iter_mut().find_map(|slot| slot.take())
    }

    fn available(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn release_unused<M: KernelMemory>(&mut self, mem: &mut M) {
        for slot in self.slots.iter_mut() {
            if let Some(table) = slot.take() {
                mem.free(table);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EptState {
    Built,
    Populated,
    TornDown,
}

/// The engine: one translation hierarchy and its owned table allocations.
#[derive(Debug)]
pub struct ExtendedPageTable {
    eptp: Eptp,
    // Every table page the engine owns, the top table first. Teardown frees
    // through this ledger so each page is released exactly once.
    tables: Vec<VmxAllocation>,
    pool: LeafTablePool,
    state: EptState,
}

impl ExtendedPageTable {
    /// Allocate the top-level table and the leaf-table pool, and derive the
    /// translation root.
    pub fn build<M: KernelMemory>(mem: &mut M) -> Result<Self, EptError> {
        let top = mem.allocate(PAGE_SIZE, true, true)?;
        let eptp = Eptp::new(top.pa);
        let pool = match LeafTablePool::reserve(mem, LEAF_TABLE_CACHE) {
            Ok(pool) => pool,
            Err(e) => {
                mem.free(top);
                return Err(EptError::Allocation(e));
            }
        };
        let mut tables = Vec::new();
        tables.push(top);
        Ok(Self {
            eptp,
            tables,
            pool,
            state: EptState::Built,
        })
    }

    /// The translation root for the control structure.
    #[inline]
    pub fn eptp(&self) -> Eptp {
        self.eptp
    }

    /// Leaf tables still available in the cached pool.
    #[inline]
    pub fn cached_tables_available(&self) -> usize {
        self.pool.available()
    }

    fn entry_ref<M: KernelMemory>(
        &self,
        mem: &M,
        table: Pa,
        slot: usize,
    ) -> Result<EntryRef, EptError> {
        let va = mem
            .pa_to_va(table)
            .ok_or(EptError::NoReverseMapping(table))?;
        Ok(EntryRef::new(va + slot * core::mem::size_of::<u64>()))
    }

    /// Identity map one virtual address: every physical address involved in
    /// translating it (the four host table pages plus the data page) becomes
    /// reachable through the hierarchy at 4KB granularity with full access
    /// and write-back type.
    ///
    /// Designed for one-off mappings of specific kernel allocations, e.g.
    /// code pages about to be hooked.
    pub fn insert_identity<M: KernelMemory>(
        &mut self,
        mem: &mut M,
        host_root: Pa,
        va: Va,
    ) -> Result<(), EptError> {
        if self.state == EptState::TornDown {
            return Err(EptError::TornDown);
        }
        let points = indexer::index_points(mem, host_root, va)?;
        for base in points.bases() {
            self.insert_mapping(mem, base)?;
        }
        self.state = EptState::Populated;
        Ok(())
    }

    fn insert_mapping<M: KernelMemory>(&mut self, mem: &mut M, target: Pa) -> Result<(), EptError> {
        let idx = PageIndices::of(unsafe { target.into_usize() });
        let slots = [idx.pml4, idx.pdpt, idx.pd, idx.pt];
        let mut table = self.eptp.table_base();
        // Top-to-bottom descent over the fixed 4-level depth.
        for (level, slot) in slots.iter().enumerate() {
            let altitude = 4 - level;
            let entry_ref = self.entry_ref(mem, table, *slot)?;
            let mut entry = entry_ref.read();
            if altitude == 1 {
                if !entry.present() {
                    entry.set_page(target.page_base(), MemoryType::WriteBack, EptPermission::FULL)?;
                    entry_ref.write(entry);
                }
                // A page that already has a leaf entry needs nothing more.
                return Ok(());
            }
            if !entry.present() {
                let next = mem.allocate(PAGE_SIZE, true, true)?;
                entry.set_table(next.pa)?;
                entry_ref.write(entry);
                self.tables.push(next);
            } else if entry.large_region() {
                return Err(EptError::UnsupportedMapping);
            }
            table = entry.table_base().ok_or(EptError::NotPresent)?;
        }
        Ok(())
    }

    /// Identity map all of physical memory up to `extent` bytes using 2MB
    /// large pages, one middle table per 1GB unit, each region's memory
    /// type taken from the oracle.
    ///
    /// The bulk alternative to per-address insertion: coverage instead of
    /// granularity.
    pub fn map_system<M: KernelMemory, O: MemTypeOracle>(
        &mut self,
        mem: &mut M,
        oracle: &O,
        extent: usize,
    ) -> Result<(), EptError> {
        match self.state {
            EptState::Built => {}
            EptState::Populated => return Err(EptError::AlreadyPopulated),
            EptState::TornDown => return Err(EptError::TornDown),
        }
        let units = (extent + HUGE_PAGE_SIZE - 1) / HUGE_PAGE_SIZE;
        if units == 0 || units > TABLE_ENTRY_COUNT {
            return Err(EptError::UnsupportedMapping);
        }

        let pdpt = mem.allocate(PAGE_SIZE, true, true)?;
        let pdpt_pa = pdpt.pa;
        self.tables.push(pdpt);
        let top_ref = self.entry_ref(mem, self.eptp.table_base(), 0)?;
        let mut top_entry = EptEntry::zero();
        top_entry.set_table(pdpt_pa)?;
        top_ref.write(top_entry);

        for unit in 0..units {
            let pd = mem.allocate(PAGE_SIZE, true, true)?;
            let pd_pa = pd.pa;
            self.tables.push(pd);

            let pdpte_ref = self.entry_ref(mem, pdpt_pa, unit)?;
            let mut pdpte = EptEntry::zero();
            pdpte.set_table(pd_pa)?;
            pdpte_ref.write(pdpte);

            let pd_va = mem
                .pa_to_va(pd_pa)
                .ok_or(EptError::NoReverseMapping(pd_pa))?;
            // SAFETY: a freshly allocated, zeroed table page.
            let entries = unsafe {
                core::slice::from_raw_parts_mut(
                    pd_va.into_usize() as *mut EptEntry,
                    TABLE_ENTRY_COUNT,
                )
            };
            for (j, slot) in entries.iter_mut().enumerate() {
                let base = Pa::new(unit * HUGE_PAGE_SIZE + j * LARGE_PAGE_SIZE).unwrap();
                let ty = oracle.memory_type(base, LARGE_PAGE_SIZE);
                let mut entry = EptEntry::zero();
                entry.set_large_page(base, ty, EptPermission::FULL)?;
                *slot = entry;
            }
        }

        log::info!("ept: mapped {} GB of physical memory with 2MB pages", units);
        self.state = EptState::Populated;
        Ok(())
    }

    /// Resolve the live leaf entry governing translations to `pa`.
    ///
    /// A 2MB large-page mapping encountered on the way is transparently
    /// converted to a leaf table first, so the caller always receives a
    /// 4KB-granularity entry.
    pub fn resolve_leaf<M: KernelMemory, H: VmxFacility>(
        &mut self,
        mem: &mut M,
        hw: &mut H,
        pa: Pa,
        ctx: AllocationContext,
    ) -> Result<EntryRef, EptError> {
        if self.state == EptState::TornDown {
            return Err(EptError::TornDown);
        }
        let idx = PageIndices::of(unsafe { pa.into_usize() });

        let pml4e = self
            .entry_ref(mem, self.eptp.table_base(), idx.pml4)?
            .read();
        let pdpt = pml4e.table_base().ok_or(EptError::NotPresent)?;

        let pdpte = self.entry_ref(mem, pdpt, idx.pdpt)?.read();
        if !pdpte.present() {
            return Err(EptError::NotPresent);
        }
        if pdpte.large_region() {
            // 1GB mappings are never produced by either population policy.
            return Err(EptError::UnsupportedMapping);
        }
        let pd = pdpte.table_base().ok_or(EptError::NotPresent)?;

        let pde_ref = self.entry_ref(mem, pd, idx.pd)?;
        let mut pde = pde_ref.read();
        if !pde.present() {
            return Err(EptError::NotPresent);
        }
        if pde.large_region() {
            self.split_large(mem, hw, pde_ref, ctx)?;
            pde = pde_ref.read();
        }
        let pt = pde.table_base().ok_or(EptError::NotPresent)?;

        let pte_ref = self.entry_ref(mem, pt, idx.pt)?;
        if !pte_ref.read().present() {
            return Err(EptError::NotPresent);
        }
        Ok(pte_ref)
    }

    /// Convert a present 2MB large-page entry into a reference to a leaf
    /// table reproducing the same 2MB of translations at 4KB granularity,
    /// with identical permissions and memory type.
    ///
    /// The replacement table comes from the cached pool in
    /// [`AllocationContext::InterruptContext`] and from a fresh allocation
    /// otherwise. The translation cache is invalidated before returning.
    pub fn split_large<M: KernelMemory, H: VmxFacility>(
        &mut self,
        mem: &mut M,
        hw: &mut H,
        entry_ref: EntryRef,
        ctx: AllocationContext,
    ) -> Result<(), EptError> {
        let entry = entry_ref.read();
        if !entry.present() {
            return Err(EptError::NotPresent);
        }
        if !entry.large_region() {
            return Err(EptError::NotLargePage);
        }

        let table = match ctx {
            AllocationContext::InterruptContext => {
                self.pool.take().ok_or(EptError::CachedTableExhausted)?
            }
            AllocationContext::Unconstrained => mem.allocate(PAGE_SIZE, true, true)?,
        };

        let base = entry.large_base().ok_or(EptError::NotLargePage)?;
        let ty = entry.mem_type().unwrap_or(MemoryType::WriteBack);
        let perm = entry.permissions();

        let table_va = match mem.pa_to_va(table.pa) {
            Some(va) => va,
            None => {
                let pa = table.pa;
                mem.free(table);
                return Err(EptError::NoReverseMapping(pa));
            }
        };
        // SAFETY: a zeroed page dedicated to this table.
        let entries = unsafe {
            core::slice::from_raw_parts_mut(
                table_va.into_usize() as *mut EptEntry,
                TABLE_ENTRY_COUNT,
            )
        };
        for (i, slot) in entries.iter_mut().enumerate() {
            let mut leaf = EptEntry::zero();
            leaf.set_page(base + i * PAGE_SIZE, ty, perm)?;
            *slot = leaf;
        }

        let mut replacement = EptEntry::zero();
        replacement.set_table(table.pa)?;
        entry_ref.write(replacement);
        self.tables.push(table);

        log::debug!("ept: split 2MB region at {} into a leaf table", base);
        self.invalidate(hw, InveptScope::AllContexts)
    }

    /// Invalidate cached guest-physical translations, after confirming the
    /// hardware supports the requested scope.
    pub fn invalidate<H: VmxFacility>(
        &self,
        hw: &mut H,
        scope: InveptScope,
    ) -> Result<(), EptError> {
        let cap = EptVpidCap::from_bits_truncate(hw.rdmsr(IA32_VMX_EPT_VPID_CAP));
        let supported = match scope {
            InveptScope::SingleContext => {
                cap.contains(EptVpidCap::INVEPT | EptVpidCap::INVEPT_SINGLE_CONTEXT)
            }
            InveptScope::AllContexts => {
                cap.contains(EptVpidCap::INVEPT | EptVpidCap::INVEPT_ALL_CONTEXT)
            }
        };
        if !supported {
            return Err(EptError::UnsupportedInvalidation(scope));
        }
        hw.invept(scope, self.eptp.value())
            .map_err(EptError::Instruction)
    }

    /// Release the hierarchy: unused pool slots first, then a post-order
    /// walk that frees every engine-owned table exactly once and zeroes
    /// every visited entry. Data pages referenced by leaf and large-page
    /// entries belong to the kernel and are only unlinked.
    ///
    /// Safe to call on a built but never-populated hierarchy, and a second
    /// call is a no-op. Failures mid-walk are unrecoverable and assert.
    pub fn teardown<M: KernelMemory>(&mut self, mem: &mut M) {
        if self.state == EptState::TornDown {
            return;
        }
        self.pool.release_unused(mem);

        #[derive(Clone, Copy)]
        struct Frame {
            table: Pa,
            slot: usize,
        }
        let entry_at = |mem: &M, table: Pa, slot: usize| -> EntryRef {
            let va = mem
                .pa_to_va(table)
                .expect("ept teardown: reverse mapping unavailable mid-walk");
            EntryRef::new(va + slot * core::mem::size_of::<u64>())
        };

        let mut stack = [Frame { table: Pa::ZERO, slot: 0 }; 4];
        stack[0] = Frame {
            table: self.eptp.table_base(),
            slot: 0,
        };
        let mut depth = 0usize;

        loop {
            let Frame { table, slot } = stack[depth];
            if slot == TABLE_ENTRY_COUNT {
                self.release_table(mem, table);
                if depth == 0 {
                    break;
                }
                depth -= 1;
                let parent = stack[depth];
                entry_at(mem, parent.table, parent.slot - 1).write(EptEntry::zero());
                continue;
            }
            stack[depth].slot += 1;

            let entry_ref = entry_at(mem, table, slot);
            let entry = entry_ref.read();
            if !entry.present() {
                continue;
            }
            if depth < 3 && !entry.large_region() {
                let next = entry
                    .table_base()
                    .expect("ept teardown: present entry without a table base");
                depth += 1;
                stack[depth] = Frame { table: next, slot: 0 };
            } else {
                entry_ref.write(EptEntry::zero());
            }
        }

        debug_assert!(self.tables.is_empty());
        self.state = EptState::TornDown;
        log::info!("ept: hierarchy torn down");
    }

    fn release_table<M: KernelMemory>(&mut self, mem: &mut M, table: Pa) {
        let pos = self
            .tables
            .iter()
            .position(|a| a.pa == table)
            .expect("ept teardown: table missing from the allocation ledger");
        mem.free(self.tables.swap_remove(pos));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_interpretations_are_explicit() {
        let mut entry = EptEntry::zero();
        assert!(!entry.present());

        entry
            .set_page(Pa::new(0x1234_5000).unwrap(), MemoryType::WriteBack, EptPermission::FULL)
            .unwrap();
        assert!(entry.present());
        assert!(!entry.large_region());
        assert_eq!(entry.page_base(), Pa::new(0x1234_5000));
        assert_eq!(entry.mem_type(), Some(MemoryType::WriteBack));
        assert_eq!(entry.permissions(), EptPermission::FULL);

        let mut entry = EptEntry::zero();
        entry
            .set_large_page(Pa::new(0x4000_0000).unwrap(), MemoryType::Uncacheable, EptPermission::FULL)
            .unwrap();
        assert!(entry.large_region());
        assert_eq!(entry.large_base(), Pa::new(0x4000_0000));
        assert_eq!(entry.mem_type(), Some(MemoryType::Uncacheable));

        let mut entry = EptEntry::zero();
        entry.set_table(Pa::new(0x6000).unwrap()).unwrap();
        assert!(entry.present());
        assert!(!entry.large_region());
        assert_eq!(entry.table_base(), Pa::new(0x6000));
    }

    #[test]
    fn entry_rejects_unaligned_bases() {
        let mut entry = EptEntry::zero();
        assert_eq!(entry.set_table(Pa::new(0x6010).unwrap()), Err(EptError::Unaligned));
        assert_eq!(
            entry.set_large_page(
                Pa::new(0x10_0000).unwrap(),
                MemoryType::WriteBack,
                EptPermission::FULL
            ),
            Err(EptError::Unaligned)
        );
    }

    #[test]
    fn page_base_swap_preserves_flags() {
        let mut entry = EptEntry::zero();
        entry
            .set_page(Pa::new(0xA000).unwrap(), MemoryType::WriteBack, EptPermission::FULL)
            .unwrap();
        entry.set_page_base(Pa::new(0xB000).unwrap()).unwrap();
        assert_eq!(entry.page_base(), Pa::new(0xB000));
        assert_eq!(entry.mem_type(), Some(MemoryType::WriteBack));
        assert_eq!(entry.permissions(), EptPermission::FULL);

        entry.set_permissions(EptPermission::EXECUTE);
        assert_eq!(entry.permissions(), EptPermission::EXECUTE);
        assert_eq!(entry.page_base(), Pa::new(0xB000));
    }

    #[test]
    fn eptp_encoding() {
        let eptp = Eptp::new(Pa::new(0x7000).unwrap());
        // Write-back type, walk length 4 (encoded as 3), accessed/dirty off.
        assert_eq!(eptp.value() & 0x7, 6);
        assert_eq!((eptp.value() >> 3) & 0x7, 3);
        assert_eq!(eptp.value() & (1 << 6), 0);
        assert_eq!(eptp.table_base(), Pa::new(0x7000).unwrap());
    }
}
