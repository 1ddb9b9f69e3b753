//! Physical memory indexing.
//!
//! To identity map a virtual address into the EPT, every physical address
//! the hardware touches while translating it must itself be translatable:
//! the four page-table pages of the host walk plus the final data page. The
//! indexer resolves those five index points from externally owned tables
//! without mutating anything.

use crate::{
    addressing::{Pa, PageIndices, Va},
    platform::KernelMemory,
};

/// A page-table entry of the host's own 4-level paging, 4KB granularity.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct HostEntry(u64);

impl HostEntry {
    const BASE_MASK: u64 = 0x000f_ffff_ffff_f000;

    /// Raw entry value.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Present bit.
    #[inline]
    pub fn present(&self) -> bool {
        self.0 & 1 != 0
    }

    /// Page-size bit: the entry maps a large region instead of referencing
    /// the next table.
    #[inline]
    pub fn large(&self) -> bool {
        self.0 & (1 << 7) != 0
    }

    /// Base address of the referenced table or page.
    #[inline]
    pub fn base(&self) -> Pa {
        Pa::new((self.0 & Self::BASE_MASK) as usize).unwrap_or(Pa::ZERO)
    }
}

impl core::fmt::Debug for HostEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "HostEntry(0x{:x})", self.0)
    }
}

/// One resolved index point: the entry that was walked through, and the
/// physical base it requires to be translatable.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    /// The raw walked entry.
    pub entry: HostEntry,
    /// Base of the table (or, for the final point, the data page) that a
    /// guest-physical translation must be able to reach.
    pub base: Pa,
}

/// The five physical index points of one virtual address.
#[derive(Debug, Clone, Copy)]
pub struct IndexPoints {
    /// Top-level table and its walked entry.
    pub pml4e: IndexEntry,
    /// Upper-middle table and its walked entry.
    pub pdpte: IndexEntry,
    /// Middle table and its walked entry.
    pub pde: IndexEntry,
    /// Leaf table and its walked entry.
    pub pte: IndexEntry,
    /// The final data page; `entry` repeats the leaf entry.
    pub page: IndexEntry,
}

impl IndexPoints {
    /// The five physical bases, top-down.
    #[inline]
    pub fn bases(&self) -> [Pa; 5] {
        [
            self.pml4e.base,
            self.pdpte.base,
            self.pde.base,
            self.pte.base,
            self.page.base,
        ]
    }
}

/// Why the indexer could not resolve an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerError {
    /// The allocation collaborator reports no physical address for the
    /// virtual address at all.
    NoExpectedTranslation(Va),
    /// A table's physical base has no kernel virtual mapping to read it
    /// through.
    NoReverseMapping(Pa),
    /// An intermediate entry is absent. The altitude counts down from 4 at
    /// the top level.
    EntryNotPresent { altitude: u8 },
    /// An intermediate level maps a large region, which breaks the
    /// same-size-step assumption of the walk.
    LargeMapping { altitude: u8 },
    /// The walked page disagrees with the independently reported physical
    /// address.
    TranslationMismatch { resolved: Pa, expected: Pa },
}

fn read_entry<M: KernelMemory>(mem: &M, table: Pa, slot: usize) -> Result<HostEntry, IndexerError> {
    let va = mem.pa_to_va(table).ok_or(IndexerError::NoReverseMapping(table))?;
    // SAFETY: `table` is a live page-table page owned by the kernel; the
    // reverse mapping points at its 512 64-bit entries.
    Ok(unsafe { ((va.into_usize() as *const HostEntry).add(slot)).read_volatile() })
}

/// Resolve the five physical index points of `va` under the host paging
/// hierarchy rooted at `root`.
///
/// Pure query: no memory is modified. Fails if any intermediate entry is
/// absent, if an intermediate level maps a large region, or if the resolved
/// page disagrees with the translation the allocation collaborator reports.
pub fn index_points<M: KernelMemory>(
    mem: &M,
    root: Pa,
    va: Va,
) -> Result<IndexPoints, IndexerError> {
    let expected = mem
        .va_to_pa(va)
        .ok_or(IndexerError::NoExpectedTranslation(va))?;
    let idx = PageIndices::of(unsafe { va.into_usize() });

    let pml4e = read_entry(mem, root, idx.pml4)?;
    if !pml4e.present() {
        return Err(IndexerError::EntryNotPresent { altitude: 4 });
    }

    let pdpte = read_entry(mem, pml4e.base(), idx.pdpt)?;
    if !pdpte.present() {
        return Err(IndexerError::EntryNotPresent { altitude: 3 });
    }
    if pdpte.large() {
        return Err(IndexerError::LargeMapping { altitude: 3 });
    }

    let pde = read_entry(mem, pdpte.base(), idx.pd)?;
    if !pde.present() {
        return Err(IndexerError::EntryNotPresent { altitude: 2 });
    }
    if pde.large() {
        return Err(IndexerError::LargeMapping { altitude: 2 });
    }

    let pte = read_entry(mem, pde.base(), idx.pt)?;
    if !pte.present() {
        return Err(IndexerError::EntryNotPresent { altitude: 1 });
    }

    let page = pte.base();
    if page != expected.page_base() {
        return Err(IndexerError::TranslationMismatch {
            resolved: page,
            expected: expected.page_base(),
        });
    }

    Ok(IndexPoints {
        pml4e: IndexEntry { entry: pml4e, base: root },
        pdpte: IndexEntry { entry: pdpte, base: pml4e.base() },
        pde: IndexEntry { entry: pde, base: pdpte.base() },
        pte: IndexEntry { entry: pte, base: pde.base() },
        page: IndexEntry { entry: pte, base: page },
    })
}
