//! Contracts for the kernel services the monitor consumes.
//!
//! The monitor never allocates, translates, or captures privileged processor
//! state on its own; a kernel driver (or a test harness) provides these
//! services behind the traits below.

use crate::addressing::{Pa, Va};

/// A single contiguous allocation, as a paired virtual/physical handle.
///
/// Every stack, bitmap, control region, and paging table the monitor uses is
/// one of these. Ownership is exclusive to the component that requested the
/// allocation, and each record is passed back to [`KernelMemory::free`]
/// exactly once.
#[derive(Debug)]
pub struct VmxAllocation {
    /// Kernel virtual base of the allocation.
    pub va: Va,
    /// Physical base, or [`Pa::ZERO`] when the caller did not ask for it.
    pub pa: Pa,
    /// Requested length in bytes.
    pub len: usize,
    /// Whether the allocation is physically contiguous.
    pub contiguous: bool,
}

/// Allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The pool or contiguous region could not satisfy the request.
    OutOfMemory,
    /// The allocation succeeded but its physical address could not be
    /// resolved.
    NoPhysicalAddress,
}

/// The kernel allocation and translation contract.
///
/// Implementations must return zeroed memory from [`allocate`], and resolve
/// the physical address when `want_pa` is set. Translation in both
/// directions only needs to cover memory this kernel owns; anything else
/// resolves to `None`.
///
/// [`allocate`]: KernelMemory::allocate
pub trait KernelMemory {
    /// Allocate `len` bytes, page aligned and zeroed.
    fn allocate(
        &mut self,
        len: usize,
        contiguous: bool,
        want_pa: bool,
    ) -> Result<VmxAllocation, AllocError>;

    /// Release an allocation previously returned by [`KernelMemory::allocate`].
    fn free(&mut self, allocation: VmxAllocation);

    /// Translate a kernel virtual address to its physical address.
    fn va_to_pa(&self, va: Va) -> Option<Pa>;

    /// Translate a physical address back to a kernel virtual address.
    fn pa_to_va(&self, pa: Pa) -> Option<Va>;
}

/// One segment register as captured from the running processor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentSnapshot {
    /// Segment selector.
    pub selector: u16,
    /// Segment base address.
    pub base: u64,
    /// Segment limit.
    pub limit: u32,
    /// Access rights in the VMCS encoding.
    pub access_rights: u32,
}

/// The privileged processor state captured before the session starts.
///
/// Written once at prepare time and used for three things: populating the
/// guest-state area (the guest initially continues the host's execution
/// environment), populating the host-state area (what the hardware reloads
/// on every exit), and restoring the processor during unwind. Restoration
/// does not account for concurrent modification by higher-priority contexts;
/// that is an accepted simplification of the single-processor design.
#[derive(Debug, Clone, Default)]
pub struct PrivilegedSnapshot {
    /// CR0 at capture time.
    pub cr0: u64,
    /// CR3 at capture time; its base is the root of the host page tables.
    pub cr3: u64,
    /// CR4 at capture time.
    pub cr4: u64,
    /// DR7 at capture time.
    pub dr7: u64,
    /// RFLAGS at capture time.
    pub rflags: u64,
    /// Code segment.
    pub cs: SegmentSnapshot,
    /// Stack segment.
    pub ss: SegmentSnapshot,
    /// Data segment.
    pub ds: SegmentSnapshot,
    /// Extra segment.
    pub es: SegmentSnapshot,
    /// FS segment.
    pub fs: SegmentSnapshot,
    /// GS segment.
    pub gs: SegmentSnapshot,
    /// Local descriptor table register.
    pub ldtr: SegmentSnapshot,
    /// Task register.
    pub tr: SegmentSnapshot,
    /// GDTR base.
    pub gdtr_base: u64,
    /// GDTR limit.
    pub gdtr_limit: u32,
    /// IDTR base.
    pub idtr_base: u64,
    /// IDTR limit.
    pub idtr_limit: u32,
    /// IA32_FS_BASE.
    pub fs_base: u64,
    /// IA32_GS_BASE.
    pub gs_base: u64,
    /// IA32_DEBUGCTL.
    pub debugctl: u64,
    /// IA32_SYSENTER_CS.
    pub sysenter_cs: u64,
    /// IA32_SYSENTER_ESP.
    pub sysenter_esp: u64,
    /// IA32_SYSENTER_EIP.
    pub sysenter_eip: u64,
}

impl PrivilegedSnapshot {
    /// Physical base of the host's top-level page table, from CR3.
    #[inline]
    pub fn host_page_table_root(&self) -> Pa {
        Pa::new(self.cr3 as usize & 0x000f_ffff_ffff_f000).unwrap_or(Pa::ZERO)
    }
}
