//! A minimal virtual-machine monitor for a single logical processor.
//!
//! The monitor enters VMX root operation, launches one guest execution
//! context, and intercepts a small, fixed set of guest events. Its memory
//! virtualization is built on the extended page tables (EPT): guest-physical
//! addresses are identity mapped onto host-physical addresses, and individual
//! 4-KByte translations are rewritten at runtime to redirect or split the
//! guest's view of a page.
//!
//! The crate is organized leaf-first:
//!
//! - [`addressing`] — address newtypes and the 4-level index decomposition.
//! - [`platform`] — contracts for the kernel services the monitor consumes
//!   (allocation, address translation, privileged-state capture).
//! - [`vm_control`] — VMX capability MSRs and control-field bit definitions.
//! - [`vmx`] — the hardware virtualization instruction surface.
//! - [`vmcs`] — VMCS field encodings, exit reasons, instruction errors.
//! - [`indexer`] — resolves the physical index points of a virtual address.
//! - [`mtrr`] — memory-type range register lookup.
//! - [`ept`] — the extended page table engine.
//! - [`config`] — VMCS population.
//! - [`vmexits`] — the VM-exit dispatcher.
//! - [`vm`] — the session lifecycle: prepare, run, unwind.
//!
//! Everything privileged the monitor needs from its environment is expressed
//! as a trait, so the same core drives real hardware from a kernel driver or
//! a simulated facility from a test harness. Exactly one logical processor is
//! in scope; the entire session runs with interrupts excluded, so no locking
//! discipline exists or is needed.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addressing;
pub mod config;
pub mod ept;
pub mod indexer;
pub mod mtrr;
pub mod platform;
pub mod vm;
pub mod vm_control;
pub mod vmcs;
pub mod vmexits;
pub mod vmx;

use crate::{
    ept::EptError,
    indexer::IndexerError,
    platform::AllocError,
    vmcs::{BasicExitReason, ExitReason, InstructionError},
};

/// A hardware prerequisite checked before the session allocates anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// IA32_FEATURE_CONTROL must be locked with VMX permitted outside SMX.
    VmxFeatureControl,
    /// The EPT walk must support a full 4-level translation.
    EptWalkLength4,
    /// EPT paging structures must support the write-back memory type.
    EptWriteBack,
    /// INVEPT with all-context scope must be available.
    InveptAllContexts,
    /// The MTRRs must be enabled so memory types can be resolved.
    MemoryTypeReporting,
}

/// Errors reported by the monitor.
///
/// Setup-time failures (missing capabilities, failed allocations, refused
/// VMX instructions) and guest-triggered terminal conditions both surface
/// here; in either case the session unwind path has already run by the time
/// the error reaches the caller.
#[derive(Debug)]
pub enum VmmError {
    /// The kernel allocation collaborator failed.
    Allocation(AllocError),
    /// A required hardware capability is absent.
    MissingCapability(Capability),
    /// A VMX instruction was refused.
    VmxOperation(InstructionError),
    /// The EPT engine failed.
    Ept(EptError),
    /// The physical memory indexer could not resolve an address.
    Indexer(IndexerError),
    /// VM entry failed after launch; the basic reason is diagnostic only.
    EntryFailure(BasicExitReason),
    /// VMLAUNCH or VMRESUME itself was refused.
    LaunchFailed(InstructionError),
    /// A guest address used by the intercept plan has no physical translation.
    UnmappedGuestAddress(addressing::Va),
    /// An EPT violation on an address with no active registration.
    UnhandledEptViolation { gpa: u64, linear: u64 },
    /// The hardware reported an EPT misconfiguration.
    EptMisconfiguration { gpa: u64 },
    /// A VM exit this monitor has no policy for.
    UnhandledVmexit(ExitReason),
}

impl From<AllocError> for VmmError {
    fn from(e: AllocError) -> Self {
        VmmError::Allocation(e)
    }
}

impl From<InstructionError> for VmmError {
    fn from(e: InstructionError) -> Self {
        VmmError::VmxOperation(e)
    }
}

impl From<EptError> for VmmError {
    fn from(e: EptError) -> Self {
        VmmError::Ept(e)
    }
}

impl From<IndexerError> for VmmError {
    fn from(e: IndexerError) -> Self {
        VmmError::Indexer(e)
    }
}
