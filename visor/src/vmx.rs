//! The hardware virtualization instruction surface.
//!
//! Everything the monitor asks of the processor goes through
//! [`VmxFacility`]: capability reads, the VMX lifecycle instructions, VMCS
//! field access, translation-cache invalidation, and the entry into guest
//! execution. A kernel driver implements this with the real instructions; a
//! test harness implements it with a simulated processor. The monitor's
//! logic is identical over both.

use crate::{
    addressing::{Pa, Va},
    platform::PrivilegedSnapshot,
    vmcs::{Field, InstructionError},
};

/// Scope of a translation-cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InveptScope {
    /// Invalidate translations tagged with one EPT root.
    SingleContext,
    /// Invalidate translations for every EPT root.
    AllContexts,
}

/// The result of handing the processor to the guest.
#[derive(Debug, Clone, Copy)]
pub enum GuestTransition {
    /// The guest ran and a VM exit brought control back; the read-only VMCS
    /// fields describe it.
    Exited,
    /// VMLAUNCH/VMRESUME itself was refused.
    Failed(InstructionError),
}

/// An opaque execution-priority level, returned when raising and accepted
/// back when restoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPriority(pub u8);

/// Read access to model-specific registers.
pub trait Msrs {
    /// Read a 64-bit MSR.
    fn rdmsr(&self, msr: u32) -> u64;
}

/// The privileged hardware surface of one logical processor.
pub trait VmxFacility: Msrs {
    /// Capture the privileged state needed to configure and later restore
    /// the processor.
    fn snapshot_privileged(&self) -> PrivilegedSnapshot;

    /// Restore descriptor tables and control registers from a snapshot.
    fn restore_privileged(&mut self, saved: &PrivilegedSnapshot);

    /// Raise the execution priority to the maximum level, excluding all
    /// interruption. Returns the previous level.
    fn raise_priority(&mut self) -> ExecutionPriority;

    /// Return to a previously captured execution priority.
    fn restore_priority(&mut self, previous: ExecutionPriority);

    /// Write CR0.
    fn write_cr0(&mut self, value: u64);

    /// Write CR4.
    fn write_cr4(&mut self, value: u64);

    /// The address the hardware transfers to on every VM exit (the host RIP
    /// written into the control structure).
    fn host_entry_point(&self) -> Va;

    /// Enter VMX root operation using the given VMXON region.
    fn vmxon(&mut self, region: Pa) -> Result<(), InstructionError>;

    /// Leave VMX operation.
    fn vmxoff(&mut self);

    /// Clear the launch state of a control structure and flush any cached
    /// copy of it.
    fn vmclear(&mut self, region: Pa) -> Result<(), InstructionError>;

    /// Make a control structure current and active.
    fn vmptrld(&mut self, region: Pa) -> Result<(), InstructionError>;

    /// Read a field of the current control structure.
    fn vmread(&self, field: Field) -> Result<u64, InstructionError>;

    /// Write a field of the current control structure.
    fn vmwrite(&mut self, field: Field, value: u64) -> Result<(), InstructionError>;

    /// Invalidate cached guest-physical translations.
    fn invept(&mut self, scope: InveptScope, eptp: u64) -> Result<(), InstructionError>;

    /// Run the guest until the next VM exit. `launched` selects between the
    /// launch and resume forms of entry.
    fn enter_guest(&mut self, launched: bool) -> GuestTransition;
}
