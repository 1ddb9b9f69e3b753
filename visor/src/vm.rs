//! The session lifecycle: prepare, run, unwind.
//!
//! A session moves `Idle -> Prepared -> Virtualizing -> Unwound`. Prepare
//! captures privileged state, verifies the hardware prerequisites before
//! allocating anything, builds and populates the translation hierarchy, and
//! allocates the stacks, bitmap, and control regions. Run raises the
//! execution priority, enters VMX operation, configures the control
//! structure, and loops between guest entries and exit dispatch. The unwind
//! path always executes, on success and on every error, and leaves the
//! processor and the kernel's memory exactly as prepare found them.

use alloc::vec::Vec;

use crate::{
    addressing::{Va, PAGE_MASK, PAGE_SIZE},
    config,
    ept::ExtendedPageTable,
    mtrr::{self, MemTypeOracle},
    platform::{KernelMemory, PrivilegedSnapshot, VmxAllocation},
    vm_control::{
        apply_cr_fixed_bits, revision_id, EptVpidCap, FeatureControl, IA32_FEATURE_CONTROL,
        IA32_VMX_BASIC, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1, IA32_VMX_CR4_FIXED0,
        IA32_VMX_CR4_FIXED1, IA32_VMX_EPT_VPID_CAP,
    },
    vmcs::{ExitReason, Field},
    vmexits::{ExitDisposition, SessionReport, VmexitController},
    vmx::{ExecutionPriority, GuestTransition, VmxFacility},
    Capability, VmmError,
};

/// Size of the guest and host stacks.
pub const STACK_SIZE: usize = 0x6000;

/// How the translation hierarchy is populated before launch.
pub enum MappingPolicy {
    /// Identity map only the listed virtual addresses (plus the guest
    /// stack), at 4KB granularity.
    PerAddress(Vec<Va>),
    /// Identity map all of physical memory up to `extent` bytes with 2MB
    /// large pages.
    FullSystem {
        /// Estimated total physical-memory extent in bytes.
        extent: usize,
    },
}

/// Static description of one session.
pub struct SessionConfig {
    /// Guest entry point.
    pub guest_entry: Va,
    /// Population policy for the translation hierarchy.
    pub mapping: MappingPolicy,
}

/// A prepared (and later, unwound) virtualization session on one logical
/// processor.
#[derive(Debug)]
pub struct VmSession {
    snapshot: PrivilegedSnapshot,
    ept: ExtendedPageTable,
    guest_stack: Option<VmxAllocation>,
    host_stack: Option<VmxAllocation>,
    msr_bitmap: Option<VmxAllocation>,
    vmxon_region: Option<VmxAllocation>,
    vmcs_region: Option<VmxAllocation>,
    priority: Option<ExecutionPriority>,
    vmx_enabled: bool,
}

fn preflight<H: VmxFacility>(hw: &H) -> Result<(), VmmError> {
    // The feature-control lock must be set with VMX permitted outside SMX.
    let feature = FeatureControl::from_bits_truncate(hw.rdmsr(IA32_FEATURE_CONTROL));
    if !feature.contains(FeatureControl::LOCK | FeatureControl::VMX_OUTSIDE_SMX) {
        return Err(VmmError::MissingCapability(Capability::VmxFeatureControl));
    }

    let cap = EptVpidCap::from_bits_truncate(hw.rdmsr(IA32_VMX_EPT_VPID_CAP));
    if !cap.contains(EptVpidCap::PAGE_WALK_LENGTH_4) {
        return Err(VmmError::MissingCapability(Capability::EptWalkLength4));
    }
    if !cap.contains(EptVpidCap::MEMORY_TYPE_WB) {
        return Err(VmmError::MissingCapability(Capability::EptWriteBack));
    }
    if !cap.contains(EptVpidCap::INVEPT | EptVpidCap::INVEPT_ALL_CONTEXT) {
        return Err(VmmError::MissingCapability(Capability::InveptAllContexts));
    }

    if !mtrr::supported(hw) {
        return Err(VmmError::MissingCapability(Capability::MemoryTypeReporting));
    }
    Ok(())
}

impl VmSession {
    /// `Idle -> Prepared`: capability checks (before any allocation),
    /// hierarchy build and population, and every allocation the session
    /// needs, with the two control regions tagged with the hardware's
    /// revision identifier.
    pub fn prepare<M: KernelMemory, H: VmxFacility, O: MemTypeOracle>(
        mem: &mut M,
        hw: &H,
        config: &SessionConfig,
        oracle: &O,
    ) -> Result<Self, VmmError> {
        let snapshot = hw.snapshot_privileged();
        preflight(hw)?;

        let ept = ExtendedPageTable::build(mem)?;
        let mut session = Self {
            snapshot,
            ept,
            guest_stack: None,
            host_stack: None,
            msr_bitmap: None,
            vmxon_region: None,
            vmcs_region: None,
            priority: None,
            vmx_enabled: false,
        };
        match session.populate(mem, hw, config, oracle) {
            Ok(()) => Ok(session),
            Err(e) => {
                session.release(mem);
                Err(e)
            }
        }
    }

    fn populate<M: KernelMemory, H: VmxFacility, O: MemTypeOracle>(
        &mut self,
        mem: &mut M,
        hw: &H,
        config: &SessionConfig,
        oracle: &O,
    ) -> Result<(), VmmError> {
        let host_root = self.snapshot.host_page_table_root();
        match &config.mapping {
            MappingPolicy::PerAddress(addresses) => {
                for va in addresses {
                    self.ept.insert_identity(mem, host_root, *va)?;
                }
            }
            MappingPolicy::FullSystem { extent } => {
                self.ept.map_system(mem, oracle, *extent)?;
            }
        }

        self.guest_stack = Some(mem.allocate(STACK_SIZE, false, false)?);
        self.host_stack = Some(mem.allocate(STACK_SIZE, false, false)?);
        self.msr_bitmap = Some(mem.allocate(PAGE_SIZE, true, true)?);
        self.vmxon_region = Some(mem.allocate(PAGE_SIZE, true, true)?);
        self.vmcs_region = Some(mem.allocate(PAGE_SIZE, true, true)?);

        // The guest touches its own stack; under per-address population
        // those pages need identity mappings of their own.
        if let MappingPolicy::PerAddress(_) = config.mapping {
            let stack = self.guest_stack.as_ref().unwrap();
            let mut va = stack.va;
            for _ in 0..(stack.len + PAGE_MASK) / PAGE_SIZE {
                self.ept.insert_identity(mem, host_root, va)?;
                va = va + PAGE_SIZE;
            }
        }

        // Both hardware-defined regions begin with the revision identifier.
        let revision = revision_id(hw.rdmsr(IA32_VMX_BASIC));
        for region in [
            self.vmxon_region.as_ref().unwrap(),
            self.vmcs_region.as_ref().unwrap(),
        ] {
            // SAFETY: freshly allocated, zeroed, page-aligned regions.
            unsafe { (region.va.into_usize() as *mut u32).write_volatile(revision) };
        }
        Ok(())
    }

    /// The translation hierarchy of this session.
    #[inline]
    pub fn ept(&self) -> &ExtendedPageTable {
        &self.ept
    }

    /// Top of the guest stack (16-byte aligned).
    pub fn guest_stack_top(&self) -> Va {
        let stack = self.guest_stack.as_ref().expect("session not prepared");
        stack.va + stack.len
    }

    /// `Prepared -> Virtualizing -> Unwound`: run the guest to completion.
    ///
    /// Whatever happens inside, the unwind path runs before this returns:
    /// VMX operation is left, the privileged snapshot is restored, and every
    /// allocation of the session is released.
    pub fn run<M: KernelMemory, H: VmxFacility, C: VmexitController>(
        &mut self,
        mem: &mut M,
        hw: &mut H,
        controller: &mut C,
        config: &SessionConfig,
    ) -> Result<SessionReport, VmmError> {
        let outcome = self.virtualize(mem, hw, controller, config);
        self.unwind(mem, hw);
        outcome.map(|()| controller.report())
    }

    fn virtualize<M: KernelMemory, H: VmxFacility, C: VmexitController>(
        &mut self,
        mem: &mut M,
        hw: &mut H,
        controller: &mut C,
        config: &SessionConfig,
    ) -> Result<(), VmmError> {
        // Any interruption during guest execution risks an instruction the
        // execution controls have not enabled, which the hardware faults
        // on; exclusion is a functional requirement, not an optimization.
        self.priority = Some(hw.raise_priority());

        let cr0 = apply_cr_fixed_bits(
            self.snapshot.cr0,
            hw.rdmsr(IA32_VMX_CR0_FIXED0),
            hw.rdmsr(IA32_VMX_CR0_FIXED1),
        );
        hw.write_cr0(cr0);
        // Fixing CR4 also sets CR4.VMXE, gating entry into VMX operation.
        let cr4 = apply_cr_fixed_bits(
            self.snapshot.cr4,
            hw.rdmsr(IA32_VMX_CR4_FIXED0),
            hw.rdmsr(IA32_VMX_CR4_FIXED1),
        );
        hw.write_cr4(cr4);

        let vmxon = self.vmxon_region.as_ref().expect("session not prepared").pa;
        hw.vmxon(vmxon)?;
        self.vmx_enabled = true;

        let vmcs = self.vmcs_region.as_ref().expect("session not prepared").pa;
        hw.vmclear(vmcs)?;
        hw.vmptrld(vmcs)?;

        config::write_guest_state(hw, &self.snapshot, self.guest_stack_top(), config.guest_entry)?;
        let host_stack = self.host_stack.as_ref().expect("session not prepared");
        let host_stack_top = host_stack.va + host_stack.len;
        let host_entry = hw.host_entry_point();
        config::write_host_state(hw, &self.snapshot, host_stack_top, host_entry)?;
        config::write_pin_based_controls(hw)?;
        config::write_primary_controls(hw)?;
        config::write_secondary_controls(hw)?;
        config::write_exit_controls(hw)?;
        config::write_entry_controls(hw)?;
        config::write_link_pointer(hw)?;
        config::write_msr_bitmap(hw, self.msr_bitmap.as_ref().expect("session not prepared").pa)?;
        config::write_ept_pointer(hw, self.ept.eptp())?;

        log::info!("launching the guest at {}", config.guest_entry);
        let mut launched = false;
        loop {
            match hw.enter_guest(launched) {
                GuestTransition::Failed(err) => {
                    // The instruction-error field is the only diagnostic a
                    // refused launch leaves behind.
                    log::error!("unable to enter the guest: {:?}", err);
                    return Err(VmmError::LaunchFailed(err));
                }
                GuestTransition::Exited => {}
            }
            launched = true;

            let reason = ExitReason::from_raw(hw.vmread(Field::ExitReason)?);
            if reason.entry_failure() {
                log::error!("VM entry failed; basic reason = {:?}", reason.basic());
                return Err(VmmError::EntryFailure(reason.basic()));
            }

            match controller.handle(reason, &mut self.ept, mem, hw)? {
                ExitDisposition::Resume => continue,
                ExitDisposition::Shutdown => break,
            }
        }
        Ok(())
    }

    /// `-> Unwound`: leave VMX operation, restore the privileged snapshot
    /// (descriptor tables, control registers) and the original execution
    /// priority, and release every allocation including the hierarchy.
    fn unwind<M: KernelMemory, H: VmxFacility>(&mut self, mem: &mut M, hw: &mut H) {
        log::info!("cleaning up the virtualization session");

        if self.vmx_enabled {
            hw.vmxoff();
            self.vmx_enabled = false;
        }

        // The hardware clobbers the descriptor-table limits and the fixed
        // control-register bits remain set; both come back from the
        // snapshot. Concurrent modification by higher-priority contexts is
        // not accounted for.
        hw.restore_privileged(&self.snapshot);

        if let Some(previous) = self.priority.take() {
            hw.restore_priority(previous);
        }

        self.release(mem);
    }

    fn release<M: KernelMemory>(&mut self, mem: &mut M) {
        for allocation in [
            self.vmcs_region.take(),
            self.vmxon_region.take(),
            self.msr_bitmap.take(),
            self.host_stack.take(),
            self.guest_stack.take(),
        ]
        .into_iter()
        .flatten()
        {
            mem.free(allocation);
        }
        self.ept.teardown(mem);
    }
}
