//! VM-exit dispatch.
//!
//! The dispatcher runs synchronously on every exit, at the platform's
//! highest interrupt priority: nothing here may call the general kernel
//! allocator, which is why large-page conversion inside the handler draws
//! from the engine's cached pool.
//!
//! Only an EPT violation on the registered target page is recoverable;
//! every other terminal classification routes back through the session's
//! unwind path via an error.

use crate::{
    addressing::{Pa, Va},
    ept::{AllocationContext, EntryRef, EptEntry, EptPermission, ExtendedPageTable},
    mtrr::MemoryType,
    platform::KernelMemory,
    vmcs::{BasicExitReason, EptViolationQualification, ExitReason, Field},
    vmx::{InveptScope, VmxFacility},
    VmmError,
};

/// Offset from the guest stack pointer at which the guest deposits its
/// status byte before the final halt.
pub const GUEST_STATUS_STACK_OFFSET: usize = 0x28;

/// The status byte the guest leaves on its stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestStatus {
    /// The hook function executed in place of the target.
    Hooked,
    /// The target executed unmodified.
    NotHooked,
    /// The guest detected tampering and aborted.
    Aborted,
    /// Anything else.
    Unknown(u8),
}

impl GuestStatus {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0xBB => Self::Hooked,
            0xAA => Self::NotHooked,
            0xCC => Self::Aborted,
            other => Self::Unknown(other),
        }
    }
}

/// Which memory-virtualization demonstration the session performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptStrategy {
    /// Rewrite the target page's leaf entry to point at the hook page
    /// outright.
    HookRedirect,
    /// Split execute access away from read/write access: fetches observe
    /// the hook page, data accesses observe the original.
    ExecSplit,
}

/// The interception the dispatcher arms on the first halt.
#[derive(Debug, Clone, Copy)]
pub struct InterceptPlan {
    /// The strategy to apply.
    pub strategy: InterceptStrategy,
    /// Virtual address of the function under interception.
    pub target: Va,
    /// Virtual address of the replacement function.
    pub hook: Va,
}

/// One active page split: the real page, the page to serve on fetches, and
/// the live leaf entry governing the translation.
pub struct SplitRegistration {
    /// Physical base of the page under interception.
    pub target_base: Pa,
    /// Physical base of the alternate (swap) page.
    pub swap_base: Pa,
    /// The leaf entry currently governing translations to the target.
    pub entry: EntryRef,
    /// The entry's value before the split was armed.
    pub original: EptEntry,
}

/// What the session loop should do after an exit was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Return to the guest.
    Resume,
    /// Terminate the session through the unwind path.
    Shutdown,
}

/// How the session ended, as far as the dispatcher observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    /// Halts taken before the session terminated.
    pub halts: u8,
    /// Status byte recovered from the guest stack, when an interception was
    /// armed.
    pub guest_status: Option<GuestStatus>,
}

/// Policy applied on each VM exit.
pub trait VmexitController {
    /// Handle one exit. `Ok(Resume)` returns to the guest; `Ok(Shutdown)`
    /// and every `Err` terminate the session.
    fn handle<M: KernelMemory, H: VmxFacility>(
        &mut self,
        reason: ExitReason,
        ept: &mut ExtendedPageTable,
        mem: &mut M,
        hw: &mut H,
    ) -> Result<ExitDisposition, VmmError>;

    /// The controller's view of the finished session.
    fn report(&self) -> SessionReport;
}

/// The reference dispatcher: counts halts, arms the configured interception
/// on the first one, services violations against the registration, and
/// inspects the guest's status byte before shutting the session down.
pub struct InterceptDispatcher {
    plan: Option<InterceptPlan>,
    halt_budget: u8,
    halts: u8,
    registration: Option<SplitRegistration>,
    status: Option<GuestStatus>,
}

impl InterceptDispatcher {
    /// A dispatcher with no interception: every halt just logs, and the
    /// session ends once the budget is spent.
    pub fn observe_only(halt_budget: u8) -> Self {
        Self {
            plan: None,
            halt_budget,
            halts: 0,
            registration: None,
            status: None,
        }
    }

    /// A dispatcher that arms `plan` on the first halt and terminates after
    /// `halt_budget` halts.
    pub fn with_plan(plan: InterceptPlan, halt_budget: u8) -> Self {
        Self {
            plan: Some(plan),
            halt_budget,
            halts: 0,
            registration: None,
            status: None,
        }
    }

    /// Halts observed so far.
    #[inline]
    pub fn halts(&self) -> u8 {
        self.halts
    }

    /// The recovered guest status, once the session has terminated.
    #[inline]
    pub fn guest_status(&self) -> Option<GuestStatus> {
        self.status
    }

    /// The active split registration, if any.
    #[inline]
    pub fn registration(&self) -> Option<&SplitRegistration> {
        self.registration.as_ref()
    }

    fn arm<M: KernelMemory, H: VmxFacility>(
        &mut self,
        plan: InterceptPlan,
        ept: &mut ExtendedPageTable,
        mem: &mut M,
        hw: &mut H,
    ) -> Result<(), VmmError> {
        let target_pa = mem
            .va_to_pa(plan.target)
            .ok_or(VmmError::UnmappedGuestAddress(plan.target))?
            .page_base();
        let hook_pa = mem
            .va_to_pa(plan.hook)
            .ok_or(VmmError::UnmappedGuestAddress(plan.hook))?
            .page_base();

        // Running inside the exit handler: conversions must come from the
        // cached pool.
        let entry = ept.resolve_leaf(mem, hw, target_pa, AllocationContext::InterruptContext)?;

        match plan.strategy {
            InterceptStrategy::ExecSplit => {
                let original = entry.read();
                self.registration = Some(SplitRegistration {
                    target_base: target_pa,
                    swap_base: hook_pa,
                    entry,
                    original,
                });
                // Revoking execute access is what prompts the violation
                // exits the split feeds on.
                let mut updated = original;
                updated.set_permissions(original.permissions() - EptPermission::EXECUTE);
                entry.write(updated);
                ept.invalidate(hw, InveptScope::AllContexts)?;
                log::info!("initiated splitting of the guest target page at {}", target_pa);
            }
            InterceptStrategy::HookRedirect => {
                let mut updated = entry.read();
                updated.set_page_base(hook_pa)?;
                entry.write(updated);
                ept.invalidate(hw, InveptScope::AllContexts)?;
                log::info!(
                    "redirected the guest target page {} onto the hook page {}",
                    target_pa,
                    hook_pa
                );
            }
        }
        Ok(())
    }

    fn on_halt<M: KernelMemory, H: VmxFacility>(
        &mut self,
        ept: &mut ExtendedPageTable,
        mem: &mut M,
        hw: &mut H,
    ) -> Result<ExitDisposition, VmmError> {
        if self.halts == 0 {
            if let Some(plan) = self.plan {
                self.arm(plan, ept, mem, hw)?;
            }
        }
        self.halts += 1;

        let rip = hw.vmread(Field::GuestRip)?;
        log::info!(
            "caught VM-exit from a guest HLT ({} of {}); guest rip = 0x{:x}",
            self.halts,
            self.halt_budget,
            rip
        );

        // The hardware does not advance the guest past the halting
        // instruction on its own.
        let len = hw.vmread(Field::ExitInstructionLength)?;
        hw.vmwrite(Field::GuestRip, rip + len)?;

        if self.halts >= self.halt_budget {
            if self.plan.is_some() {
                let rsp = hw.vmread(Field::GuestRsp)? as usize;
                // SAFETY: the guest stack is a live kernel allocation and the
                // status slot lies within it.
                let byte = unsafe { ((rsp + GUEST_STATUS_STACK_OFFSET) as *const u8).read_volatile() };
                let status = GuestStatus::from_byte(byte);
                match status {
                    GuestStatus::Hooked => {
                        log::info!("execution of the hook function in place of the target succeeded")
                    }
                    GuestStatus::NotHooked => log::warn!("guest target function was not hooked"),
                    GuestStatus::Aborted => {
                        log::warn!("guest detected the modification and aborted execution")
                    }
                    GuestStatus::Unknown(b) => {
                        log::warn!("guest reported an unrecognized status byte 0x{:02x}", b)
                    }
                }
                self.status = Some(status);
            }
            log::info!("finished guest execution after {} halts", self.halts);
            return Ok(ExitDisposition::Shutdown);
        }
        Ok(ExitDisposition::Resume)
    }

    fn on_violation<M: KernelMemory, H: VmxFacility>(
        &mut self,
        ept: &mut ExtendedPageTable,
        hw: &mut H,
        _mem: &mut M,
    ) -> Result<ExitDisposition, VmmError> {
        let qualification =
            EptViolationQualification::from_bits_truncate(hw.vmread(Field::ExitQualification)?);
        let gpa = hw.vmread(Field::GuestPhysicalAddr)?;
        let linear = hw.vmread(Field::GuestLinearAddr)?;

        let reg = match self.registration.as_ref() {
            Some(reg) if Pa::new(gpa as usize).map(Pa::page_base) == Some(reg.target_base) => reg,
            // No registered interception covers this address; resuming
            // without resolving the access would fault forever.
            _ => {
                log::error!(
                    "unhandled EPT violation at guest-physical 0x{:x} (linear 0x{:x}, {:?})",
                    gpa,
                    linear,
                    qualification
                );
                return Err(VmmError::UnhandledEptViolation { gpa, linear });
            }
        };

        let ty = reg.original.mem_type().unwrap_or(MemoryType::WriteBack);
        let mut entry = reg.entry.read();
        if qualification.is_data_access() {
            // Serve data accesses from the real page.
            let perm = entry.permissions() | EptPermission::READ | EptPermission::WRITE;
            entry.set_page(reg.target_base, ty, perm)?;
            log::debug!("split: mapped the original page back in for a data access");
        } else if qualification.is_instruction_fetch() {
            // Serve instruction fetches from the swap page, execute-only.
            entry.set_page(reg.swap_base, ty, EptPermission::EXECUTE)?;
            log::debug!("split: mapped the swap page in for an instruction fetch");
        } else {
            return Err(VmmError::UnhandledEptViolation { gpa, linear });
        }
        reg.entry.write(entry);

        // The rewritten translation may be cached.
        ept.invalidate(hw, InveptScope::AllContexts)?;

        // The guest retries the faulting access; the instruction pointer is
        // deliberately not advanced.
        Ok(ExitDisposition::Resume)
    }
}

impl VmexitController for InterceptDispatcher {
    fn handle<M: KernelMemory, H: VmxFacility>(
        &mut self,
        reason: ExitReason,
        ept: &mut ExtendedPageTable,
        mem: &mut M,
        hw: &mut H,
    ) -> Result<ExitDisposition, VmmError> {
        match reason.basic() {
            BasicExitReason::EptViolation => self.on_violation(ept, hw, mem),
            BasicExitReason::EptMisconfiguration => {
                // A misconfiguration means this monitor wrote a bad paging
                // entry; there is no recovery policy.
                let gpa = hw.vmread(Field::GuestPhysicalAddr)?;
                log::error!("EPT misconfiguration at guest-physical 0x{:x}", gpa);
                Err(VmmError::EptMisconfiguration { gpa })
            }
            BasicExitReason::Hlt => self.on_halt(ept, mem, hw),
            _ => {
                let rip = hw.vmread(Field::GuestRip).unwrap_or(0);
                log::error!("unhandled VM-exit {:?}; guest rip = 0x{:x}", reason, rip);
                Err(VmmError::UnhandledVmexit(reason))
            }
        }
    }

    fn report(&self) -> SessionReport {
        SessionReport {
            halts: self.halts,
            guest_status: self.status,
        }
    }
}
