//! VM control structure configuration.
//!
//! One write routine per structure section. Guest and host state are taken
//! from the privileged snapshot captured at prepare time; control words
//! start from zero, set the monitor's policy bits, and are then fixed
//! against the hardware's reported allowed/required settings before being
//! written.

use crate::{
    addressing::{Pa, Va},
    ept::Eptp,
    platform::{PrivilegedSnapshot, SegmentSnapshot},
    vm_control::{
        fix_control_bits, EntryControls, ExitControls, PinControls, PrimaryControls,
        SecondaryControls, IA32_VMX_ENTRY_CTLS, IA32_VMX_EXIT_CTLS, IA32_VMX_PINBASED_CTLS,
        IA32_VMX_PROCBASED_CTLS, IA32_VMX_PROCBASED_CTLS2, IA32_VMX_TRUE_ENTRY_CTLS,
        IA32_VMX_TRUE_EXIT_CTLS, IA32_VMX_TRUE_PINBASED_CTLS, IA32_VMX_TRUE_PROCBASED_CTLS,
    },
    vmcs::Field,
    vmx::VmxFacility,
    VmmError,
};

// Host selector fields must carry a zero RPL and TI flag.
const SELECTOR_INDEX_MASK: u16 = !0x7;

struct SegmentFields {
    selector: Field,
    base: Field,
    limit: Field,
    access_rights: Field,
}

fn write_segment<H: VmxFacility>(
    hw: &mut H,
    fields: SegmentFields,
    seg: &SegmentSnapshot,
) -> Result<(), VmmError> {
    hw.vmwrite(fields.selector, seg.selector as u64)?;
    hw.vmwrite(fields.base, seg.base)?;
    hw.vmwrite(fields.limit, seg.limit as u64)?;
    hw.vmwrite(fields.access_rights, seg.access_rights as u64)?;
    Ok(())
}

/// Populate the guest-state area.
///
/// The guest starts out as a continuation of the host's execution
/// environment, with only its stack and entry point substituted. The stack
/// must be 16-byte aligned; passing one that is not is a programming error.
pub fn write_guest_state<H: VmxFacility>(
    hw: &mut H,
    snap: &PrivilegedSnapshot,
    guest_rsp: Va,
    guest_rip: Va,
) -> Result<(), VmmError> {
    assert!(unsafe { guest_rsp.into_usize() } % 16 == 0);

    hw.vmwrite(Field::GuestCr0, snap.cr0)?;
    hw.vmwrite(Field::GuestCr3, snap.cr3)?;
    hw.vmwrite(Field::GuestCr4, snap.cr4)?;
    hw.vmwrite(Field::GuestDr7, snap.dr7)?;

    hw.vmwrite(Field::GuestRsp, unsafe { guest_rsp.into_usize() } as u64)?;
    hw.vmwrite(Field::GuestRip, unsafe { guest_rip.into_usize() } as u64)?;
    hw.vmwrite(Field::GuestRflags, snap.rflags)?;

    let segments = [
        (
            SegmentFields {
                selector: Field::GuestCsSelector,
                base: Field::GuestCsBase,
                limit: Field::GuestCsLimit,
                access_rights: Field::GuestCsAccessRights,
            },
            &snap.cs,
        ),
        (
            SegmentFields {
                selector: Field::GuestSsSelector,
                base: Field::GuestSsBase,
                limit: Field::GuestSsLimit,
                access_rights: Field::GuestSsAccessRights,
            },
            &snap.ss,
        ),
        (
            SegmentFields {
                selector: Field::GuestDsSelector,
                base: Field::GuestDsBase,
                limit: Field::GuestDsLimit,
                access_rights: Field::GuestDsAccessRights,
            },
            &snap.ds,
        ),
        (
            SegmentFields {
                selector: Field::GuestEsSelector,
                base: Field::GuestEsBase,
                limit: Field::GuestEsLimit,
                access_rights: Field::GuestEsAccessRights,
            },
            &snap.es,
        ),
        (
            SegmentFields {
                selector: Field::GuestFsSelector,
                base: Field::GuestFsBase,
                limit: Field::GuestFsLimit,
                access_rights: Field::GuestFsAccessRights,
            },
            &snap.fs,
        ),
        (
            SegmentFields {
                selector: Field::GuestGsSelector,
                base: Field::GuestGsBase,
                limit: Field::GuestGsLimit,
                access_rights: Field::GuestGsAccessRights,
            },
            &snap.gs,
        ),
        (
            SegmentFields {
                selector: Field::GuestLdtrSelector,
                base: Field::GuestLdtrBase,
                limit: Field::GuestLdtrLimit,
                access_rights: Field::GuestLdtrAccessRights,
            },
            &snap.ldtr,
        ),
        (
            SegmentFields {
                selector: Field::GuestTrSelector,
                base: Field::GuestTrBase,
                limit: Field::GuestTrLimit,
                access_rights: Field::GuestTrAccessRights,
            },
            &snap.tr,
        ),
    ];
    for (fields, seg) in segments {
        write_segment(hw, fields, seg)?;
    }

    hw.vmwrite(Field::GuestGdtrBase, snap.gdtr_base)?;
    hw.vmwrite(Field::GuestGdtrLimit, snap.gdtr_limit as u64)?;
    hw.vmwrite(Field::GuestIdtrBase, snap.idtr_base)?;
    hw.vmwrite(Field::GuestIdtrLimit, snap.idtr_limit as u64)?;

    hw.vmwrite(Field::GuestIa32Debugctl, snap.debugctl)?;
    hw.vmwrite(Field::GuestIa32SysenterCs, snap.sysenter_cs)?;
    hw.vmwrite(Field::GuestIa32SysenterEsp, snap.sysenter_esp)?;
    hw.vmwrite(Field::GuestIa32SysenterEip, snap.sysenter_eip)?;

    Ok(())
}

/// Populate the host-state area: the values the hardware reloads on every
/// VM exit.
pub fn write_host_state<H: VmxFacility>(
    hw: &mut H,
    snap: &PrivilegedSnapshot,
    host_rsp: Va,
    host_rip: Va,
) -> Result<(), VmmError> {
    assert!(unsafe { host_rsp.into_usize() } % 16 == 0);

    hw.vmwrite(Field::HostCr0, snap.cr0)?;
    hw.vmwrite(Field::HostCr3, snap.cr3)?;
    hw.vmwrite(Field::HostCr4, snap.cr4)?;

    hw.vmwrite(Field::HostRsp, unsafe { host_rsp.into_usize() } as u64)?;
    hw.vmwrite(Field::HostRip, unsafe { host_rip.into_usize() } as u64)?;

    hw.vmwrite(
        Field::HostCsSelector,
        (snap.cs.selector & SELECTOR_INDEX_MASK) as u64,
    )?;
    hw.vmwrite(
        Field::HostSsSelector,
        (snap.ss.selector & SELECTOR_INDEX_MASK) as u64,
    )?;
    hw.vmwrite(
        Field::HostDsSelector,
        (snap.ds.selector & SELECTOR_INDEX_MASK) as u64,
    )?;
    hw.vmwrite(
        Field::HostEsSelector,
        (snap.es.selector & SELECTOR_INDEX_MASK) as u64,
    )?;
    hw.vmwrite(
        Field::HostFsSelector,
        (snap.fs.selector & SELECTOR_INDEX_MASK) as u64,
    )?;
    hw.vmwrite(
        Field::HostGsSelector,
        (snap.gs.selector & SELECTOR_INDEX_MASK) as u64,
    )?;
    hw.vmwrite(
        Field::HostTrSelector,
        (snap.tr.selector & SELECTOR_INDEX_MASK) as u64,
    )?;

    hw.vmwrite(Field::HostFsBase, snap.fs_base)?;
    hw.vmwrite(Field::HostGsBase, snap.gs_base)?;
    hw.vmwrite(Field::HostTrBase, snap.tr.base)?;
    hw.vmwrite(Field::HostGdtrBase, snap.gdtr_base)?;
    hw.vmwrite(Field::HostIdtrBase, snap.idtr_base)?;

    hw.vmwrite(Field::HostIa32SysenterCs, snap.sysenter_cs)?;
    hw.vmwrite(Field::HostIa32SysenterEsp, snap.sysenter_esp)?;
    hw.vmwrite(Field::HostIa32SysenterEip, snap.sysenter_eip)?;

    Ok(())
}

/// Pin-based execution controls: no policy bits of our own, only the
/// hardware-required settings.
pub fn write_pin_based_controls<H: VmxFacility>(hw: &mut H) -> Result<(), VmmError> {
    let fixed = fix_control_bits(
        hw,
        PinControls::empty().bits(),
        IA32_VMX_PINBASED_CTLS,
        IA32_VMX_TRUE_PINBASED_CTLS,
    );
    hw.vmwrite(Field::PinBasedControls, fixed as u64)?;
    Ok(())
}

/// Primary processor controls: exit on HLT, consult the MSR bitmap, and
/// activate the secondary controls.
pub fn write_primary_controls<H: VmxFacility>(hw: &mut H) -> Result<(), VmmError> {
    let policy = PrimaryControls::HLT_EXITING
        | PrimaryControls::USE_MSR_BITMAPS
        | PrimaryControls::ACTIVATE_SECONDARY_CONTROLS;
    let fixed = fix_control_bits(
        hw,
        policy.bits(),
        IA32_VMX_PROCBASED_CTLS,
        IA32_VMX_TRUE_PROCBASED_CTLS,
    );
    hw.vmwrite(Field::PrimaryProcessorControls, fixed as u64)?;
    Ok(())
}

/// Secondary processor controls: enable the extended page tables. There is
/// no "true" capability MSR for this word.
pub fn write_secondary_controls<H: VmxFacility>(hw: &mut H) -> Result<(), VmmError> {
    let policy = SecondaryControls::ENABLE_EPT;
    let fixed = fix_control_bits(hw, policy.bits(), IA32_VMX_PROCBASED_CTLS2, 0);
    hw.vmwrite(Field::SecondaryProcessorControls, fixed as u64)?;
    Ok(())
}

/// VM-exit controls: return to 64-bit mode on every exit.
pub fn write_exit_controls<H: VmxFacility>(hw: &mut H) -> Result<(), VmmError> {
    let policy = ExitControls::HOST_ADDRESS_SPACE_SIZE;
    let fixed = fix_control_bits(hw, policy.bits(), IA32_VMX_EXIT_CTLS, IA32_VMX_TRUE_EXIT_CTLS);
    hw.vmwrite(Field::ExitControls, fixed as u64)?;
    Ok(())
}

/// VM-entry controls: enter the guest in IA-32e mode.
pub fn write_entry_controls<H: VmxFacility>(hw: &mut H) -> Result<(), VmmError> {
    let policy = EntryControls::IA32E_MODE_GUEST;
    let fixed = fix_control_bits(
        hw,
        policy.bits(),
        IA32_VMX_ENTRY_CTLS,
        IA32_VMX_TRUE_ENTRY_CTLS,
    );
    hw.vmwrite(Field::EntryControls, fixed as u64)?;
    Ok(())
}

/// Point the control structure at the event-interception bitmap. A zeroed
/// bitmap means no MSR access exits.
pub fn write_msr_bitmap<H: VmxFacility>(hw: &mut H, bitmap: Pa) -> Result<(), VmmError> {
    hw.vmwrite(Field::MsrBitmaps, unsafe { bitmap.into_usize() } as u64)?;
    Ok(())
}

/// Install the translation root.
pub fn write_ept_pointer<H: VmxFacility>(hw: &mut H, eptp: Eptp) -> Result<(), VmmError> {
    hw.vmwrite(Field::EptPointer, eptp.value())?;
    Ok(())
}

/// The link pointer must read all-ones when the shadow VMCS is unused.
pub fn write_link_pointer<H: VmxFacility>(hw: &mut H) -> Result<(), VmmError> {
    hw.vmwrite(Field::GuestLinkPointer, u64::MAX)?;
    Ok(())
}
