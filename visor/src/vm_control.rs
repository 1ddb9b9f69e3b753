//! VMX capability MSRs and control-field bit definitions.

use crate::vmx::Msrs;

// VMX capability MSRs.
/// MSR - IA32_FEATURE_CONTROL.
pub const IA32_FEATURE_CONTROL: u32 = 0x03A;
/// MSR - IA32_VMX_BASIC.
pub const IA32_VMX_BASIC: u32 = 0x480;
/// MSR - IA32_VMX_PINBASED_CTLS.
pub const IA32_VMX_PINBASED_CTLS: u32 = 0x481;
/// MSR - IA32_VMX_PROCBASED_CTLS.
pub const IA32_VMX_PROCBASED_CTLS: u32 = 0x482;
/// MSR - IA32_VMX_EXIT_CTLS.
pub const IA32_VMX_EXIT_CTLS: u32 = 0x483;
/// MSR - IA32_VMX_ENTRY_CTLS.
pub const IA32_VMX_ENTRY_CTLS: u32 = 0x484;
/// MSR - IA32_VMX_CR0_FIXED0.
pub const IA32_VMX_CR0_FIXED0: u32 = 0x486;
/// MSR - IA32_VMX_CR0_FIXED1.
pub const IA32_VMX_CR0_FIXED1: u32 = 0x487;
/// MSR - IA32_VMX_CR4_FIXED0.
pub const IA32_VMX_CR4_FIXED0: u32 = 0x488;
/// MSR - IA32_VMX_CR4_FIXED1.
pub const IA32_VMX_CR4_FIXED1: u32 = 0x489;
/// MSR - IA32_VMX_PROCBASED_CTLS2.
pub const IA32_VMX_PROCBASED_CTLS2: u32 = 0x48B;
/// MSR - IA32_VMX_EPT_VPID_CAP.
pub const IA32_VMX_EPT_VPID_CAP: u32 = 0x48C;
/// MSR - IA32_VMX_TRUE_PINBASED_CTLS.
pub const IA32_VMX_TRUE_PINBASED_CTLS: u32 = 0x48D;
/// MSR - IA32_VMX_TRUE_PROCBASED_CTLS.
pub const IA32_VMX_TRUE_PROCBASED_CTLS: u32 = 0x48E;
/// MSR - IA32_VMX_TRUE_EXIT_CTLS.
pub const IA32_VMX_TRUE_EXIT_CTLS: u32 = 0x48F;
/// MSR - IA32_VMX_TRUE_ENTRY_CTLS.
pub const IA32_VMX_TRUE_ENTRY_CTLS: u32 = 0x490;

/// IA32_VMX_BASIC bit 55: the "true" control MSRs are implemented.
pub const VMX_BASIC_TRUE_CONTROLS: u64 = 1 << 55;

/// Extract the VMCS revision identifier from IA32_VMX_BASIC.
#[inline]
pub fn revision_id(vmx_basic: u64) -> u32 {
    vmx_basic as u32 & 0x7fff_ffff
}

bitflags::bitflags! {
    /// IA32_FEATURE_CONTROL bits relevant to entering VMX operation.
    pub struct FeatureControl: u64 {
        /// The MSR is locked; writes after lock fault.
        const LOCK = 1 << 0;
        /// VMXON permitted inside SMX operation.
        const VMX_INSIDE_SMX = 1 << 1;
        /// VMXON permitted outside SMX operation.
        const VMX_OUTSIDE_SMX = 1 << 2;
    }
}

bitflags::bitflags! {
    /// IA32_VMX_EPT_VPID_CAP: EPT and INVEPT capability reporting.
    pub struct EptVpidCap: u64 {
        /// Execute-only translations supported.
        const EXECUTE_ONLY = 1 << 0;
        /// A page-walk length of 4 is supported.
        const PAGE_WALK_LENGTH_4 = 1 << 6;
        /// EPT paging structures may be uncacheable.
        const MEMORY_TYPE_UC = 1 << 8;
        /// EPT paging structures may be write-back.
        const MEMORY_TYPE_WB = 1 << 14;
        /// 2MB large pages supported at the middle level.
        const PDE_2MB = 1 << 16;
        /// 1GB large pages supported at the upper-middle level.
        const PDPTE_1GB = 1 << 17;
        /// The INVEPT instruction is supported.
        const INVEPT = 1 << 20;
        /// Accessed and dirty flags for EPT.
        const ACCESSED_DIRTY = 1 << 21;
        /// Single-context INVEPT type supported.
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        /// All-context INVEPT type supported.
        const INVEPT_ALL_CONTEXT = 1 << 26;
    }
}

bitflags::bitflags! {
    /// Pin-based VM-execution controls.
    pub struct PinControls: u32 {
        /// External interrupts cause VM exits.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// Non-maskable interrupts cause VM exits.
        const NMI_EXITING = 1 << 3;
        /// NMIs are never blocked; virtual-NMI blocking is tracked instead.
        const VIRTUAL_NMIS = 1 << 5;
        /// The VMX-preemption timer counts down in non-root operation.
        const PREEMPTION_TIMER = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls.
    pub struct PrimaryControls: u32 {
        /// Exit at the start of any instruction once interrupts are open.
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        /// Executions of HLT cause VM exits.
        const HLT_EXITING = 1 << 7;
        /// Executions of INVLPG cause VM exits.
        const INVLPG_EXITING = 1 << 9;
        /// Executions of MWAIT cause VM exits.
        const MWAIT_EXITING = 1 << 10;
        /// Executions of RDPMC cause VM exits.
        const RDPMC_EXITING = 1 << 11;
        /// Executions of RDTSC/RDTSCP cause VM exits.
        const RDTSC_EXITING = 1 << 12;
        /// MOV to CR3 causes VM exits.
        const CR3_LOAD_EXITING = 1 << 15;
        /// MOV from CR3 causes VM exits.
        const CR3_STORE_EXITING = 1 << 16;
        /// MOV DR causes VM exits.
        const MOV_DR_EXITING = 1 << 23;
        /// I/O instructions unconditionally cause VM exits.
        const UNCONDITIONAL_IO_EXITING = 1 << 24;
        /// I/O bitmaps restrict which ports exit.
        const USE_IO_BITMAPS = 1 << 25;
        /// The monitor trap flag debugging feature is enabled.
        const MONITOR_TRAP_FLAG = 1 << 27;
        /// The MSR bitmap governs RDMSR/WRMSR exiting; without it every MSR
        /// access exits.
        const USE_MSR_BITMAPS = 1 << 28;
        /// Executions of MONITOR cause VM exits.
        const MONITOR_EXITING = 1 << 29;
        /// Executions of PAUSE cause VM exits.
        const PAUSE_EXITING = 1 << 30;
        /// The secondary processor-based controls are consulted.
        const ACTIVATE_SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Secondary processor-based VM-execution controls.
    pub struct SecondaryControls: u32 {
        /// Accesses to the APIC-access page are treated specially.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// Extended page tables are enabled.
        const ENABLE_EPT = 1 << 1;
        /// Descriptor-table instructions cause VM exits.
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// RDTSCP does not fault with #UD.
        const ENABLE_RDTSCP = 1 << 3;
        /// Cached linear translations are tagged with a VPID.
        const ENABLE_VPID = 1 << 5;
        /// WBINVD causes VM exits.
        const WBINVD_EXITING = 1 << 6;
        /// The guest may run unpaged or in real-address mode.
        const UNRESTRICTED_GUEST = 1 << 7;
        /// INVPCID does not fault with #UD.
        const ENABLE_INVPCID = 1 << 12;
        /// XSAVES/XRSTORS do not fault with #UD.
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
    }
}

bitflags::bitflags! {
    /// Primary VM-exit controls.
    pub struct ExitControls: u32 {
        /// DR7 and IA32_DEBUGCTL are saved on exit.
        const SAVE_DEBUG_CONTROLS = 1 << 2;
        /// The processor is in 64-bit mode after the exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// External-interrupt exits acknowledge the interrupt controller.
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
        /// IA32_PAT is saved on exit.
        const SAVE_IA32_PAT = 1 << 18;
        /// IA32_PAT is loaded on exit.
        const LOAD_IA32_PAT = 1 << 19;
        /// IA32_EFER is saved on exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// IA32_EFER is loaded on exit.
        const LOAD_IA32_EFER = 1 << 21;
    }
}

bitflags::bitflags! {
    /// VM-entry controls.
    pub struct EntryControls: u32 {
        /// DR7 and IA32_DEBUGCTL are loaded on entry.
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        /// The logical processor is in IA-32e mode after entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// Entry goes to system-management mode.
        const ENTRY_TO_SMM = 1 << 10;
        /// IA32_PAT is loaded on entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// IA32_EFER is loaded on entry.
        const LOAD_IA32_EFER = 1 << 15;
    }
}

/// Force a candidate control value into the hardware's accepted range.
///
/// The capability MSR reports allowed-1 settings in its high half and
/// required-1 settings in its low half; masking with the former and OR-ing
/// the latter yields a value the processor will accept no matter which bits
/// the caller left unset.
#[inline]
pub fn apply_fixed_bits(candidate: u32, capability: u64) -> u32 {
    let allowed1 = (capability >> 32) as u32;
    let required1 = capability as u32;
    (candidate & allowed1) | required1
}

/// Fix a control value against the proper capability MSR.
///
/// When IA32_VMX_BASIC advertises the "true" control MSRs, those report the
/// accurate required-1 bits and are preferred; the secondary processor
/// controls have no true variant (pass `0` for `true_msr`).
pub fn fix_control_bits<M: Msrs>(hw: &M, candidate: u32, standard_msr: u32, true_msr: u32) -> u32 {
    let basic = hw.rdmsr(IA32_VMX_BASIC);
    let capability = if basic & VMX_BASIC_TRUE_CONTROLS != 0 && true_msr != 0 {
        hw.rdmsr(true_msr)
    } else {
        hw.rdmsr(standard_msr)
    };
    apply_fixed_bits(candidate, capability)
}

/// Force a control-register value into the range allowed in VMX operation.
///
/// If a bit is set in FIXED0 it must be 1; if a bit is clear in FIXED1 it
/// must be 0.
#[inline]
pub fn apply_cr_fixed_bits(candidate: u64, fixed0: u64, fixed1: u64) -> u64 {
    (candidate & fixed1) | fixed0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct MsrFile(BTreeMap<u32, u64>);
    impl Msrs for MsrFile {
        fn rdmsr(&self, msr: u32) -> u64 {
            *self.0.get(&msr).unwrap_or(&0)
        }
    }

    #[test]
    fn fixed_bits_hold_for_arbitrary_mask_pairs() {
        // (candidate, required-1, allowed-1); hardware guarantees the
        // required bits are a subset of the allowed bits.
        let cases: &[(u32, u32, u32)] = &[
            (0, 0x16, 0xffff_ffff),
            (0xffff_ffff, 0x0401_e172, 0xfff9_fffe | 0x0401_e172),
            (0x8000_0082, 0x11ff, 0x0003_ffff | 0x11ff),
            (0x0000_0002, 0x0003_6dff, 0x01ff_ffff | 0x0003_6dff),
        ];
        for &(candidate, required1, allowed1) in cases {
            let cap = ((allowed1 as u64) << 32) | required1 as u64;
            let fixed = apply_fixed_bits(candidate, cap);
            assert_eq!(fixed & !allowed1, 0);
            assert_eq!(fixed & required1, required1);
        }
    }

    #[test]
    fn true_controls_selected_when_advertised() {
        let mut msrs = BTreeMap::new();
        msrs.insert(IA32_VMX_BASIC, VMX_BASIC_TRUE_CONTROLS);
        msrs.insert(IA32_VMX_PINBASED_CTLS, 0xffff_ffff_0000_00ff);
        msrs.insert(IA32_VMX_TRUE_PINBASED_CTLS, 0xffff_ffff_0000_0016);
        let hw = MsrFile(msrs);

        let fixed = fix_control_bits(&hw, 0, IA32_VMX_PINBASED_CTLS, IA32_VMX_TRUE_PINBASED_CTLS);
        assert_eq!(fixed, 0x16);

        // Without the basic bit, the standard MSR governs.
        let mut msrs = BTreeMap::new();
        msrs.insert(IA32_VMX_PINBASED_CTLS, 0xffff_ffff_0000_00ff);
        msrs.insert(IA32_VMX_TRUE_PINBASED_CTLS, 0xffff_ffff_0000_0016);
        let hw = MsrFile(msrs);
        let fixed = fix_control_bits(&hw, 0, IA32_VMX_PINBASED_CTLS, IA32_VMX_TRUE_PINBASED_CTLS);
        assert_eq!(fixed, 0xff);
    }

    #[test]
    fn cr_fixed_bits() {
        let fixed0 = 0x8005_0021;
        let fixed1 = 0xffff_ffff;
        let v = apply_cr_fixed_bits(0x13, fixed0, fixed1);
        assert_eq!(v & fixed0, fixed0);
        // Bits cleared in FIXED1 are forced to zero.
        let v = apply_cr_fixed_bits(0xffff_ffff, 0, 0x0000_2000);
        assert_eq!(v, 0x2000);
    }

    #[test]
    fn revision_id_masks_shadow_indicator() {
        assert_eq!(revision_id(0x8000_0012_0000_0000 | 0x8000_0004), 0x4);
    }
}
