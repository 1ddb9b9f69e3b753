//! VMCS field encodings, VM-instruction errors, and exit-reason decoding.
//!
//! The field identifiers are fixed 16-bit constants defined by the
//! architecture and must match the hardware bit-for-bit.

bitflags::bitflags! {
    /// Exit qualification for EPT violations.
    pub struct EptViolationQualification: u64 {
        /// The access was a data read.
        const DATA_READ = 1 << 0;
        /// The access was a data write.
        const DATA_WRITE = 1 << 1;
        /// The access was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 2;
        /// The guest-physical address was readable.
        const WAS_READABLE = 1 << 3;
        /// The guest-physical address was writable.
        const WAS_WRITABLE = 1 << 4;
        /// The guest-physical address was executable.
        const WAS_EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const LINEAR_ADDRESS_VALID = 1 << 7;
        /// The access was to the translation of a linear address, not to a
        /// paging-structure entry.
        const TRANSLATED_ACCESS = 1 << 8;
    }
}

impl EptViolationQualification {
    /// The violation came from a data read or write.
    #[inline]
    pub fn is_data_access(&self) -> bool {
        self.intersects(Self::DATA_READ | Self::DATA_WRITE)
    }

    /// The violation came from an instruction fetch.
    #[inline]
    pub fn is_instruction_fetch(&self) -> bool {
        self.contains(Self::INSTRUCTION_FETCH)
    }
}

/// VMCS field encodings.
///
/// Grouped by width and then by control/read-only/guest/host area, the way
/// the encodings are laid out architecturally.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    // 16-bit guest and host state.
    GuestEsSelector = 0x0000_0800,
    GuestCsSelector = 0x0000_0802,
    GuestSsSelector = 0x0000_0804,
    GuestDsSelector = 0x0000_0806,
    GuestFsSelector = 0x0000_0808,
    GuestGsSelector = 0x0000_080A,
    GuestLdtrSelector = 0x0000_080C,
    GuestTrSelector = 0x0000_080E,
    HostEsSelector = 0x0000_0C00,
    HostCsSelector = 0x0000_0C02,
    HostSsSelector = 0x0000_0C04,
    HostDsSelector = 0x0000_0C06,
    HostFsSelector = 0x0000_0C08,
    HostGsSelector = 0x0000_0C0A,
    HostTrSelector = 0x0000_0C0C,
    // 64-bit control fields.
    IoBitmapA = 0x0000_2000,
    IoBitmapB = 0x0000_2002,
    MsrBitmaps = 0x0000_2004,
    TscOffset = 0x0000_2010,
    EptPointer = 0x0000_201A,
    // 64-bit read-only data.
    GuestPhysicalAddr = 0x0000_2400,
    // 64-bit guest state.
    GuestLinkPointer = 0x0000_2800,
    GuestLinkPointerHi = 0x0000_2801,
    GuestIa32Debugctl = 0x0000_2802,
    GuestIa32Pat = 0x0000_2804,
    GuestIa32Efer = 0x0000_2806,
    // 64-bit host state.
    HostIa32Pat = 0x0000_2C00,
    HostIa32Efer = 0x0000_2C02,
    // 32-bit control fields.
    PinBasedControls = 0x0000_4000,
    PrimaryProcessorControls = 0x0000_4002,
    ExceptionBitmap = 0x0000_4004,
    PageFaultErrCodeMask = 0x0000_4006,
    PageFaultErrCodeMatch = 0x0000_4008,
    Cr3TargetCount = 0x0000_400A,
    ExitControls = 0x0000_400C,
    ExitMsrStoreCount = 0x0000_400E,
    ExitMsrLoadCount = 0x0000_4010,
    EntryControls = 0x0000_4012,
    EntryMsrLoadCount = 0x0000_4014,
    EntryInterruptionInfo = 0x0000_4016,
    EntryExceptionErrCode = 0x0000_4018,
    EntryInstructionLength = 0x0000_401A,
    SecondaryProcessorControls = 0x0000_401E,
    // 32-bit read-only data.
    InstructionError = 0x0000_4400,
    ExitReason = 0x0000_4402,
    ExitInterruptionInfo = 0x0000_4404,
    ExitInterruptionErrCode = 0x0000_4406,
    IdtVectoringInfo = 0x0000_4408,
    IdtVectoringErrCode = 0x0000_440A,
    ExitInstructionLength = 0x0000_440C,
    ExitInstructionInfo = 0x0000_440E,
    // 32-bit guest state.
    GuestEsLimit = 0x0000_4800,
    GuestCsLimit = 0x0000_4802,
    GuestSsLimit = 0x0000_4804,
    GuestDsLimit = 0x0000_4806,
    GuestFsLimit = 0x0000_4808,
    GuestGsLimit = 0x0000_480A,
    GuestLdtrLimit = 0x0000_480C,
    GuestTrLimit = 0x0000_480E,
    GuestGdtrLimit = 0x0000_4810,
    GuestIdtrLimit = 0x0000_4812,
    GuestEsAccessRights = 0x0000_4814,
    GuestCsAccessRights = 0x0000_4816,
    GuestSsAccessRights = 0x0000_4818,
    GuestDsAccessRights = 0x0000_481A,
    GuestFsAccessRights = 0x0000_481C,
    GuestGsAccessRights = 0x0000_481E,
    GuestLdtrAccessRights = 0x0000_4820,
    GuestTrAccessRights = 0x0000_4822,
    GuestInterruptibilityState = 0x0000_4824,
    GuestActivityState = 0x0000_4826,
    GuestIa32SysenterCs = 0x0000_482A,
    // 32-bit host state.
    HostIa32SysenterCs = 0x0000_4C00,
    // Natural-width read-only data.
    ExitQualification = 0x0000_6400,
    GuestLinearAddr = 0x0000_640A,
    // Natural-width guest state.
    GuestCr0 = 0x0000_6800,
    GuestCr3 = 0x0000_6802,
    GuestCr4 = 0x0000_6804,
    GuestEsBase = 0x0000_6806,
    GuestCsBase = 0x0000_6808,
    GuestSsBase = 0x0000_680A,
    GuestDsBase = 0x0000_680C,
    GuestFsBase = 0x0000_680E,
    GuestGsBase = 0x0000_6810,
    GuestLdtrBase = 0x0000_6812,
    GuestTrBase = 0x0000_6814,
    GuestGdtrBase = 0x0000_6816,
    GuestIdtrBase = 0x0000_6818,
    GuestDr7 = 0x0000_681A,
    GuestRsp = 0x0000_681C,
    GuestRip = 0x0000_681E,
    GuestRflags = 0x0000_6820,
    GuestIa32SysenterEsp = 0x0000_6824,
    GuestIa32SysenterEip = 0x0000_6826,
    // Natural-width host state.
    HostCr0 = 0x0000_6C00,
    HostCr3 = 0x0000_6C02,
    HostCr4 = 0x0000_6C04,
    HostFsBase = 0x0000_6C06,
    HostGsBase = 0x0000_6C08,
    HostTrBase = 0x0000_6C0A,
    HostGdtrBase = 0x0000_6C0C,
    HostIdtrBase = 0x0000_6C0E,
    HostIa32SysenterEsp = 0x0000_6C10,
    HostIa32SysenterEip = 0x0000_6C12,
    HostRsp = 0x0000_6C14,
    HostRip = 0x0000_6C16,
}

/// VM-instruction error numbers, as read from the instruction-error field
/// after a VMX instruction fails with a valid current VMCS.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy)]
pub enum InstructionError {
    /// VMCALL executed in VMX root operation.
    VmcallInVmxRoot,
    /// VMCLEAR with an invalid physical address.
    VmclearWithInvalidAddress,
    /// VMCLEAR with the VMXON pointer.
    VmclearWithVmxonPointer,
    /// VMLAUNCH with a non-clear VMCS.
    VmlaunchWithNonClearVmcs,
    /// VMRESUME with a non-launched VMCS.
    VmresumeWithNonLaunchedVmcs,
    /// VMRESUME after VMXOFF.
    VmresumeAfterVmxoff,
    /// VM entry with invalid control fields.
    InvalidControlFields,
    /// VM entry with invalid host-state fields.
    InvalidHostState,
    /// VMPTRLD with an invalid physical address.
    VmptrldWithInvalidAddress,
    /// VMPTRLD with the VMXON pointer.
    VmptrldWithVmxonPointer,
    /// VMPTRLD with an incorrect VMCS revision identifier.
    VmptrldWithIncorrectRevisionId,
    /// VMREAD/VMWRITE to an unsupported VMCS component.
    UnsupportedVmcsField,
    /// VMWRITE to a read-only VMCS component.
    WriteToReadOnlyField,
    /// VMXON executed in VMX root operation.
    VmxonInVmxRoot,
    /// VM entry with an invalid executive-VMCS pointer.
    InvalidExecutiveVmcsPointer,
    /// VM entry with a non-launched executive VMCS.
    NonLaunchedExecutiveVmcs,
    /// VM entry with an executive-VMCS pointer that is not the VMXON pointer.
    ExecutiveVmcsNotVmxonPointer,
    /// VMCALL with a non-clear VMCS.
    VmcallWithNonClearVmcs,
    /// VMCALL with invalid VM-exit control fields.
    VmcallWithInvalidExitControls,
    /// VMCALL with an incorrect MSEG revision identifier.
    VmcallWithIncorrectMsegRevisionId,
    /// VMXOFF under the dual-monitor treatment of SMIs and SMM.
    VmxoffUnderDualMonitor,
    /// VMCALL with invalid SMM-monitor features.
    VmcallWithInvalidSmmFeatures,
    /// VM entry with invalid VM-execution controls in the executive VMCS.
    InvalidExecutiveVmExecControls,
    /// VM entry with events blocked by MOV SS.
    EntryWithEventsBlockedByMovSs,
    /// Invalid operand to INVEPT/INVVPID.
    InvalidInveptInvvpidOperand,
    /// An error number this table does not cover.
    Unknown,
}

impl InstructionError {
    /// Map a raw instruction-error number.
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => Self::VmcallInVmxRoot,
            2 => Self::VmclearWithInvalidAddress,
            3 => Self::VmclearWithVmxonPointer,
            4 => Self::VmlaunchWithNonClearVmcs,
            5 => Self::VmresumeWithNonLaunchedVmcs,
            6 => Self::VmresumeAfterVmxoff,
            7 => Self::InvalidControlFields,
            8 => Self::InvalidHostState,
            9 => Self::VmptrldWithInvalidAddress,
            10 => Self::VmptrldWithVmxonPointer,
            11 => Self::VmptrldWithIncorrectRevisionId,
            12 => Self::UnsupportedVmcsField,
            13 => Self::WriteToReadOnlyField,
            15 => Self::VmxonInVmxRoot,
            16 => Self::InvalidExecutiveVmcsPointer,
            17 => Self::NonLaunchedExecutiveVmcs,
            18 => Self::ExecutiveVmcsNotVmxonPointer,
            19 => Self::VmcallWithNonClearVmcs,
            20 => Self::VmcallWithInvalidExitControls,
            22 => Self::VmcallWithIncorrectMsegRevisionId,
            23 => Self::VmxoffUnderDualMonitor,
            24 => Self::VmcallWithInvalidSmmFeatures,
            25 => Self::InvalidExecutiveVmExecControls,
            26 => Self::EntryWithEventsBlockedByMovSs,
            28 => Self::InvalidInveptInvvpidOperand,
            _ => Self::Unknown,
        }
    }
}

/// Basic VM-exit reasons.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicExitReason {
    ExceptionOrNmi,
    ExternalInterrupt,
    TripleFault,
    InitSignal,
    StartupIpi,
    IoSmi,
    OtherSmi,
    InterruptWindow,
    NmiWindow,
    TaskSwitch,
    Cpuid,
    Getsec,
    Hlt,
    Invd,
    Invlpg,
    Rdpmc,
    Rdtsc,
    Rsm,
    Vmcall,
    Vmclear,
    Vmlaunch,
    Vmptrld,
    Vmptrst,
    Vmread,
    Vmresume,
    Vmwrite,
    Vmxoff,
    Vmxon,
    ControlRegisterAccess,
    DebugRegisterAccess,
    IoInstruction,
    Rdmsr,
    Wrmsr,
    EntryFailureGuestState,
    EntryFailureMsrLoading,
    Mwait,
    MonitorTrapFlag,
    Monitor,
    Pause,
    EntryFailureMachineCheck,
    TprBelowThreshold,
    ApicAccess,
    GdtrIdtrAccess,
    LdtrTrAccess,
    EptViolation,
    EptMisconfiguration,
    Invept,
    Rdtscp,
    PreemptionTimerExpired,
    Invvpid,
    Wbinvd,
    Xsetbv,
    /// A reason code this monitor does not classify.
    Unknown(u16),
}

impl BasicExitReason {
    /// Map a raw basic-reason code.
    pub fn from_code(code: u16) -> Self {
        match code {
            0x00 => Self::ExceptionOrNmi,
            0x01 => Self::ExternalInterrupt,
            0x02 => Self::TripleFault,
            0x03 => Self::InitSignal,
            0x04 => Self::StartupIpi,
            0x05 => Self::IoSmi,
            0x06 => Self::OtherSmi,
            0x07 => Self::InterruptWindow,
            0x08 => Self::NmiWindow,
            0x09 => Self::TaskSwitch,
            0x0A => Self::Cpuid,
            0x0B => Self::Getsec,
            0x0C => Self::Hlt,
            0x0D => Self::Invd,
            0x0E => Self::Invlpg,
            0x0F => Self::Rdpmc,
            0x10 => Self::Rdtsc,
            0x11 => Self::Rsm,
            0x12 => Self::Vmcall,
            0x13 => Self::Vmclear,
            0x14 => Self::Vmlaunch,
            0x15 => Self::Vmptrld,
            0x16 => Self::Vmptrst,
            0x17 => Self::Vmread,
            0x18 => Self::Vmresume,
            0x19 => Self::Vmwrite,
            0x1A => Self::Vmxoff,
            0x1B => Self::Vmxon,
            0x1C => Self::ControlRegisterAccess,
            0x1D => Self::DebugRegisterAccess,
            0x1E => Self::IoInstruction,
            0x1F => Self::Rdmsr,
            0x20 => Self::Wrmsr,
            0x21 => Self::EntryFailureGuestState,
            0x22 => Self::EntryFailureMsrLoading,
            0x24 => Self::Mwait,
            0x25 => Self::MonitorTrapFlag,
            0x27 => Self::Monitor,
            0x28 => Self::Pause,
            0x29 => Self::EntryFailureMachineCheck,
            0x2B => Self::TprBelowThreshold,
            0x2C => Self::ApicAccess,
            0x2E => Self::GdtrIdtrAccess,
            0x2F => Self::LdtrTrAccess,
            0x30 => Self::EptViolation,
            0x31 => Self::EptMisconfiguration,
            0x32 => Self::Invept,
            0x33 => Self::Rdtscp,
            0x34 => Self::PreemptionTimerExpired,
            0x35 => Self::Invvpid,
            0x36 => Self::Wbinvd,
            0x37 => Self::Xsetbv,
            other => Self::Unknown(other),
        }
    }

    /// Raw code for an EPT violation, for callers synthesizing reasons.
    pub const EPT_VIOLATION: u16 = 0x30;
    /// Raw code for an EPT misconfiguration.
    pub const EPT_MISCONFIGURATION: u16 = 0x31;
    /// Raw code for a HLT exit.
    pub const HLT: u16 = 0x0C;
}

/// The full exit-reason word.
///
/// Bits 15:0 hold the basic reason; bit 31 is set when the exit reflects a
/// failed VM entry rather than a guest event.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExitReason(u32);

impl ExitReason {
    /// Interpret a raw exit-reason field value.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw as u32)
    }

    /// The raw word.
    #[inline]
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Whether this exit reports a failed VM entry.
    #[inline]
    pub fn entry_failure(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// The basic reason classification.
    #[inline]
    pub fn basic(&self) -> BasicExitReason {
        BasicExitReason::from_code((self.0 & 0xffff) as u16)
    }
}

impl core::fmt::Debug for ExitReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.entry_failure() {
            write!(f, "ExitReason(entry failure, {:?})", self.basic())
        } else {
            write!(f, "ExitReason({:?})", self.basic())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_decoding() {
        let reason = ExitReason::from_raw(0x0C);
        assert!(!reason.entry_failure());
        assert_eq!(reason.basic(), BasicExitReason::Hlt);

        let reason = ExitReason::from_raw(0x8000_0021);
        assert!(reason.entry_failure());
        assert_eq!(reason.basic(), BasicExitReason::EntryFailureGuestState);

        assert_eq!(
            ExitReason::from_raw(0x30).basic(),
            BasicExitReason::EptViolation
        );
        assert_eq!(
            ExitReason::from_raw(0x31).basic(),
            BasicExitReason::EptMisconfiguration
        );
        assert_eq!(ExitReason::from_raw(0x45).basic(), BasicExitReason::Unknown(0x45));
    }

    #[test]
    fn qualification_access_kinds() {
        let q = EptViolationQualification::DATA_READ | EptViolationQualification::LINEAR_ADDRESS_VALID;
        assert!(q.is_data_access());
        assert!(!q.is_instruction_fetch());

        let q = EptViolationQualification::INSTRUCTION_FETCH;
        assert!(q.is_instruction_fetch());
        assert!(!q.is_data_access());
    }

    #[test]
    fn instruction_error_table() {
        assert_eq!(
            InstructionError::from_code(11),
            InstructionError::VmptrldWithIncorrectRevisionId
        );
        assert_eq!(InstructionError::from_code(7), InstructionError::InvalidControlFields);
        assert_eq!(InstructionError::from_code(14), InstructionError::Unknown);
    }
}
