//! A simulated logical processor.
//!
//! [`SimulatedVmx`] implements the monitor's hardware trait with an MSR
//! file, a VMCS store, and an interpreter that runs the scripted guest.
//! Every guest memory access — including the instruction fetch at the guest
//! instruction pointer — performs the real two-stage translation: the
//! guest's linear address is walked through the host page tables (whose
//! entries are themselves read through the extended page tables), and the
//! resulting guest-physical address is walked through the extended page
//! tables with permission checks. Successful translations land in a
//! translation cache that only INVEPT flushes, so a monitor that forgets to
//! invalidate after mutating a translation misbehaves here the same way it
//! would on hardware.

use std::collections::BTreeMap;

use visor::{
    addressing::{Pa, PageIndices, Va, PAGE_MASK, PAGE_SHIFT},
    ept::EptPermission,
    mtrr::{IA32_MTRRCAP, IA32_MTRR_DEF_TYPE, IA32_MTRR_PHYSBASE0, IA32_MTRR_PHYSMASK0},
    platform::{PrivilegedSnapshot, SegmentSnapshot},
    vm_control::{
        revision_id, EptVpidCap, FeatureControl, PrimaryControls, SecondaryControls,
        IA32_FEATURE_CONTROL, IA32_VMX_BASIC, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1,
        IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1, IA32_VMX_ENTRY_CTLS, IA32_VMX_EPT_VPID_CAP,
        IA32_VMX_EXIT_CTLS, IA32_VMX_PINBASED_CTLS, IA32_VMX_PROCBASED_CTLS,
        IA32_VMX_PROCBASED_CTLS2, IA32_VMX_TRUE_ENTRY_CTLS, IA32_VMX_TRUE_EXIT_CTLS,
        IA32_VMX_TRUE_PINBASED_CTLS, IA32_VMX_TRUE_PROCBASED_CTLS, VMX_BASIC_TRUE_CONTROLS,
    },
    vmcs::{BasicExitReason, EptViolationQualification, Field, InstructionError},
    vmexits::GUEST_STATUS_STACK_OFFSET,
    vmx::{ExecutionPriority, GuestTransition, InveptScope, Msrs, VmxFacility},
};

use crate::{
    arena::AddressMap,
    guest::{GuestOp, GuestProgram},
};

const PA_4K_MASK: u64 = 0x000f_ffff_ffff_f000;
const PA_2M_MASK: u64 = 0x000f_ffff_ffe0_0000;
const LARGE_BIT: u64 = 1 << 7;

const PASSIVE_LEVEL: u8 = 0;
const HIGH_LEVEL: u8 = 15;

/// Exits the processor will deliver before declaring the session runaway.
const EXIT_BUDGET: usize = 512;
/// Operations the interpreter will run per entry before the same.
const OP_BUDGET: usize = 4096;

/// The uncacheable variable MTRR range advertised by [`standard_msrs`].
pub const UC_RANGE_BASE: usize = 0x2000_0000;
/// Its length.
pub const UC_RANGE_SIZE: usize = 0x20_0000;

/// One delivered VM exit, as the tests observe it.
#[derive(Debug, Clone, Copy)]
pub struct ExitRecord {
    /// Raw exit-reason word.
    pub reason: u32,
    /// Guest instruction pointer at delivery.
    pub rip: u64,
    /// Exit qualification.
    pub qualification: u64,
    /// Guest-physical address, for translation exits.
    pub guest_physical: u64,
}

#[derive(Default)]
struct VmcsData {
    launched: bool,
    fields: BTreeMap<u32, u64>,
}

#[derive(Clone, Copy)]
struct TlbEntry {
    hpa_page: usize,
    perm: EptPermission,
}

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
    Fetch,
}

impl Access {
    fn needed(self) -> EptPermission {
        match self {
            Access::Read => EptPermission::READ,
            Access::Write => EptPermission::WRITE,
            Access::Fetch => EptPermission::EXECUTE,
        }
    }

    fn qualification(self) -> EptViolationQualification {
        match self {
            Access::Read => EptViolationQualification::DATA_READ,
            Access::Write => EptViolationQualification::DATA_WRITE,
            Access::Fetch => EptViolationQualification::INSTRUCTION_FETCH,
        }
    }
}

enum Fault {
    Violation {
        gpa: u64,
        linear: u64,
        access: Access,
        seen: EptPermission,
        translated: bool,
    },
    Misconfiguration {
        gpa: u64,
    },
    Shutdown,
}

/// The simulated facility for one logical processor.
pub struct SimulatedVmx {
    map: AddressMap,
    msrs: BTreeMap<u32, u64>,
    snapshot: PrivilegedSnapshot,
    cr0: u64,
    cr4: u64,
    irql: u8,
    vmxon_at: Option<Pa>,
    vmxon_calls: usize,
    regions: BTreeMap<usize, VmcsData>,
    current: Option<usize>,
    tlb: BTreeMap<usize, TlbEntry>,
    guest: Option<GuestProgram>,
    exits: Vec<ExitRecord>,
}

/// The MSR file of a processor that satisfies every capability the monitor
/// checks for: locked feature control with VMX outside SMX, true control
/// MSRs, a 4-level write-back EPT walk with 2MB pages and both INVEPT
/// scopes, and enabled MTRRs (write-back default, one uncacheable variable
/// range at [`UC_RANGE_BASE`]).
pub fn standard_msrs() -> BTreeMap<u32, u64> {
    // Required-1 settings in the low half, allowed-1 in the high half.
    fn caps(required: u32, allowed: u32) -> u64 {
        (((allowed | required) as u64) << 32) | required as u64
    }

    let mut msrs = BTreeMap::new();
    msrs.insert(
        IA32_FEATURE_CONTROL,
        (FeatureControl::LOCK | FeatureControl::VMX_OUTSIDE_SMX).bits(),
    );
    msrs.insert(IA32_VMX_BASIC, VMX_BASIC_TRUE_CONTROLS | 0x12);
    msrs.insert(IA32_VMX_PINBASED_CTLS, caps(0x16, 0xff));
    msrs.insert(IA32_VMX_TRUE_PINBASED_CTLS, caps(0, 0xff));
    msrs.insert(IA32_VMX_PROCBASED_CTLS, caps(0x0401_e172, 0xfff9_fffe));
    msrs.insert(IA32_VMX_TRUE_PROCBASED_CTLS, caps(0x0400_6172, 0xfff9_fffe));
    msrs.insert(IA32_VMX_PROCBASED_CTLS2, caps(0, 0x0010_00ff));
    msrs.insert(IA32_VMX_EXIT_CTLS, caps(0x0003_6dff, 0x00ff_ffff));
    msrs.insert(IA32_VMX_TRUE_EXIT_CTLS, caps(0x0003_6dfb, 0x00ff_ffff));
    msrs.insert(IA32_VMX_ENTRY_CTLS, caps(0x0000_11ff, 0x0003_ffff));
    msrs.insert(IA32_VMX_TRUE_ENTRY_CTLS, caps(0x0000_11fb, 0x0003_ffff));
    msrs.insert(IA32_VMX_CR0_FIXED0, 0x8005_0021);
    msrs.insert(IA32_VMX_CR0_FIXED1, 0xffff_ffff);
    msrs.insert(IA32_VMX_CR4_FIXED0, 0x2000);
    msrs.insert(IA32_VMX_CR4_FIXED1, 0x003f_67ff);
    msrs.insert(
        IA32_VMX_EPT_VPID_CAP,
        (EptVpidCap::EXECUTE_ONLY
            | EptVpidCap::PAGE_WALK_LENGTH_4
            | EptVpidCap::MEMORY_TYPE_UC
            | EptVpidCap::MEMORY_TYPE_WB
            | EptVpidCap::PDE_2MB
            | EptVpidCap::INVEPT
            | EptVpidCap::INVEPT_SINGLE_CONTEXT
            | EptVpidCap::INVEPT_ALL_CONTEXT)
            .bits(),
    );

    msrs.insert(IA32_MTRRCAP, 0x08 | (1 << 8));
    msrs.insert(IA32_MTRR_DEF_TYPE, (1 << 11) | (1 << 10) | 6);
    for msr in [
        0x250, 0x258, 0x259, 0x268, 0x269, 0x26A, 0x26B, 0x26C, 0x26D, 0x26E, 0x26F,
    ] {
        msrs.insert(msr, 0x0606_0606_0606_0606);
    }
    msrs.insert(IA32_MTRR_PHYSBASE0, UC_RANGE_BASE as u64);
    msrs.insert(
        IA32_MTRR_PHYSMASK0,
        (!(UC_RANGE_SIZE as u64 - 1) & PA_4K_MASK) | (1 << 11),
    );
    msrs
}

fn initial_snapshot(host_root: Pa) -> PrivilegedSnapshot {
    let code = SegmentSnapshot {
        selector: 0x10,
        base: 0,
        limit: 0xffff_ffff,
        access_rights: 0xa09b,
    };
    let data = SegmentSnapshot {
        selector: 0x18,
        base: 0,
        limit: 0xffff_ffff,
        access_rights: 0xc093,
    };
    let unusable = SegmentSnapshot {
        selector: 0,
        base: 0,
        limit: 0,
        access_rights: 0x1_0000,
    };
    PrivilegedSnapshot {
        cr0: 0x8005_0033,
        cr3: unsafe { host_root.into_usize() } as u64,
        cr4: 0x0000_06f0,
        dr7: 0x400,
        rflags: 0x2,
        cs: code,
        ss: data,
        ds: data,
        es: data,
        fs: unusable,
        gs: unusable,
        ldtr: unusable,
        tr: SegmentSnapshot {
            selector: 0x40,
            base: 0xffff_8000_0000_3000,
            limit: 0x67,
            access_rights: 0x8b,
        },
        gdtr_base: 0xffff_8000_0000_1000,
        gdtr_limit: 0x7f,
        idtr_base: 0xffff_8000_0000_2000,
        idtr_limit: 0xfff,
        fs_base: 0,
        gs_base: 0xffff_8000_0000_4000,
        debugctl: 0,
        sysenter_cs: 0,
        sysenter_esp: 0,
        sysenter_eip: 0,
    }
}

impl SimulatedVmx {
    /// A processor over the given physical memory, with the host page
    /// tables rooted at `host_root` and the given MSR file.
    pub fn new(map: AddressMap, host_root: Pa, msrs: BTreeMap<u32, u64>) -> Self {
        let snapshot = initial_snapshot(host_root);
        let cr0 = snapshot.cr0;
        let cr4 = snapshot.cr4;
        Self {
            map,
            msrs,
            snapshot,
            cr0,
            cr4,
            irql: PASSIVE_LEVEL,
            vmxon_at: None,
            vmxon_calls: 0,
            regions: BTreeMap::new(),
            current: None,
            tlb: BTreeMap::new(),
            guest: None,
            exits: Vec::new(),
        }
    }

    /// Hand the processor the guest program to run.
    pub fn load_guest(&mut self, program: GuestProgram) {
        self.guest = Some(program);
    }

    /// The loaded guest program (for inspecting its register state).
    pub fn guest(&self) -> Option<&GuestProgram> {
        self.guest.as_ref()
    }

    /// Override one MSR (for simulating capability absences).
    pub fn set_msr(&mut self, msr: u32, value: u64) {
        self.msrs.insert(msr, value);
    }

    /// Every exit delivered so far.
    pub fn exit_log(&self) -> &[ExitRecord] {
        &self.exits
    }

    /// Successful VMXON executions.
    pub fn vmxon_calls(&self) -> usize {
        self.vmxon_calls
    }

    /// Whether the processor is in VMX operation.
    pub fn in_vmx_operation(&self) -> bool {
        self.vmxon_at.is_some()
    }

    /// Current execution priority.
    pub fn irql(&self) -> u8 {
        self.irql
    }

    /// Read a field of the most recently current VMCS (post-mortem window
    /// for tests; the region data survives VMXOFF).
    pub fn vmcs_field(&self, field: Field) -> Option<u64> {
        let current = self.current?;
        Some(
            self.regions[&current]
                .fields
                .get(&(field as u32))
                .copied()
                .unwrap_or(0),
        )
    }

    fn revision(&self) -> u32 {
        revision_id(self.rdmsr(IA32_VMX_BASIC))
    }

    fn field(&self, field: Field) -> u64 {
        self.vmcs_field(field).expect("no current VMCS")
    }

    fn set_field(&mut self, field: Field, value: u64) {
        let current = self.current.expect("no current VMCS");
        self.regions
            .get_mut(&current)
            .unwrap()
            .fields
            .insert(field as u32, value);
    }

    fn capability_for(&self, standard_msr: u32, true_msr: u32) -> u64 {
        if self.rdmsr(IA32_VMX_BASIC) & VMX_BASIC_TRUE_CONTROLS != 0 && true_msr != 0 {
            self.rdmsr(true_msr)
        } else {
            self.rdmsr(standard_msr)
        }
    }

    /// The entry checks a real processor performs on the control fields.
    fn validate_entry(&self) -> Result<(), InstructionError> {
        let words = [
            (Field::PinBasedControls, IA32_VMX_PINBASED_CTLS, IA32_VMX_TRUE_PINBASED_CTLS),
            (Field::PrimaryProcessorControls, IA32_VMX_PROCBASED_CTLS, IA32_VMX_TRUE_PROCBASED_CTLS),
            (Field::SecondaryProcessorControls, IA32_VMX_PROCBASED_CTLS2, 0),
            (Field::ExitControls, IA32_VMX_EXIT_CTLS, IA32_VMX_TRUE_EXIT_CTLS),
            (Field::EntryControls, IA32_VMX_ENTRY_CTLS, IA32_VMX_TRUE_ENTRY_CTLS),
        ];
        for (field, standard_msr, true_msr) in words {
            let value = self.field(field) as u32;
            let capability = self.capability_for(standard_msr, true_msr);
            let allowed1 = (capability >> 32) as u32;
            let required1 = capability as u32;
            if value & !allowed1 != 0 || value & required1 != required1 {
                return Err(InstructionError::InvalidControlFields);
            }
        }

        // This processor model cannot run a guest without the extended page
        // tables; a well-formed EPT pointer is part of the contract.
        let secondary = self.field(Field::SecondaryProcessorControls) as u32;
        if secondary & SecondaryControls::ENABLE_EPT.bits() == 0 {
            return Err(InstructionError::InvalidControlFields);
        }
        let eptp = self.field(Field::EptPointer);
        if eptp & 0x7 != 6 || (eptp >> 3) & 0x7 != 3 {
            return Err(InstructionError::InvalidControlFields);
        }
        if self.field(Field::GuestLinkPointer) != u64::MAX {
            return Err(InstructionError::InvalidControlFields);
        }
        Ok(())
    }

    fn read_phys_u64(&self, pa: usize) -> Result<u64, Fault> {
        self.map.read_u64(pa).ok_or(Fault::Shutdown)
    }

    /// Walk the extended page tables for `gpa`, checking `access`, filling
    /// the translation cache on success.
    fn ept_translate(
        &mut self,
        gpa: usize,
        access: Access,
        linear: usize,
        translated: bool,
    ) -> Result<usize, Fault> {
        let needed = access.needed();
        let page = gpa >> PAGE_SHIFT;
        if let Some(entry) = self.tlb.get(&page) {
            if entry.perm.contains(needed) {
                return Ok((entry.hpa_page << PAGE_SHIFT) | (gpa & PAGE_MASK));
            }
        }

        let violation = |seen: EptPermission| Fault::Violation {
            gpa: gpa as u64,
            linear: linear as u64,
            access,
            seen,
            translated,
        };
        let structure_check = |entry: u64| -> Result<(), Fault> {
            // Writable-but-not-readable entries are architecturally
            // malformed; so is a reserved memory type on a mapping entry.
            if entry & 0b10 != 0 && entry & 0b01 == 0 {
                return Err(Fault::Misconfiguration { gpa: gpa as u64 });
            }
            Ok(())
        };
        let mapping_check = |entry: u64| -> Result<(), Fault> {
            if matches!((entry >> 3) & 0x7, 2 | 3 | 7) {
                return Err(Fault::Misconfiguration { gpa: gpa as u64 });
            }
            Ok(())
        };

        let idx = PageIndices::of(gpa);
        let eptp = self.field(Field::EptPointer);
        let top = (eptp & PA_4K_MASK) as usize;

        let pml4e = self.read_phys_u64(top + idx.pml4 * 8)?;
        structure_check(pml4e)?;
        if pml4e & 0b111 == 0 {
            return Err(violation(EptPermission::empty()));
        }

        let pdpt = (pml4e & PA_4K_MASK) as usize;
        let pdpte = self.read_phys_u64(pdpt + idx.pdpt * 8)?;
        structure_check(pdpte)?;
        if pdpte & 0b111 == 0 {
            return Err(violation(EptPermission::empty()));
        }
        if pdpte & LARGE_BIT != 0 {
            // 1GB mappings are not advertised by the capability MSR.
            return Err(Fault::Misconfiguration { gpa: gpa as u64 });
        }

        let pd = (pdpte & PA_4K_MASK) as usize;
        let pde = self.read_phys_u64(pd + idx.pd * 8)?;
        structure_check(pde)?;
        if pde & 0b111 == 0 {
            return Err(violation(EptPermission::empty()));
        }

        let (hpa_page, perm) = if pde & LARGE_BIT != 0 {
            mapping_check(pde)?;
            let base = (pde & PA_2M_MASK) as usize;
            (
                (base >> PAGE_SHIFT) + idx.pt,
                EptPermission::from_bits_truncate(pde),
            )
        } else {
            let pt = (pde & PA_4K_MASK) as usize;
            let pte = self.read_phys_u64(pt + idx.pt * 8)?;
            structure_check(pte)?;
            if pte & 0b111 == 0 {
                return Err(violation(EptPermission::empty()));
            }
            mapping_check(pte)?;
            (
                ((pte & PA_4K_MASK) as usize) >> PAGE_SHIFT,
                EptPermission::from_bits_truncate(pte),
            )
        };

        if !perm.contains(needed) {
            return Err(violation(perm));
        }
        self.tlb.insert(page, TlbEntry { hpa_page, perm });
        Ok((hpa_page << PAGE_SHIFT) | (gpa & PAGE_MASK))
    }

    /// Translate a guest linear address end to end: the host page-table
    /// walk (each entry read through the extended page tables) followed by
    /// the extended-page-table translation of the final guest-physical
    /// address.
    fn access(&mut self, va: usize, access: Access) -> Result<usize, Fault> {
        let cr3 = (self.field(Field::GuestCr3) & PA_4K_MASK) as usize;
        let idx = PageIndices::of(va);
        let mut table = cr3;
        for (level, slot) in [idx.pml4, idx.pdpt, idx.pd, idx.pt].into_iter().enumerate() {
            let entry_gpa = table + slot * 8;
            let entry_hpa = self.ept_translate(entry_gpa, Access::Read, va, false)?;
            let entry = self.read_phys_u64(entry_hpa)?;
            if entry & 1 == 0 {
                // A guest page fault would be the guest kernel's problem;
                // the scripted guest never runs unmapped, so a hole here
                // means the simulation is broken.
                return Err(Fault::Shutdown);
            }
            if level < 3 && entry & LARGE_BIT != 0 {
                return Err(Fault::Shutdown);
            }
            table = (entry & PA_4K_MASK) as usize;
        }
        self.ept_translate(table + (va & PAGE_MASK), access, va, true)
    }

    fn read_image(&self, hpa: usize) -> Result<[u8; 3], Fault> {
        let mut image = [0u8; 3];
        for (i, byte) in image.iter_mut().enumerate() {
            *byte = self.map.read_u8(hpa + i).ok_or(Fault::Shutdown)?;
        }
        Ok(image)
    }

    fn record_exit(
        &mut self,
        reason: u32,
        qualification: u64,
        guest_physical: u64,
        guest_linear: u64,
        instruction_len: u64,
    ) {
        self.set_field(Field::ExitReason, reason as u64);
        self.set_field(Field::ExitQualification, qualification);
        self.set_field(Field::GuestPhysicalAddr, guest_physical);
        self.set_field(Field::GuestLinearAddr, guest_linear);
        self.set_field(Field::ExitInstructionLength, instruction_len);
        let rip = self.field(Field::GuestRip);
        self.exits.push(ExitRecord {
            reason,
            rip,
            qualification,
            guest_physical,
        });
    }

    fn deliver(&mut self, fault: Fault) {
        match fault {
            Fault::Violation {
                gpa,
                linear,
                access,
                seen,
                translated,
            } => {
                let mut qualification =
                    access.qualification() | EptViolationQualification::LINEAR_ADDRESS_VALID;
                if seen.contains(EptPermission::READ) {
                    qualification |= EptViolationQualification::WAS_READABLE;
                }
                if seen.contains(EptPermission::WRITE) {
                    qualification |= EptViolationQualification::WAS_WRITABLE;
                }
                if seen.contains(EptPermission::EXECUTE) {
                    qualification |= EptViolationQualification::WAS_EXECUTABLE;
                }
                if translated {
                    qualification |= EptViolationQualification::TRANSLATED_ACCESS;
                }
                self.record_exit(
                    u32::from(BasicExitReason::EPT_VIOLATION),
                    qualification.bits(),
                    gpa,
                    linear,
                    0,
                );
            }
            Fault::Misconfiguration { gpa } => {
                self.record_exit(u32::from(BasicExitReason::EPT_MISCONFIGURATION), 0, gpa, 0, 0);
            }
            // Triple fault: the catch-all for a guest the simulation can no
            // longer run.
            Fault::Shutdown => self.record_exit(0x02, 0, 0, 0, 0),
        }
    }

    /// Run the guest until something forces an exit. `Ok` means an
    /// architectural exit was already recorded; `Err` carries a fault still
    /// to deliver.
    fn interpret(&mut self, program: &mut GuestProgram) -> Result<(), Fault> {
        for _ in 0..OP_BUDGET {
            let rip = self.field(Field::GuestRip) as usize;
            let op = program.op_at(rip).ok_or(Fault::Shutdown)?;
            self.access(rip, Access::Fetch)?;
            let len = op.encoded_len();

            match op {
                GuestOp::OpenFrame(bytes) => {
                    let rsp = self.field(Field::GuestRsp) - bytes as u64;
                    self.set_field(Field::GuestRsp, rsp);
                }
                GuestOp::Hlt => {
                    let primary = self.field(Field::PrimaryProcessorControls) as u32;
                    if primary & PrimaryControls::HLT_EXITING.bits() != 0 {
                        self.record_exit(u32::from(BasicExitReason::HLT), 0, 0, 0, len as u64);
                        return Ok(());
                    }
                }
                GuestOp::SnapshotFunction(va) => {
                    let hpa = self.access(unsafe { va.into_usize() }, Access::Read)?;
                    program.saved = Some(self.read_image(hpa)?);
                }
                GuestOp::CallFunction(va) => {
                    // Translate the return-address push and the target fetch
                    // before committing anything, so a faulting call replays
                    // cleanly after the exit is serviced.
                    let rsp = self.field(Field::GuestRsp) as usize;
                    let push_hpa = self.access(rsp - 8, Access::Write)?;
                    let fetch_hpa = self.access(unsafe { va.into_usize() }, Access::Fetch)?;
                    self.map
                        .write_u64(push_hpa, (rip + len) as u64)
                        .ok_or(Fault::Shutdown)?;
                    program.al = GuestProgram::decode_return(self.read_image(fetch_hpa)?);
                }
                GuestOp::VerifyFunction(va) => {
                    let hpa = self.access(unsafe { va.into_usize() }, Access::Read)?;
                    let image = self.read_image(hpa)?;
                    program.tampered = program.saved.map_or(false, |saved| saved != image);
                }
                GuestOp::StoreStatus => {
                    let rsp = self.field(Field::GuestRsp) as usize;
                    let hpa = self.access(rsp + GUEST_STATUS_STACK_OFFSET, Access::Write)?;
                    self.map
                        .write_u8(hpa, program.status_byte())
                        .ok_or(Fault::Shutdown)?;
                }
            }
            self.set_field(Field::GuestRip, (rip + len) as u64);
        }
        Err(Fault::Shutdown)
    }
}

impl Msrs for SimulatedVmx {
    fn rdmsr(&self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or(0)
    }
}

impl VmxFacility for SimulatedVmx {
    fn snapshot_privileged(&self) -> PrivilegedSnapshot {
        PrivilegedSnapshot {
            cr0: self.cr0,
            cr4: self.cr4,
            ..self.snapshot.clone()
        }
    }

    fn restore_privileged(&mut self, saved: &PrivilegedSnapshot) {
        self.cr0 = saved.cr0;
        self.cr4 = saved.cr4;
        self.snapshot = saved.clone();
    }

    fn raise_priority(&mut self) -> ExecutionPriority {
        let previous = self.irql;
        self.irql = HIGH_LEVEL;
        ExecutionPriority(previous)
    }

    fn restore_priority(&mut self, previous: ExecutionPriority) {
        self.irql = previous.0;
    }

    fn write_cr0(&mut self, value: u64) {
        self.cr0 = value;
    }

    fn write_cr4(&mut self, value: u64) {
        self.cr4 = value;
    }

    fn host_entry_point(&self) -> Va {
        // Where a driver's exit stub would live; never dereferenced here.
        Va::new(0xffff_8000_00ee_0000).unwrap()
    }

    fn vmxon(&mut self, region: Pa) -> Result<(), InstructionError> {
        if self.vmxon_at.is_some() {
            return Err(InstructionError::VmxonInVmxRoot);
        }
        if self.cr4 & (1 << 13) == 0 {
            // CR4.VMXE gates the instruction outright.
            return Err(InstructionError::Unknown);
        }
        let revision = self
            .map
            .read_u32(unsafe { region.into_usize() })
            .ok_or(InstructionError::Unknown)?;
        if revision != self.revision() {
            return Err(InstructionError::Unknown);
        }
        self.vmxon_at = Some(region);
        self.vmxon_calls += 1;
        Ok(())
    }

    fn vmxoff(&mut self) {
        self.vmxon_at = None;
        self.tlb.clear();
    }

    fn vmclear(&mut self, region: Pa) -> Result<(), InstructionError> {
        if self.vmxon_at == Some(region) {
            return Err(InstructionError::VmclearWithVmxonPointer);
        }
        let key = unsafe { region.into_usize() };
        self.regions.entry(key).or_default().launched = false;
        if self.current == Some(key) {
            self.current = None;
        }
        Ok(())
    }

    fn vmptrld(&mut self, region: Pa) -> Result<(), InstructionError> {
        if self.vmxon_at == Some(region) {
            return Err(InstructionError::VmptrldWithVmxonPointer);
        }
        let key = unsafe { region.into_usize() };
        let revision = self
            .map
            .read_u32(key)
            .ok_or(InstructionError::VmptrldWithInvalidAddress)?;
        if revision != self.revision() {
            return Err(InstructionError::VmptrldWithIncorrectRevisionId);
        }
        self.regions.entry(key).or_default();
        self.current = Some(key);
        Ok(())
    }

    fn vmread(&self, field: Field) -> Result<u64, InstructionError> {
        let current = self.current.ok_or(InstructionError::Unknown)?;
        Ok(self.regions[&current]
            .fields
            .get(&(field as u32))
            .copied()
            .unwrap_or(0))
    }

    fn vmwrite(&mut self, field: Field, value: u64) -> Result<(), InstructionError> {
        // Encoding bits 11:10 distinguish the read-only data area.
        if (field as u32 >> 10) & 0x3 == 1 {
            return Err(InstructionError::WriteToReadOnlyField);
        }
        let current = self.current.ok_or(InstructionError::Unknown)?;
        self.regions
            .get_mut(&current)
            .unwrap()
            .fields
            .insert(field as u32, value);
        Ok(())
    }

    fn invept(&mut self, _scope: InveptScope, _eptp: u64) -> Result<(), InstructionError> {
        let cap = EptVpidCap::from_bits_truncate(self.rdmsr(IA32_VMX_EPT_VPID_CAP));
        if !cap.contains(EptVpidCap::INVEPT) {
            return Err(InstructionError::InvalidInveptInvvpidOperand);
        }
        // Both scopes flush everything on a one-context processor.
        self.tlb.clear();
        Ok(())
    }

    fn enter_guest(&mut self, launched: bool) -> GuestTransition {
        if self.vmxon_at.is_none() {
            return GuestTransition::Failed(InstructionError::Unknown);
        }
        let Some(current) = self.current else {
            return GuestTransition::Failed(InstructionError::Unknown);
        };
        let launched_state = self.regions[&current].launched;
        if !launched && launched_state {
            return GuestTransition::Failed(InstructionError::VmlaunchWithNonClearVmcs);
        }
        if launched && !launched_state {
            return GuestTransition::Failed(InstructionError::VmresumeWithNonLaunchedVmcs);
        }
        if let Err(e) = self.validate_entry() {
            return GuestTransition::Failed(e);
        }
        self.regions.get_mut(&current).unwrap().launched = true;

        if self.exits.len() >= EXIT_BUDGET {
            // A session this long has lost its way; force it out.
            self.deliver(Fault::Shutdown);
            return GuestTransition::Exited;
        }

        let mut program = self.guest.take().expect("no guest program loaded");
        let outcome = self.interpret(&mut program);
        self.guest = Some(program);
        if let Err(fault) = outcome {
            self.deliver(fault);
        }
        GuestTransition::Exited
    }
}
