//! The acceptance scenarios: launch/halt, hook redirection, violation
//! splitting, the capability preflight, and the translation-hierarchy
//! properties, all driven over the simulated platform.

use testbed::{
    arena::Arena,
    guest::{GuestOp, GuestProgram, FRAME_SIZE, HOOK_FUNCTION, TARGET_FUNCTION},
    hardware::{standard_msrs, SimulatedVmx, UC_RANGE_BASE},
    trace,
};
use visor::{
    addressing::{Pa, Va, LARGE_PAGE_SIZE, PAGE_SIZE},
    ept::{AllocationContext, EptError, EptPermission, ExtendedPageTable, LEAF_TABLE_CACHE},
    indexer,
    mtrr::{MemTypeOracle, MemoryType, MtrrRanges},
    platform::KernelMemory,
    vm::{MappingPolicy, SessionConfig, VmSession},
    vm_control::{EptVpidCap, IA32_VMX_EPT_VPID_CAP, IA32_VMX_TRUE_PROCBASED_CTLS},
    vmcs::{BasicExitReason, EptViolationQualification, ExitReason, Field},
    vmexits::{GuestStatus, InterceptDispatcher, InterceptPlan, InterceptStrategy},
    vmx::Msrs,
    Capability, VmmError,
};

const SYSTEM_EXTENT: usize = 0x4000_0000;

struct Rig {
    arena: Arena,
    code: Va,
    target: Va,
    hook: Va,
}

fn rig() -> Rig {
    trace::init(log::LevelFilter::Info);
    let mut arena = Arena::new();
    let code = arena.allocate(PAGE_SIZE, true, false).unwrap().va;
    let target = arena.allocate(PAGE_SIZE, true, false).unwrap().va;
    let hook = arena.allocate(PAGE_SIZE, true, false).unwrap().va;
    arena.write_bytes(target, &TARGET_FUNCTION);
    arena.write_bytes(hook, &HOOK_FUNCTION);
    Rig {
        arena,
        code,
        target,
        hook,
    }
}

fn hardware(arena: &Arena) -> SimulatedVmx {
    SimulatedVmx::new(arena.address_map(), arena.host_root(), standard_msrs())
}

fn basic(reason: u32) -> BasicExitReason {
    ExitReason::from_raw(reason as u64).basic()
}

#[test]
fn launch_and_halt() {
    let Rig {
        mut arena, code, ..
    } = rig();
    let mut hw = hardware(&arena);
    hw.load_guest(GuestProgram::halt_only(code));

    let config = SessionConfig {
        guest_entry: code,
        mapping: MappingPolicy::PerAddress(vec![code]),
    };
    let oracle = MtrrRanges::load(&hw);
    let allocations = arena.allocations();
    let frees = arena.frees();

    let mut session = VmSession::prepare(&mut arena, &hw, &config, &oracle).unwrap();
    let mut dispatcher = InterceptDispatcher::observe_only(1);
    let report = session
        .run(&mut arena, &mut hw, &mut dispatcher, &config)
        .unwrap();

    assert_eq!(report.halts, 1);
    assert_eq!(report.guest_status, None);

    let exits = hw.exit_log();
    assert_eq!(exits.len(), 1);
    assert_eq!(basic(exits[0].reason), BasicExitReason::Hlt);

    // The halt sits after the 4-byte frame open and encodes to one byte;
    // the dispatcher advanced the guest past it.
    let rip = hw.vmcs_field(Field::GuestRip).unwrap() as usize;
    assert_eq!(rip, unsafe { code.into_usize() } + 5);

    // The accepted control words satisfy the capability report.
    let primary = hw.vmcs_field(Field::PrimaryProcessorControls).unwrap() as u32;
    let cap = hw.rdmsr(IA32_VMX_TRUE_PROCBASED_CTLS);
    assert_eq!(primary & !((cap >> 32) as u32), 0);
    assert_eq!(primary & cap as u32, cap as u32);

    // The unwind released exactly what the session allocated.
    assert_eq!(arena.allocations() - allocations, arena.frees() - frees);
    assert!(!hw.in_vmx_operation());
    assert_eq!(hw.irql(), 0);
}

#[test]
fn hook_redirection_serves_the_hook_function() {
    let Rig {
        mut arena,
        code,
        target,
        hook,
    } = rig();
    let mut hw = hardware(&arena);
    hw.load_guest(GuestProgram::call_through(code, target));

    let config = SessionConfig {
        guest_entry: code,
        mapping: MappingPolicy::PerAddress(vec![code, target, hook]),
    };
    let oracle = MtrrRanges::load(&hw);
    let mut session = VmSession::prepare(&mut arena, &hw, &config, &oracle).unwrap();
    let mut dispatcher = InterceptDispatcher::with_plan(
        InterceptPlan {
            strategy: InterceptStrategy::HookRedirect,
            target,
            hook,
        },
        2,
    );
    let report = session
        .run(&mut arena, &mut hw, &mut dispatcher, &config)
        .unwrap();

    assert_eq!(report.halts, 2);
    assert_eq!(report.guest_status, Some(GuestStatus::Hooked));
    // The guest called through the target address but observed the hook's
    // return value.
    assert_eq!(hw.guest().unwrap().al, HOOK_FUNCTION[1]);
    // Redirection never surfaces in the exit stream.
    assert!(hw
        .exit_log()
        .iter()
        .all(|e| basic(e.reason) == BasicExitReason::Hlt));
}

#[test]
fn violation_splitting_separates_fetches_from_reads() {
    let Rig {
        mut arena,
        code,
        target,
        hook,
    } = rig();
    let mut hw = hardware(&arena);
    hw.load_guest(GuestProgram::checked_call(code, target));

    let config = SessionConfig {
        guest_entry: code,
        mapping: MappingPolicy::FullSystem {
            extent: SYSTEM_EXTENT,
        },
    };
    let oracle = MtrrRanges::load(&hw);
    let mut session = VmSession::prepare(&mut arena, &hw, &config, &oracle).unwrap();
    let mut dispatcher = InterceptDispatcher::with_plan(
        InterceptPlan {
            strategy: InterceptStrategy::ExecSplit,
            target,
            hook,
        },
        2,
    );
    let report = session
        .run(&mut arena, &mut hw, &mut dispatcher, &config)
        .unwrap();

    assert_eq!(report.halts, 2);
    assert_eq!(report.guest_status, Some(GuestStatus::Hooked));

    let guest = hw.guest().unwrap();
    // Fetches observed the hook image; the interleaved read still observed
    // the original, so the guest's integrity check passed.
    assert_eq!(guest.al, HOOK_FUNCTION[1]);
    assert_eq!(guest.saved, Some(TARGET_FUNCTION));
    assert!(!guest.tampered);

    let reasons: Vec<_> = hw.exit_log().iter().map(|e| basic(e.reason)).collect();
    assert_eq!(
        reasons,
        [
            BasicExitReason::Hlt,
            BasicExitReason::EptViolation,
            BasicExitReason::EptViolation,
            BasicExitReason::Hlt,
        ]
    );

    let violations: Vec<_> = hw
        .exit_log()
        .iter()
        .filter(|e| basic(e.reason) == BasicExitReason::EptViolation)
        .cloned()
        .collect();
    // First the revoked instruction fetch, then the data read against the
    // execute-only swap mapping.
    let first = EptViolationQualification::from_bits_truncate(violations[0].qualification);
    assert!(first.is_instruction_fetch());
    let second = EptViolationQualification::from_bits_truncate(violations[1].qualification);
    assert!(second.is_data_access());
    assert!(second.contains(EptViolationQualification::WAS_EXECUTABLE));

    let target_page = arena.va_to_pa(target).unwrap().page_base();
    for violation in &violations {
        assert_eq!(
            Pa::new(violation.guest_physical as usize).unwrap().page_base(),
            target_page
        );
    }
}

#[test]
fn missing_walk_capability_stops_setup_before_any_allocation() {
    let Rig {
        mut arena, code, ..
    } = rig();
    let mut hw = hardware(&arena);
    let cap = hw.rdmsr(IA32_VMX_EPT_VPID_CAP) & !EptVpidCap::PAGE_WALK_LENGTH_4.bits();
    hw.set_msr(IA32_VMX_EPT_VPID_CAP, cap);
    hw.load_guest(GuestProgram::halt_only(code));

    let config = SessionConfig {
        guest_entry: code,
        mapping: MappingPolicy::PerAddress(vec![code]),
    };
    let oracle = MtrrRanges::load(&hw);
    let allocations = arena.allocations();

    let err = VmSession::prepare(&mut arena, &hw, &config, &oracle).unwrap_err();
    assert!(matches!(
        err,
        VmmError::MissingCapability(Capability::EptWalkLength4)
    ));
    assert_eq!(arena.allocations(), allocations);
    assert_eq!(hw.vmxon_calls(), 0);
    assert!(!hw.in_vmx_operation());
}

#[test]
fn identity_insertion_round_trips_through_the_hierarchy() {
    let Rig {
        mut arena, target, ..
    } = rig();
    let mut hw = hardware(&arena);
    let host_root = arena.host_root();

    let mut ept = ExtendedPageTable::build(&mut arena).unwrap();
    ept.insert_identity(&mut arena, host_root, target).unwrap();

    // Every physical address involved in translating the target resolves
    // to a present 4KB leaf with the identity base and full access.
    let points = indexer::index_points(&arena, host_root, target).unwrap();
    for base in points.bases() {
        let entry = ept
            .resolve_leaf(&mut arena, &mut hw, base, AllocationContext::Unconstrained)
            .unwrap()
            .read();
        assert_eq!(entry.page_base(), Some(base.page_base()));
        assert_eq!(entry.permissions(), EptPermission::FULL);
    }

    // Re-inserting the same address is harmless.
    ept.insert_identity(&mut arena, host_root, target).unwrap();
    ept.teardown(&mut arena);
}

#[test]
fn system_mapping_covers_the_extent_with_oracle_types() {
    let Rig { mut arena, .. } = rig();
    let mut hw = hardware(&arena);
    let oracle = MtrrRanges::load(&hw);

    let mut ept = ExtendedPageTable::build(&mut arena).unwrap();
    ept.map_system(&mut arena, &oracle, SYSTEM_EXTENT).unwrap();

    // Sample the extent; each probe resolves (splitting its region) to a
    // leaf whose base and memory type match the identity and the oracle.
    let mut probe = 0usize;
    while probe < SYSTEM_EXTENT {
        let pa = Pa::new(probe + PAGE_SIZE).unwrap();
        let entry = ept
            .resolve_leaf(&mut arena, &mut hw, pa, AllocationContext::Unconstrained)
            .unwrap()
            .read();
        assert_eq!(entry.page_base(), Some(pa.page_base()));
        assert_eq!(
            entry.mem_type(),
            Some(oracle.memory_type(pa.page_base(), PAGE_SIZE))
        );
        probe += LARGE_PAGE_SIZE * 16;
    }

    // The advertised uncacheable range decodes as uncacheable; ordinary
    // memory stays write-back.
    let uc = ept
        .resolve_leaf(
            &mut arena,
            &mut hw,
            Pa::new(UC_RANGE_BASE).unwrap(),
            AllocationContext::Unconstrained,
        )
        .unwrap()
        .read();
    assert_eq!(uc.mem_type(), Some(MemoryType::Uncacheable));
    let wb = ept
        .resolve_leaf(
            &mut arena,
            &mut hw,
            Pa::new(0x1000_0000).unwrap(),
            AllocationContext::Unconstrained,
        )
        .unwrap()
        .read();
    assert_eq!(wb.mem_type(), Some(MemoryType::WriteBack));

    ept.teardown(&mut arena);
}

#[test]
fn splitting_preserves_the_large_region_translations() {
    let Rig { mut arena, .. } = rig();
    let mut hw = hardware(&arena);
    let oracle = MtrrRanges::load(&hw);

    let mut ept = ExtendedPageTable::build(&mut arena).unwrap();
    ept.map_system(&mut arena, &oracle, SYSTEM_EXTENT).unwrap();

    let region = 0x1520_0000usize;
    let region_type = oracle.memory_type(Pa::new(region).unwrap(), LARGE_PAGE_SIZE);
    // The first resolve converts the 2MB mapping; all 512 leaves reproduce
    // the original translation at 4KB granularity.
    for i in 0..512 {
        let pa = Pa::new(region + i * PAGE_SIZE).unwrap();
        let entry = ept
            .resolve_leaf(&mut arena, &mut hw, pa, AllocationContext::Unconstrained)
            .unwrap()
            .read();
        assert_eq!(entry.page_base(), Some(pa));
        assert_eq!(entry.permissions(), EptPermission::FULL);
        assert_eq!(entry.mem_type(), Some(region_type));
    }
    // An unconstrained split leaves the cached pool alone.
    assert_eq!(ept.cached_tables_available(), LEAF_TABLE_CACHE);

    // Handler-context splits draw from the pool until it runs dry.
    for i in 0..LEAF_TABLE_CACHE {
        let pa = Pa::new(0x2000_0000 + i * LARGE_PAGE_SIZE).unwrap();
        ept.resolve_leaf(&mut arena, &mut hw, pa, AllocationContext::InterruptContext)
            .unwrap();
        assert_eq!(ept.cached_tables_available(), LEAF_TABLE_CACHE - 1 - i);
    }
    let exhausted = ept.resolve_leaf(
        &mut arena,
        &mut hw,
        Pa::new(0x3800_0000).unwrap(),
        AllocationContext::InterruptContext,
    );
    assert!(matches!(exhausted, Err(EptError::CachedTableExhausted)));

    ept.teardown(&mut arena);
}

#[test]
fn teardown_zeroes_and_balances_every_table() {
    let Rig {
        mut arena,
        code,
        target,
        hook,
    } = rig();
    let mut hw = hardware(&arena);
    let host_root = arena.host_root();

    // A per-address tree frees exactly what it allocated and leaves the
    // retained root page fully zeroed.
    let allocations = arena.allocations();
    let frees = arena.frees();
    let mut ept = ExtendedPageTable::build(&mut arena).unwrap();
    for va in [code, target, hook] {
        ept.insert_identity(&mut arena, host_root, va).unwrap();
    }
    let root = ept.eptp().table_base();
    ept.teardown(&mut arena);
    assert_eq!(arena.allocations() - allocations, arena.frees() - frees);
    for slot in 0..512 {
        assert_eq!(arena.read_u64(root + slot * 8), 0);
    }

    // A bulk tree with a pool-consumed split balances too, and a second
    // teardown is a no-op.
    let allocations = arena.allocations();
    let frees = arena.frees();
    let oracle = MtrrRanges::load(&hw);
    let mut ept = ExtendedPageTable::build(&mut arena).unwrap();
    ept.map_system(&mut arena, &oracle, SYSTEM_EXTENT).unwrap();
    ept.resolve_leaf(
        &mut arena,
        &mut hw,
        Pa::new(0x1520_0000).unwrap(),
        AllocationContext::InterruptContext,
    )
    .unwrap();
    ept.teardown(&mut arena);
    ept.teardown(&mut arena);
    assert_eq!(arena.allocations() - allocations, arena.frees() - frees);

    // A built but never-populated tree tears down cleanly as well.
    let allocations = arena.allocations();
    let frees = arena.frees();
    let mut ept = ExtendedPageTable::build(&mut arena).unwrap();
    ept.teardown(&mut arena);
    assert_eq!(arena.allocations() - allocations, arena.frees() - frees);
}

#[test]
fn stray_violation_is_fatal_but_still_unwinds() {
    let Rig {
        mut arena, code, ..
    } = rig();
    let stray = arena.allocate(PAGE_SIZE, true, false).unwrap().va;
    let mut hw = hardware(&arena);
    hw.load_guest(GuestProgram::new(
        code,
        vec![
            GuestOp::OpenFrame(FRAME_SIZE),
            GuestOp::Hlt,
            GuestOp::SnapshotFunction(stray),
            GuestOp::Hlt,
        ],
    ));

    let config = SessionConfig {
        guest_entry: code,
        mapping: MappingPolicy::PerAddress(vec![code]),
    };
    let oracle = MtrrRanges::load(&hw);
    let allocations = arena.allocations();
    let frees = arena.frees();
    let mut session = VmSession::prepare(&mut arena, &hw, &config, &oracle).unwrap();
    let mut dispatcher = InterceptDispatcher::observe_only(2);
    let err = session
        .run(&mut arena, &mut hw, &mut dispatcher, &config)
        .unwrap_err();

    assert!(matches!(err, VmmError::UnhandledEptViolation { .. }));
    assert_eq!(dispatcher.halts(), 1);
    assert_eq!(
        basic(hw.exit_log().last().unwrap().reason),
        BasicExitReason::EptViolation
    );
    // The unwind still ran in full.
    assert!(!hw.in_vmx_operation());
    assert_eq!(hw.irql(), 0);
    assert_eq!(arena.allocations() - allocations, arena.frees() - frees);
}
