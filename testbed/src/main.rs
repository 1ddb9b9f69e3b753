//! Runs both interception variants over the simulated platform.

use log::LevelFilter;
use testbed::{
    arena::Arena,
    guest::{GuestProgram, HOOK_FUNCTION, TARGET_FUNCTION},
    hardware::{standard_msrs, SimulatedVmx},
    trace,
};
use visor::{
    addressing::PAGE_SIZE,
    mtrr::MtrrRanges,
    platform::KernelMemory,
    vm::{MappingPolicy, SessionConfig, VmSession},
    vmexits::{InterceptDispatcher, InterceptPlan, InterceptStrategy},
};

const SYSTEM_EXTENT: usize = 0x4000_0000;

fn run_variant(strategy: InterceptStrategy) {
    let mut arena = Arena::new();
    let code = arena.allocate(PAGE_SIZE, true, false).expect("arena exhausted").va;
    let target = arena.allocate(PAGE_SIZE, true, false).expect("arena exhausted").va;
    let hook = arena.allocate(PAGE_SIZE, true, false).expect("arena exhausted").va;
    arena.write_bytes(target, &TARGET_FUNCTION);
    arena.write_bytes(hook, &HOOK_FUNCTION);

    let mut hw = SimulatedVmx::new(arena.address_map(), arena.host_root(), standard_msrs());
    let (program, mapping) = match strategy {
        InterceptStrategy::HookRedirect => (
            GuestProgram::call_through(code, target),
            MappingPolicy::PerAddress(vec![code, target, hook]),
        ),
        InterceptStrategy::ExecSplit => (
            GuestProgram::checked_call(code, target),
            MappingPolicy::FullSystem {
                extent: SYSTEM_EXTENT,
            },
        ),
    };
    hw.load_guest(program);

    let config = SessionConfig {
        guest_entry: code,
        mapping,
    };
    let oracle = MtrrRanges::load(&hw);
    let mut session =
        VmSession::prepare(&mut arena, &hw, &config, &oracle).expect("session preparation failed");
    let mut dispatcher = InterceptDispatcher::with_plan(
        InterceptPlan {
            strategy,
            target,
            hook,
        },
        2,
    );
    match session.run(&mut arena, &mut hw, &mut dispatcher, &config) {
        Ok(report) => log::info!(
            "session finished after {} halts; guest status {:?}",
            report.halts,
            report.guest_status
        ),
        Err(e) => log::error!("session failed: {:?}", e),
    }
}

fn main() {
    trace::init(LevelFilter::Debug);
    log::info!("=== function hook via translation redirection ===");
    run_variant(InterceptStrategy::HookRedirect);
    log::info!("=== execute splitting via violation exits ===");
    run_variant(InterceptStrategy::ExecSplit);
}
