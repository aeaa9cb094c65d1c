use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use genlock_phy::{
    Phy, PhyController, PhyOps, PllRegistry, ProgramFlags, Regmap, RegisterAccess, SessionState,
    ShutdownSignal, SyncConfig, ThreadScheduler,
};

const LINK_M1_B: u32 = 0x61040;
const LINK_N1_B: u32 = 0x61044;

#[derive(Default)]
struct Registers(Mutex<HashMap<u32, u32>>);

impl Registers {
    fn get(&self, offset: u32) -> u32 {
        self.0.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }
}

impl RegisterAccess for Registers {
    fn read32(&self, offset: u32) -> u32 {
        self.get(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.0.lock().unwrap().insert(offset, value);
    }
}

fn init() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

fn session(m: u32) -> (Arc<Registers>, PhyController) {
    init();
    let regs = Arc::new(Registers::default());
    regs.write32(LINK_M1_B, m);
    regs.write32(LINK_N1_B, 0x0008_0000);

    let regmap = Regmap::from_arc(regs.clone());
    let phy = Phy::new_dp_m_n(1, &regmap, &PllRegistry::new()).unwrap();
    let ctl = PhyController::with_shutdown(
        phy,
        Arc::new(ThreadScheduler::new()),
        ShutdownSignal::new(),
    );
    (regs, ctl)
}

#[test]
fn rollback_timer_restores_link_m() {
    let (regs, ctl) = session(200_000);
    assert_eq!(ctl.get_pll_clock(), Ok(200_000.0));

    // 0.2 ms of drift at 1 % arms a 20 ms rollback.
    ctl.program_phy(0.2, 1.0, 0.0, 1000, 0, true, true).unwrap();
    assert_eq!(regs.get(LINK_M1_B), 198_000);
    assert!(!ctl.is_done());

    assert!(ctl.wait_until_done_timeout(Duration::from_secs(2)));
    assert_eq!(ctl.state(), SessionState::Done);
    assert_eq!(regs.get(LINK_M1_B), 200_000);
    assert_eq!(regs.get(LINK_N1_B), 0x0008_0000);
}

#[test]
fn cancel_beats_the_timer() {
    let (regs, ctl) = session(200_000);
    let config = SyncConfig {
        shift: 1.0,
        wait_between_steps_ms: 0,
        ..SyncConfig::default()
    };

    // 10 ms of drift keeps the timer armed for a full second.
    ctl.program_with(10.0, &config).unwrap();
    assert_eq!(ctl.state(), SessionState::ArmedForRollback);

    assert!(ctl.cancel());
    assert!(ctl.is_done());
    assert_eq!(regs.get(LINK_M1_B), 200_000);
    assert!(!ctl.cancel());
}

#[test]
fn without_auto_reset_the_change_sticks() {
    let (regs, ctl) = session(100_000);
    let config = SyncConfig {
        shift: 0.5,
        flags: ProgramFlags::COMMIT,
        ..SyncConfig::default()
    };

    ctl.program_with(-1.0, &config).unwrap();
    ctl.wait_until_done();
    assert_eq!(regs.get(LINK_M1_B), 100_500);
    assert_eq!(ctl.pll_freq_orig(), 100_000.0);
}

#[test]
fn second_session_on_same_pipe_conflicts() {
    init();
    let regs = Arc::new(Registers::default());
    let regmap = Regmap::from_arc(regs);
    let registry = PllRegistry::new();

    let first = Phy::new_dp_m_n(0, &regmap, &registry).unwrap();
    assert!(Phy::new_dp_m_n(0, &regmap, &registry).is_err());
    assert_eq!(first.kind(), genlock_phy::PhyType::DpMn);
}
