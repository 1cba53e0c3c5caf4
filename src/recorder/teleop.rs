//! Leader-to-follower mirroring loop
//!
//! Runs on its own thread at a fixed cadence. Each tick reads the leader,
//! steps the follower toward it by at most `max_step` per joint, and reads
//! the follower back. The latest pair of positions is handed to the sampler
//! through a [`LatestSlot`].
//!
//! Fault handling:
//! - An unavailable leader read reuses the last leader position, up to
//!   `max_stale_ticks` times in a row. Past that the follower is held until
//!   the leader reports again.
//! - A `SourceFault` from either arm latches for the rest of the session and
//!   stops all follower commands. The follower keeps its last commanded
//!   position.

use super::config::TeleopConfig;
use super::slot::LatestSlot;
use super::state::{SessionEvent, StatusBoard};
use crate::capture::{ArmId, FollowerArm, JointSource, Sample};
use crate::episode::JointPosition;
use crate::utils::{ErrorResponse, SharedClock, SourceFault, TeleopFault, Ticker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::broadcast;

/// Latest arm state, as seen by the sampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmSnapshot {
    pub leader: JointPosition,
    pub follower: JointPosition,
    /// Leader held past the staleness bound
    pub leader_stale: bool,
    /// Either arm has faulted this session
    pub arm_fault: bool,
}

pub struct TeleopLoop {
    leader: Box<dyn JointSource>,
    follower: Box<dyn FollowerArm>,
    config: TeleopConfig,
    slot: Arc<LatestSlot<ArmSnapshot>>,
    board: Arc<StatusBoard>,
    events: broadcast::Sender<SessionEvent>,
    last_leader: Option<JointPosition>,
    last_follower: Option<JointPosition>,
    commanded: Option<JointPosition>,
    stale_ticks: u32,
    leader_fault: Option<SourceFault>,
    follower_fault: Option<SourceFault>,
    ticks: u64,
}

impl TeleopLoop {
    pub fn new(
        leader: Box<dyn JointSource>,
        follower: Box<dyn FollowerArm>,
        config: TeleopConfig,
        slot: Arc<LatestSlot<ArmSnapshot>>,
        board: Arc<StatusBoard>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            leader,
            follower,
            config,
            slot,
            board,
            events,
            last_leader: None,
            last_follower: None,
            commanded: None,
            stale_ticks: 0,
            leader_fault: None,
            follower_fault: None,
            ticks: 0,
        }
    }

    /// Give the arms back once the loop is done
    pub fn into_arms(self) -> (Box<dyn JointSource>, Box<dyn FollowerArm>) {
        (self.leader, self.follower)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Last position sent to the follower
    pub fn commanded(&self) -> Option<JointPosition> {
        self.commanded
    }

    fn leader_is_stale(&self) -> bool {
        self.stale_ticks > self.config.max_stale_ticks
    }

    /// Enable the follower for position control
    pub fn prepare(&mut self) -> Result<(), TeleopFault> {
        if let Err(fault) = self.follower.prepare() {
            return Err(self.latch(ArmId::Follower, fault));
        }
        tracing::info!("Follower prepared for mirroring");
        Ok(())
    }

    /// Run one mirroring step. Returns the position commanded this tick, if any.
    pub fn tick(&mut self) -> Result<Option<JointPosition>, TeleopFault> {
        self.ticks += 1;

        let result = match self.read_leader() {
            Ok(Some(target)) => self.mirror(&target),
            Ok(None) => Ok(None),
            Err(fault) => Err(fault),
        };

        self.read_follower();
        self.publish();
        result
    }

    fn read_leader(&mut self) -> Result<Option<JointPosition>, TeleopFault> {
        if let Some(fault) = &self.leader_fault {
            return Err(fault.clone().into());
        }

        match self.leader.sample() {
            Ok(Sample::Ready(position)) => {
                if self.leader_is_stale() {
                    tracing::info!("Leader input resumed after {} ticks", self.stale_ticks);
                    let _ = self
                        .events
                        .send(SessionEvent::Recovered("leader input resumed".to_string()));
                }
                self.stale_ticks = 0;
                self.last_leader = Some(position);
                Ok(Some(position))
            }
            Ok(Sample::Unavailable) => {
                self.stale_ticks += 1;
                if !self.leader_is_stale() {
                    return Ok(self.last_leader);
                }
                let fault = TeleopFault::StaleInput {
                    ticks: self.stale_ticks,
                };
                if self.stale_ticks == self.config.max_stale_ticks + 1 {
                    tracing::warn!("{}; holding follower", fault);
                    let _ = self.events.send(SessionEvent::Fault(ErrorResponse::from(&fault)));
                }
                Err(fault)
            }
            Err(fault) => Err(self.latch(ArmId::Leader, fault)),
        }
    }

    fn mirror(&mut self, target: &JointPosition) -> Result<Option<JointPosition>, TeleopFault> {
        if let Some(fault) = &self.follower_fault {
            return Err(fault.clone().into());
        }

        let current = match self.commanded.or(self.last_follower) {
            Some(current) => current,
            None => match self.follower.sample() {
                Ok(Sample::Ready(position)) => {
                    self.last_follower = Some(position);
                    position
                }
                // Cannot step safely without knowing where the follower is
                Ok(Sample::Unavailable) => return Ok(None),
                Err(fault) => return Err(self.latch(ArmId::Follower, fault)),
            },
        };

        let next = current.step_toward(target, self.config.max_step);
        if let Err(fault) = self.follower.command(&next) {
            return Err(self.latch(ArmId::Follower, fault));
        }
        self.commanded = Some(next);
        Ok(Some(next))
    }

    fn read_follower(&mut self) {
        if self.follower_fault.is_some() {
            return;
        }
        match self.follower.sample() {
            Ok(Sample::Ready(position)) => self.last_follower = Some(position),
            Ok(Sample::Unavailable) => {}
            Err(fault) => {
                self.latch(ArmId::Follower, fault);
            }
        }
    }

    fn latch(&mut self, arm: ArmId, fault: SourceFault) -> TeleopFault {
        tracing::error!("{} arm faulted, mirroring suspended: {}", arm, fault);
        let message = fault.to_string();
        match arm {
            ArmId::Leader => self.leader_fault = Some(fault.clone()),
            ArmId::Follower => self.follower_fault = Some(fault.clone()),
        }
        self.board.update(|status| match arm {
            ArmId::Leader => status.faults.leader_fault = Some(message),
            ArmId::Follower => status.faults.follower_fault = Some(message),
        });

        let fault = TeleopFault::Source(fault);
        let _ = self.events.send(SessionEvent::Fault(ErrorResponse::from(&fault)));
        fault
    }

    fn publish(&self) {
        let leader_stale = self.leader_is_stale();
        let ticks = self.ticks;
        self.board.update(|status| {
            status.teleop_ticks = ticks;
            status.faults.leader_stale = leader_stale;
        });

        // Nothing is handed over until both arms have reported once
        if let (Some(leader), Some(follower)) = (self.last_leader, self.last_follower) {
            self.slot.publish(ArmSnapshot {
                leader,
                follower,
                leader_stale,
                arm_fault: self.leader_fault.is_some() || self.follower_fault.is_some(),
            });
        }
    }

    /// Run on a dedicated thread until `running` is cleared. The loop is
    /// handed back on join.
    pub fn spawn(
        mut self,
        clock: SharedClock,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<TeleopLoop>> {
        let mut ticker = Ticker::from_rate(clock, self.config.rate_hz, Duration::MAX);
        std::thread::Builder::new()
            .name("teleop".to_string())
            .spawn(move || {
                tracing::info!("Teleop loop started at {} Hz", self.config.rate_hz);
                let _ = self.prepare();
                while running.load(Ordering::SeqCst) {
                    let timing = ticker.wait();
                    if timing.skipped > 0 {
                        tracing::debug!("Teleop loop skipped {} ticks", timing.skipped);
                    }
                    let _ = self.tick();
                }
                tracing::info!("Teleop loop stopped after {} ticks", self.ticks);
                self
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::sim::SimulatedRig;
    use crate::capture::BusArm;
    use crate::episode::PositionUnit;
    use crate::recorder::config::ArmConfig;

    struct Fixture {
        rig: SimulatedRig,
        teleop: TeleopLoop,
        slot: Arc<LatestSlot<ArmSnapshot>>,
        board: Arc<StatusBoard>,
        events: broadcast::Receiver<SessionEvent>,
    }

    fn fixture(config: TeleopConfig) -> Fixture {
        let rig = SimulatedRig::new();
        let timeout = config.read_timeout();
        let leader = BusArm::new(
            ArmId::Leader,
            Box::new(rig.bus()),
            &ArmConfig::leader(),
            PositionUnit::Ticks,
            timeout,
        );
        let follower = BusArm::new(
            ArmId::Follower,
            Box::new(rig.bus()),
            &ArmConfig::follower(),
            PositionUnit::Ticks,
            timeout,
        );
        let slot = Arc::new(LatestSlot::new());
        let board = Arc::new(StatusBoard::new());
        let (tx, events) = broadcast::channel(64);
        let teleop = TeleopLoop::new(
            Box::new(leader),
            Box::new(follower),
            config,
            slot.clone(),
            board.clone(),
            tx,
        );
        Fixture {
            rig,
            teleop,
            slot,
            board,
            events,
        }
    }

    #[test]
    fn test_step_change_is_mirrored_within_clamp() {
        let mut f = fixture(TeleopConfig {
            max_step: 40.0,
            ..TeleopConfig::default()
        });
        f.teleop.prepare().unwrap();
        assert!(f.rig.is_prepared(ArmId::Follower));

        let target = JointPosition::new([2048.0 + 1000.0, 2048.0 - 300.0, 2048.0, 2048.0, 2048.0, 2048.0 + 10.0]);
        f.rig.set_position(ArmId::Leader, target);

        let mut previous = f.rig.position(ArmId::Follower);
        let mut ticks = 0;
        while f.rig.position(ArmId::Follower) != target {
            f.teleop.tick().unwrap();
            let now = f.rig.position(ArmId::Follower);
            assert!(now.max_abs_delta(&previous) <= 40.0 + 1e-9);
            previous = now;
            ticks += 1;
            assert!(ticks <= 25, "follower did not converge");
        }
        // 1000 ticks at 40 per step
        assert_eq!(ticks, 25);

        let (_, snapshot) = f.slot.latest().unwrap();
        assert_eq!(snapshot.leader, target);
        assert_eq!(snapshot.follower, target);
        assert!(!snapshot.arm_fault);
    }

    #[test]
    fn test_stale_leader_holds_follower() {
        let mut f = fixture(TeleopConfig {
            max_stale_ticks: 2,
            ..TeleopConfig::default()
        });
        f.teleop.tick().unwrap();

        f.rig.set_position(ArmId::Leader, JointPosition::new([3000.0; 6]));
        f.rig.drop_reads(ArmId::Leader, 4);

        // Held leader value is reused while within the bound
        assert!(f.teleop.tick().unwrap().is_some());
        assert!(f.teleop.tick().unwrap().is_some());
        let writes = f.rig.writes(ArmId::Follower);

        assert_eq!(f.teleop.tick(), Err(TeleopFault::StaleInput { ticks: 3 }));
        assert_eq!(f.teleop.tick(), Err(TeleopFault::StaleInput { ticks: 4 }));
        assert_eq!(f.rig.writes(ArmId::Follower), writes);
        assert!(f.board.snapshot().faults.leader_stale);
        assert!(f.slot.latest().unwrap().1.leader_stale);

        // Leader reports again and mirroring picks up toward the new target
        let commanded = f.teleop.tick().unwrap().unwrap();
        assert_eq!(commanded.values()[0], 2048.0 + 40.0);
        assert!(!f.board.snapshot().faults.leader_stale);

        let mut saw_fault = false;
        let mut saw_recovery = false;
        while let Ok(event) = f.events.try_recv() {
            match event {
                SessionEvent::Fault(e) if e.code == "STALE_INPUT" => saw_fault = true,
                SessionEvent::Recovered(_) => saw_recovery = true,
                _ => {}
            }
        }
        assert!(saw_fault && saw_recovery);
    }

    #[test]
    fn test_follower_fault_freezes_follower() {
        let mut f = fixture(TeleopConfig::default());
        f.rig.set_position(ArmId::Leader, JointPosition::new([2500.0; 6]));
        f.teleop.tick().unwrap();
        f.teleop.tick().unwrap();
        let frozen = f.rig.position(ArmId::Follower);
        let writes = f.rig.writes(ArmId::Follower);

        f.rig.inject_fault(ArmId::Follower, "overload");
        assert!(matches!(f.teleop.tick(), Err(TeleopFault::Source(_))));

        // Latched even after the bus recovers
        f.rig.clear_fault(ArmId::Follower);
        for _ in 0..5 {
            assert!(matches!(f.teleop.tick(), Err(TeleopFault::Source(_))));
        }
        assert_eq!(f.rig.writes(ArmId::Follower), writes);
        assert_eq!(f.rig.position(ArmId::Follower), frozen);

        let status = f.board.snapshot();
        assert!(status.faults.follower_fault.unwrap().contains("overload"));
        assert!(f.slot.latest().unwrap().1.arm_fault);
    }

    #[test]
    fn test_nothing_published_until_both_arms_report() {
        let mut f = fixture(TeleopConfig::default());
        f.rig.drop_reads(ArmId::Leader, 1);
        assert_eq!(f.teleop.tick(), Ok(None));
        assert!(f.slot.latest().is_none());

        f.teleop.tick().unwrap();
        assert!(f.slot.latest().is_some());
    }

    #[test]
    fn test_spawned_loop_runs_and_returns() {
        let f = fixture(TeleopConfig {
            rate_hz: 200.0,
            ..TeleopConfig::default()
        });
        let running = Arc::new(AtomicBool::new(true));
        let handle = f
            .teleop
            .spawn(crate::utils::MonotonicClock::shared(), running.clone())
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::SeqCst);
        let teleop = handle.join().unwrap();
        assert!(teleop.ticks() > 0);
        assert!(f.rig.is_prepared(ArmId::Follower));
    }
}
