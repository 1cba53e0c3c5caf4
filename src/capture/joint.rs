//! Arm adapter over a motor bus
//!
//! Converts between the raw encoder ticks the bus speaks and the session's
//! position unit, and clamps every command to the configured raw limits.

use super::traits::{ArmId, JointActuator, JointSource, MotorBus, Sample, SampleResult};
use crate::episode::{JointMap, JointPosition, PositionUnit};
use crate::recorder::config::{ArmConfig, JointCalibration, JointLimits};
use crate::utils::SourceFault;
use std::time::Duration;

/// One arm on its motor bus
pub struct BusArm {
    arm: ArmId,
    bus: Box<dyn MotorBus>,
    calibration: JointMap<JointCalibration>,
    limits: JointMap<JointLimits>,
    unit: PositionUnit,
    timeout: Duration,
}

impl BusArm {
    pub fn new(
        arm: ArmId,
        bus: Box<dyn MotorBus>,
        config: &ArmConfig,
        unit: PositionUnit,
        timeout: Duration,
    ) -> Self {
        Self {
            arm,
            bus,
            calibration: config.calibration,
            limits: config.limits,
            unit,
            timeout,
        }
    }

    pub fn unit(&self) -> PositionUnit {
        self.unit
    }

    /// Raw ticks to session units
    pub fn to_session(&self, raw: &JointPosition) -> JointPosition {
        match self.unit {
            PositionUnit::Ticks => *raw,
            PositionUnit::Radians => {
                raw.map(|joint, ticks| self.calibration[joint].ticks_to_radians(ticks))
            }
        }
    }

    /// Session units to raw ticks, clamped to each joint's limits
    pub fn to_raw(&self, position: &JointPosition) -> JointPosition {
        position.map(|joint, value| {
            let raw = match self.unit {
                PositionUnit::Ticks => value,
                PositionUnit::Radians => self.calibration[joint].radians_to_ticks(value),
            };
            self.limits[joint].clamp(raw)
        })
    }
}

impl JointSource for BusArm {
    fn arm(&self) -> ArmId {
        self.arm
    }

    fn sample(&mut self) -> SampleResult<JointPosition> {
        match self.bus.read_positions(self.arm, self.timeout)? {
            Sample::Ready(raw) => Ok(Sample::Ready(self.to_session(&raw))),
            Sample::Unavailable => Ok(Sample::Unavailable),
        }
    }
}

impl JointActuator for BusArm {
    fn prepare(&mut self) -> Result<(), SourceFault> {
        tracing::debug!("Preparing {} arm for position control", self.arm);
        self.bus.prepare(self.arm)
    }

    fn command(&mut self, target: &JointPosition) -> Result<(), SourceFault> {
        if target.values().iter().any(|v| !v.is_finite()) {
            return Err(SourceFault::new(
                self.arm.name(),
                format!("refusing non-finite target {:?}", target.values()),
            ));
        }
        let raw = self.to_raw(target);
        self.bus.write_positions(self.arm, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::Joint;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorded {
        reads: Vec<JointPosition>,
        writes: Vec<JointPosition>,
    }

    struct FakeBus(Arc<Mutex<Recorded>>);

    impl MotorBus for FakeBus {
        fn read_positions(&mut self, _arm: ArmId, _timeout: Duration) -> SampleResult<JointPosition> {
            Ok(match self.0.lock().reads.pop() {
                Some(p) => Sample::Ready(p),
                None => Sample::Unavailable,
            })
        }

        fn write_positions(
            &mut self,
            _arm: ArmId,
            position: &JointPosition,
        ) -> Result<(), SourceFault> {
            self.0.lock().writes.push(*position);
            Ok(())
        }
    }

    fn arm(unit: PositionUnit, config: &ArmConfig) -> (BusArm, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let bus = Box::new(FakeBus(recorded.clone()));
        (
            BusArm::new(ArmId::Follower, bus, config, unit, Duration::from_millis(5)),
            recorded,
        )
    }

    #[test]
    fn test_commands_are_clamped_to_limits() {
        let mut config = ArmConfig::follower();
        config.limits[Joint::Gripper] = JointLimits {
            min: 1000.0,
            max: 3000.0,
        };
        let (mut follower, recorded) = arm(PositionUnit::Ticks, &config);

        follower
            .command(&JointPosition::new([-5.0, 5000.0, 10.0, 20.0, 30.0, 3500.0]))
            .unwrap();

        let written = recorded.lock().writes[0];
        assert_eq!(written.values(), &[0.0, 4095.0, 10.0, 20.0, 30.0, 3000.0]);
    }

    #[test]
    fn test_radians_convert_at_the_boundary() {
        let config = ArmConfig::leader();
        let (mut leader, recorded) = arm(PositionUnit::Radians, &config);
        recorded.lock().reads.push(JointPosition::new([2048.0; 6]));

        let sample = leader.sample().unwrap().ready().unwrap();
        assert!(sample.values().iter().all(|v| v.abs() < 1e-12));

        leader.command(&JointPosition::new([0.0; 6])).unwrap();
        assert_eq!(recorded.lock().writes[0].values(), &[2048.0; 6]);

        assert_eq!(leader.sample().unwrap(), Sample::Unavailable);
    }

    #[test]
    fn test_rejects_non_finite_target() {
        let (mut follower, recorded) = arm(PositionUnit::Ticks, &ArmConfig::follower());
        let fault = follower
            .command(&JointPosition::new([f64::NAN, 0.0, 0.0, 0.0, 0.0, 0.0]))
            .unwrap_err();
        assert_eq!(fault.source_name, "follower");
        assert!(recorded.lock().writes.is_empty());
    }
}
