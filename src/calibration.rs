use crate::{OwoError, Result};
use nalgebra::Quaternion;
use std::time::{Duration, Instant};

/// Time the operator gets to assume the calibration posture.
pub const PREPARE_DURATION: Duration = Duration::from_secs(5);

/// Time the calibration flag stays asserted while the operator holds still.
pub const HOLD_DURATION: Duration = Duration::from_secs(4);

/// The two operator-triggered calibration procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationKind {
    /// Yaw and position alignment ("full" calibration).
    Forward,
    /// Pitch/roll neutral alignment.
    Down,
}

/// Which calibration the pose engine is currently snapshotting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Idle,
    CalibratingForward,
    CalibratingDown,
}

/// Calibration flags and the rotations they produce.
///
/// At most one flag should be set at a time; callers are responsible for that.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationState {
    pub calibrating_forward: bool,
    pub calibrating_down: bool,
    pub global_rotation: Quaternion<f32>,
    pub local_rotation: Quaternion<f32>,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            calibrating_forward: false,
            calibrating_down: false,
            global_rotation: Quaternion::identity(),
            local_rotation: Quaternion::identity(),
        }
    }
}

impl CalibrationState {
    pub fn phase(&self) -> CalibrationPhase {
        if self.calibrating_forward {
            CalibrationPhase::CalibratingForward
        } else if self.calibrating_down {
            CalibrationPhase::CalibratingDown
        } else {
            CalibrationPhase::Idle
        }
    }

    pub fn set_calibrating(&mut self, kind: CalibrationKind, value: bool) {
        match kind {
            CalibrationKind::Forward => self.calibrating_forward = value,
            CalibrationKind::Down => self.calibrating_down = value,
        }
    }

    pub fn clear_flags(&mut self) {
        self.calibrating_forward = false;
        self.calibrating_down = false;
    }
}

/// Stage of a running calibration sequence, for status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStage {
    Idle,
    Preparing(CalibrationKind),
    Active(CalibrationKind),
}

/// Rotations captured by a finished calibration, ready to persist.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOutcome {
    pub kind: CalibrationKind,
    pub global_rotation: Quaternion<f32>,
    pub local_rotation: Quaternion<f32>,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Idle,
    Preparing { kind: CalibrationKind, until: Instant },
    Active { kind: CalibrationKind, until: Instant },
}

/// Timed driver for one calibration procedure.
///
/// Time is passed in explicitly; the owner polls it from its update loop.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationSequence {
    stage: Stage,
}

impl Default for CalibrationSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationSequence {
    pub fn new() -> Self {
        Self { stage: Stage::Idle }
    }

    pub fn stage(&self) -> SequenceStage {
        match self.stage {
            Stage::Idle => SequenceStage::Idle,
            Stage::Preparing { kind, .. } => SequenceStage::Preparing(kind),
            Stage::Active { kind, .. } => SequenceStage::Active(kind),
        }
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self.stage, Stage::Idle)
    }

    /// Start the preparation countdown.
    pub fn begin(&mut self, kind: CalibrationKind, now: Instant) -> Result<()> {
        if self.is_pending() {
            return Err(OwoError::CalibrationPending);
        }
        log::info!("{:?} calibration: get into position", kind);
        self.stage = Stage::Preparing {
            kind,
            until: now + PREPARE_DURATION,
        };
        Ok(())
    }

    /// Advance the sequence.
    ///
    /// `ready` tells whether the handler can still produce poses; if it cannot
    /// when preparation ends, the sequence is abandoned. Returns the captured
    /// rotations when the hold period completes.
    pub fn poll(
        &mut self,
        now: Instant,
        ready: bool,
        state: &mut CalibrationState,
    ) -> Option<CalibrationOutcome> {
        match self.stage {
            Stage::Idle => None,
            Stage::Preparing { kind, until } => {
                if now < until {
                    return None;
                }
                if !ready {
                    log::warn!("{:?} calibration aborted: handler not ready", kind);
                    self.abort(state);
                    return None;
                }
                log::info!("{:?} calibration: hold still", kind);
                state.set_calibrating(kind, true);
                self.stage = Stage::Active {
                    kind,
                    until: now + HOLD_DURATION,
                };
                None
            }
            Stage::Active { kind, until } => {
                if now < until {
                    return None;
                }
                state.set_calibrating(kind, false);
                self.stage = Stage::Idle;
                log::info!("{:?} calibration finished", kind);
                Some(CalibrationOutcome {
                    kind,
                    global_rotation: state.global_rotation,
                    local_rotation: state.local_rotation,
                })
            }
        }
    }

    /// Drop any running sequence and clear its flag.
    pub fn abort(&mut self, state: &mut CalibrationState) {
        match self.stage {
            Stage::Preparing { kind, .. } | Stage::Active { kind, .. } => {
                state.set_calibrating(kind, false);
            }
            Stage::Idle => {}
        }
        self.stage = Stage::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_from_flags() {
        let mut state = CalibrationState::default();
        assert_eq!(state.phase(), CalibrationPhase::Idle);
        state.set_calibrating(CalibrationKind::Down, true);
        assert_eq!(state.phase(), CalibrationPhase::CalibratingDown);
        state.clear_flags();
        state.set_calibrating(CalibrationKind::Forward, true);
        assert_eq!(state.phase(), CalibrationPhase::CalibratingForward);
    }

    #[test]
    fn test_sequence_timeline() {
        let start = Instant::now();
        let mut state = CalibrationState::default();
        let mut seq = CalibrationSequence::new();

        seq.begin(CalibrationKind::Forward, start).unwrap();
        assert_eq!(seq.stage(), SequenceStage::Preparing(CalibrationKind::Forward));

        // Still preparing just before the deadline.
        let t = start + PREPARE_DURATION - Duration::from_millis(1);
        assert!(seq.poll(t, true, &mut state).is_none());
        assert!(!state.calibrating_forward);

        let t = start + PREPARE_DURATION;
        assert!(seq.poll(t, true, &mut state).is_none());
        assert!(state.calibrating_forward);
        assert_eq!(seq.stage(), SequenceStage::Active(CalibrationKind::Forward));

        state.global_rotation = Quaternion::new(0.0, 0.0, 1.0, 0.0);
        let outcome = seq.poll(t + HOLD_DURATION, true, &mut state).unwrap();
        assert_eq!(outcome.kind, CalibrationKind::Forward);
        assert_eq!(outcome.global_rotation, Quaternion::new(0.0, 0.0, 1.0, 0.0));
        assert!(!state.calibrating_forward);
        assert!(!seq.is_pending());
    }

    #[test]
    fn test_second_begin_rejected() {
        let now = Instant::now();
        let mut seq = CalibrationSequence::new();
        seq.begin(CalibrationKind::Down, now).unwrap();
        assert!(matches!(
            seq.begin(CalibrationKind::Forward, now),
            Err(OwoError::CalibrationPending)
        ));
    }

    #[test]
    fn test_abort_when_not_ready() {
        let start = Instant::now();
        let mut state = CalibrationState::default();
        let mut seq = CalibrationSequence::new();
        seq.begin(CalibrationKind::Down, start).unwrap();

        assert!(seq.poll(start + PREPARE_DURATION, false, &mut state).is_none());
        assert!(!state.calibrating_down);
        assert_eq!(seq.stage(), SequenceStage::Idle);
    }
}
