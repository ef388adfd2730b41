//! Signal-level primitives shared by every clocked component.
//!
//! Hardware has two things ordinary software lacks: lines that may be left
//! undriven, and inputs that change asynchronously to the local clock. The
//! types here model both explicitly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum depth of an input synchronizer
pub const MAX_SYNC_STAGES: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("synchronizer depth must be between 1 and {max}, got {0}", max = MAX_SYNC_STAGES)]
    Depth(usize),
}

/// A line (or group of lines) that is either driven with a value or released.
///
/// `value` is meaningless while `drive` is false; it is kept so that traces
/// show what the output register holds even while the buffer is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Tristate<T> {
    pub value: T,
    pub drive: bool,
}

/// Outcome of resolving two parties on a shared line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved<T> {
    pub value: T,
    /// Both sides drove the line in the same tick
    pub conflict: bool,
}

impl<T: Copy> Tristate<T> {
    pub fn driven(value: T) -> Self {
        Self { value, drive: true }
    }

    /// Released output that still remembers its register value
    pub fn released(value: T) -> Self {
        Self {
            value,
            drive: false,
        }
    }

    /// The driven value, or `None` when released
    pub fn level(&self) -> Option<T> {
        self.drive.then_some(self.value)
    }

    /// Resolve this driver against another one on the same line.
    ///
    /// When nobody drives, the line floats to `idle` (the pull-up level).
    /// When both drive, `self` wins and the conflict is reported.
    pub fn resolve_with(&self, other: &Tristate<T>, idle: T) -> Resolved<T> {
        match (self.drive, other.drive) {
            (true, true) => Resolved {
                value: self.value,
                conflict: true,
            },
            (true, false) => Resolved {
                value: self.value,
                conflict: false,
            },
            (false, true) => Resolved {
                value: other.value,
                conflict: false,
            },
            (false, false) => Resolved {
                value: idle,
                conflict: false,
            },
        }
    }
}

impl Tristate<bool> {
    /// Open-drain line: any party driving low pulls the line low, drive
    /// conflicts cannot happen.
    pub fn wired_and(&self, other: &Tristate<bool>) -> bool {
        let low = |t: &Tristate<bool>| t.drive && !t.value;
        !(low(self) || low(other))
    }
}

/// Transition between two consecutive samples of a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    None,
    Rising,
    Falling,
}

impl Edge {
    pub fn between(previous: bool, current: bool) -> Self {
        match (previous, current) {
            (false, true) => Edge::Rising,
            (true, false) => Edge::Falling,
            _ => Edge::None,
        }
    }
}

/// Chain of registers that moves an asynchronous input into the local clock
/// domain.
///
/// With `N` stages, a value presented at tick `t` is returned by `clock` at
/// tick `t + N`. Even a single stage registers the pin for one full tick;
/// the delay is part of the timing contract and is never short-circuited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synchronizer<T> {
    stages: [T; MAX_SYNC_STAGES],
    depth: usize,
    /// What the last stage held before the most recent clock
    visible: T,
}

impl<T: Copy> Synchronizer<T> {
    /// Create a synchronizer with every stage preloaded to `initial`.
    pub fn new(depth: usize, initial: T) -> Result<Self, SyncError> {
        if depth == 0 || depth > MAX_SYNC_STAGES {
            return Err(SyncError::Depth(depth));
        }
        Ok(Self {
            stages: [initial; MAX_SYNC_STAGES],
            depth,
            visible: initial,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Clock the chain: the last stage moves to the output, every stage
    /// shifts forward and `input` is loaded into the first.
    pub fn clock(&mut self, input: T) -> T {
        self.visible = self.stages[self.depth - 1];
        for i in (1..self.depth).rev() {
            self.stages[i] = self.stages[i - 1];
        }
        self.stages[0] = input;
        self.visible
    }

    /// The synchronized value returned by the last `clock`
    pub fn output(&self) -> T {
        self.visible
    }

    /// Force every stage to `value`
    pub fn preload(&mut self, value: T) {
        self.stages = [value; MAX_SYNC_STAGES];
        self.visible = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_single_driver() {
        let bus = Tristate::driven(0x1234u16);
        let other = Tristate::released(0xAAAAu16);
        let r = bus.resolve_with(&other, 0xFFFF);
        assert_eq!(r.value, 0x1234);
        assert!(!r.conflict);

        let r = other.resolve_with(&bus, 0xFFFF);
        assert_eq!(r.value, 0x1234);
        assert!(!r.conflict);
    }

    #[test]
    fn test_resolve_floating_line() {
        let a = Tristate::released(0u16);
        let b = Tristate::released(0u16);
        assert_eq!(a.resolve_with(&b, 0xFFFF).value, 0xFFFF);
    }

    #[test]
    fn test_resolve_conflict() {
        let a = Tristate::driven(1u16);
        let b = Tristate::driven(2u16);
        let r = a.resolve_with(&b, 0);
        assert!(r.conflict);
        assert_eq!(r.value, 1);
    }

    #[test]
    fn test_wired_and() {
        let idle = Tristate::released(false);
        let low = Tristate::driven(false);
        let high = Tristate::driven(true);
        assert!(idle.wired_and(&idle));
        assert!(!idle.wired_and(&low));
        assert!(!low.wired_and(&high));
        assert!(high.wired_and(&idle));
    }

    #[test]
    fn test_level() {
        assert_eq!(Tristate::driven(7u8).level(), Some(7));
        assert_eq!(Tristate::released(7u8).level(), None);
    }

    #[test]
    fn test_edge_detection() {
        assert_eq!(Edge::between(false, true), Edge::Rising);
        assert_eq!(Edge::between(true, false), Edge::Falling);
        assert_eq!(Edge::between(true, true), Edge::None);
        assert_eq!(Edge::between(false, false), Edge::None);
    }

    #[test]
    fn test_synchronizer_rejects_bad_depth() {
        assert_eq!(Synchronizer::new(0, false), Err(SyncError::Depth(0)));
        assert_eq!(Synchronizer::new(5, false), Err(SyncError::Depth(5)));
        assert!(Synchronizer::new(1, false).is_ok());
        assert!(Synchronizer::new(4, false).is_ok());
    }

    #[test]
    fn test_two_stage_delay() {
        let mut sync = Synchronizer::new(2, false).unwrap();
        let outputs: Vec<bool> = (0..3).map(|_| sync.clock(true)).collect();
        assert_eq!(outputs, vec![false, false, true]);
        assert!(sync.output());
    }

    #[test]
    fn test_single_stage_still_registers() {
        let mut sync = Synchronizer::new(1, 0u16).unwrap();
        assert_eq!(sync.clock(0xBEEF), 0);
        assert_eq!(sync.output(), 0);
        assert_eq!(sync.clock(0x1234), 0xBEEF);
        assert_eq!(sync.clock(0x1234), 0x1234);
    }

    #[test]
    fn test_delay_matches_depth() {
        for depth in 1..=MAX_SYNC_STAGES {
            let mut sync = Synchronizer::new(depth, false).unwrap();
            let first_high = (0..8).position(|_| sync.clock(true));
            assert_eq!(first_high, Some(depth), "depth {}", depth);
        }
    }

    #[test]
    fn test_glitch_shorter_than_depth_still_propagates_in_order() {
        let mut sync = Synchronizer::new(3, false).unwrap();
        let outputs: Vec<bool> = [true, false, false, false, false]
            .iter()
            .map(|&v| sync.clock(v))
            .collect();
        assert_eq!(outputs, vec![false, false, false, true, false]);
    }

    #[test]
    fn test_preload() {
        let mut sync = Synchronizer::new(2, true).unwrap();
        sync.preload(false);
        assert!(!sync.output());
        assert!(!sync.clock(true));
    }
}
