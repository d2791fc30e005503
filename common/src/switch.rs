//! Momentary switch debounce and short/long press classification.
//!
//! ```text
//!            active                 held >= debounce
//! Released ─────────► Settling ─────────────────────► Pressed ──► Pressed(long fired)
//!    ▲                   │ inactive                      │ held >= long_press_interval
//!    └───────────────────┘                               │
//!    └──────────── inactive (Toggle unless long fired) ──┘
//! ```
//!
//! Press duration is measured from the first sample of the stable hold, not
//! from the instant the debounce completed.

use tracing::{debug, info};

use crate::types::{SwitchEvent, SwitchPressState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Released,
    Settling { since_ms: u64 },
    Pressed { since_ms: u64, long_fired: bool },
}

#[derive(Debug, Clone)]
pub struct SwitchMonitor {
    debounce_ms: u64,
    long_press_ms: Option<u64>,
    phase: Phase,
}

impl SwitchMonitor {
    pub fn new(debounce_ms: u64, long_press_ms: Option<u64>) -> Self {
        Self {
            debounce_ms,
            long_press_ms,
            phase: Phase::Released,
        }
    }

    pub fn debounce_ms(&self) -> u64 {
        self.debounce_ms
    }

    pub fn long_press_ms(&self) -> Option<u64> {
        self.long_press_ms
    }

    /// Feeds one sample of the (already polarity-corrected) input.
    pub fn sample(&mut self, now_ms: u64, active: bool) -> Option<SwitchEvent> {
        if !active {
            return self.release(now_ms);
        }

        if self.phase == Phase::Released {
            self.phase = Phase::Settling { since_ms: now_ms };
        }

        if let Phase::Settling { since_ms } = self.phase {
            if now_ms.saturating_sub(since_ms) < self.debounce_ms {
                return None;
            }
            debug!("switch press accepted after {}ms", now_ms.saturating_sub(since_ms));
            self.phase = Phase::Pressed {
                since_ms,
                long_fired: false,
            };
        }

        if let Phase::Pressed {
            since_ms,
            long_fired: false,
        } = self.phase
        {
            let held_ms = now_ms.saturating_sub(since_ms);
            if self.long_press_ms.is_some_and(|interval| held_ms >= interval) {
                info!("switch long press after {held_ms}ms");
                self.phase = Phase::Pressed {
                    since_ms,
                    long_fired: true,
                };
                return Some(SwitchEvent::LongPressFired);
            }
        }

        None
    }

    pub fn press_state(&self) -> SwitchPressState {
        match self.phase {
            Phase::Released | Phase::Settling { .. } => SwitchPressState::Released,
            Phase::Pressed {
                long_fired: true, ..
            } => SwitchPressState::PressedLongFired,
            Phase::Pressed { .. } if self.long_press_ms.is_none() => SwitchPressState::PressedShort,
            Phase::Pressed { .. } => SwitchPressState::PressedLongPending,
        }
    }

    pub fn reset(&mut self) {
        self.phase = Phase::Released;
    }

    fn release(&mut self, now_ms: u64) -> Option<SwitchEvent> {
        let previous = std::mem::replace(&mut self.phase, Phase::Released);
        match previous {
            Phase::Released => None,
            Phase::Settling { since_ms } => {
                debug!(
                    "very short press ({}ms), ignoring",
                    now_ms.saturating_sub(since_ms)
                );
                None
            }
            Phase::Pressed {
                long_fired: true, ..
            } => None,
            Phase::Pressed { since_ms, .. } => {
                debug!("switch short press of {}ms", now_ms.saturating_sub(since_ms));
                Some(SwitchEvent::ToggleRequested)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Samples `active` every `step_ms` from `start_ms` up to and including `end_ms`.
    fn hold(
        monitor: &mut SwitchMonitor,
        start_ms: u64,
        end_ms: u64,
        step_ms: u64,
        active: bool,
        events: &mut Vec<(u64, SwitchEvent)>,
    ) {
        let mut now = start_ms;
        while now <= end_ms {
            if let Some(event) = monitor.sample(now, active) {
                events.push((now, event));
            }
            now += step_ms;
        }
    }

    #[test]
    fn bounce_shorter_than_debounce_is_ignored() {
        let mut monitor = SwitchMonitor::new(50, Some(800));
        let mut events = Vec::new();

        hold(&mut monitor, 0, 40, 10, true, &mut events);
        hold(&mut monitor, 50, 100, 10, false, &mut events);

        assert!(events.is_empty());
        assert_eq!(monitor.press_state(), SwitchPressState::Released);
    }

    #[test]
    fn instability_restarts_debounce() {
        let mut monitor = SwitchMonitor::new(50, None);

        assert_eq!(monitor.sample(0, true), None);
        assert_eq!(monitor.sample(30, false), None);
        assert_eq!(monitor.sample(40, true), None);
        // Only 40ms stable since the bounce.
        assert_eq!(monitor.sample(80, true), None);
        assert_eq!(monitor.press_state(), SwitchPressState::Released);
        assert_eq!(monitor.sample(90, true), None);
        assert_eq!(monitor.press_state(), SwitchPressState::PressedShort);
    }

    #[test]
    fn short_press_toggles_on_release() {
        let mut monitor = SwitchMonitor::new(50, Some(800));
        let mut events = Vec::new();

        hold(&mut monitor, 0, 300, 20, true, &mut events);
        assert_eq!(monitor.press_state(), SwitchPressState::PressedLongPending);
        hold(&mut monitor, 320, 340, 20, false, &mut events);

        assert_eq!(events, vec![(320, SwitchEvent::ToggleRequested)]);
    }

    #[test]
    fn long_press_fires_once_and_suppresses_toggle() {
        let mut monitor = SwitchMonitor::new(50, Some(3_000));
        let mut events = Vec::new();

        hold(&mut monitor, 0, 3_500, 20, true, &mut events);
        assert_eq!(monitor.press_state(), SwitchPressState::PressedLongFired);
        hold(&mut monitor, 3_520, 4_000, 20, false, &mut events);

        assert_eq!(events, vec![(3_000, SwitchEvent::LongPressFired)]);
        assert_eq!(monitor.press_state(), SwitchPressState::Released);
    }

    #[test]
    fn without_long_press_interval_every_press_is_short() {
        let mut monitor = SwitchMonitor::new(50, None);
        let mut events = Vec::new();

        hold(&mut monitor, 0, 60_000, 100, true, &mut events);
        hold(&mut monitor, 60_100, 60_100, 100, false, &mut events);

        assert_eq!(events, vec![(60_100, SwitchEvent::ToggleRequested)]);
    }

    #[test]
    fn zero_debounce_accepts_first_sample() {
        let mut monitor = SwitchMonitor::new(0, Some(0));

        assert_eq!(monitor.sample(5, true), Some(SwitchEvent::LongPressFired));
        assert_eq!(monitor.sample(6, true), None);
        assert_eq!(monitor.sample(7, false), None);
    }

    #[test]
    fn reset_drops_press_in_progress() {
        let mut monitor = SwitchMonitor::new(10, Some(500));
        monitor.sample(0, true);
        monitor.sample(20, true);
        monitor.reset();

        assert_eq!(monitor.press_state(), SwitchPressState::Released);
        assert_eq!(monitor.sample(40, false), None);
    }
}
