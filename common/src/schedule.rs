use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::{ConfigError, SolarError},
    solar::{SunCalculator, SunEvent},
    types::{DeviceState, ScheduleIntent},
};

/// Longest randomisation window and largest sun offset accepted, in minutes.
pub const MAX_WINDOW_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    TimeOfDay(NaiveTime),
    Sun { event: SunEvent, offset_minutes: i32 },
}

impl FromStr for Anchor {
    type Err = ConfigError;

    /// Accepts `HH:MM[:SS]`, `sunrise[+N|-N]` and `sunset[+N|-N]` (N in minutes).
    fn from_str(trigger: &str) -> Result<Self, Self::Err> {
        let illegal = || ConfigError::IllegalTrigger(trigger.to_string());
        let trimmed = trigger.trim();

        for (prefix, event) in [("sunrise", SunEvent::Sunrise), ("sunset", SunEvent::Sunset)] {
            let Some(rest) = trimmed.strip_prefix(prefix) else {
                continue;
            };
            if rest.is_empty() {
                return Ok(Self::Sun {
                    event,
                    offset_minutes: 0,
                });
            }
            if !rest.starts_with(['+', '-']) {
                return Err(illegal());
            }
            let offset_minutes = rest.parse::<i32>().map_err(|_| illegal())?;
            if offset_minutes.unsigned_abs() > MAX_WINDOW_MINUTES {
                return Err(illegal());
            }
            return Ok(Self::Sun {
                event,
                offset_minutes,
            });
        }

        let time = match trimmed.matches(':').count() {
            1 => NaiveTime::parse_from_str(trimmed, "%H:%M"),
            2 => NaiveTime::parse_from_str(trimmed, "%H:%M:%S"),
            _ => return Err(illegal()),
        };
        time.map(Self::TimeOfDay).map_err(|_| illegal())
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeOfDay(time) => write!(f, "{}", time.format("%H:%M:%S")),
            Self::Sun {
                event,
                offset_minutes: 0,
            } => f.write_str(event.as_str()),
            Self::Sun {
                event,
                offset_minutes,
            } => write!(f, "{}{offset_minutes:+}", event.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleRule {
    pub anchor: Anchor,
    pub action: DeviceState,
    pub window: Duration,
}

impl ScheduleRule {
    pub fn parse(
        trigger: &str,
        random_minutes: u32,
        action: DeviceState,
    ) -> Result<Self, ConfigError> {
        if random_minutes > MAX_WINDOW_MINUTES {
            return Err(ConfigError::WindowTooLarge(random_minutes));
        }
        Ok(Self {
            anchor: trigger.parse()?,
            action,
            window: Duration::minutes(i64::from(random_minutes)),
        })
    }

    pub fn needs_coordinates(&self) -> bool {
        matches!(self.anchor, Anchor::Sun { .. })
    }
}

impl fmt::Display for ScheduleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.anchor, self.action.as_str())?;
        if self.window > Duration::zero() {
            write!(f, " (+0..{}min)", self.window.num_minutes())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RuleSlot {
    fire_at: Option<DateTime<Utc>>,
    fired: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RuleStatus {
    #[serde(rename = "ruleId")]
    pub rule_id: usize,
    pub trigger: String,
    pub action: DeviceState,
    #[serde(rename = "fireAtEpoch")]
    pub fire_at_epoch: Option<i64>,
    pub fired: bool,
}

/// Daily schedule engine.
///
/// Each rule gets one resolved fire time per local calendar date, drawn once
/// and cached. A rule fires on the first enabled tick at or after that time
/// and then stays quiet until the date rolls over.
pub struct Scheduler {
    rules: Vec<ScheduleRule>,
    timezone: Tz,
    sun: Box<dyn SunCalculator>,
    rng: StdRng,
    enabled: bool,
    day: Option<NaiveDate>,
    slots: Vec<RuleSlot>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("rules", &self.rules)
            .field("timezone", &self.timezone)
            .field("enabled", &self.enabled)
            .field("day", &self.day)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        rules: Vec<ScheduleRule>,
        timezone: Tz,
        sun: Box<dyn SunCalculator>,
        enabled: bool,
    ) -> Self {
        Self::with_rng(rules, timezone, sun, enabled, StdRng::from_entropy())
    }

    pub fn with_rng(
        rules: Vec<ScheduleRule>,
        timezone: Tz,
        sun: Box<dyn SunCalculator>,
        enabled: bool,
        rng: StdRng,
    ) -> Self {
        let slots = vec![RuleSlot::default(); rules.len()];
        Self {
            rules,
            timezone,
            sun,
            rng,
            enabled,
            day: None,
            slots,
        }
    }

    pub fn rules(&self) -> &[ScheduleRule] {
        &self.rules
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns true when the flag actually changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.enabled == enabled {
            return false;
        }
        self.enabled = enabled;
        true
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<ScheduleIntent> {
        let today = self.local_date(now);
        if self.day != Some(today) {
            self.reset_for_day(today, now);
        }

        if !self.enabled {
            return Vec::new();
        }

        let mut intents = Vec::new();
        for (rule_id, (rule, slot)) in self.rules.iter().zip(self.slots.iter_mut()).enumerate() {
            let Some(fire_at) = slot.fire_at else {
                continue;
            };
            if slot.fired || now < fire_at {
                continue;
            }
            slot.fired = true;
            info!("schedule rule {rule_id} [{rule}] fired");
            intents.push(ScheduleIntent {
                rule_id,
                action: rule.action,
            });
        }
        intents
    }

    /// Anchor instant of `rule` on local `date`, before randomisation.
    pub fn base_time(
        &self,
        rule: &ScheduleRule,
        date: NaiveDate,
    ) -> Result<DateTime<Utc>, SolarError> {
        match rule.anchor {
            Anchor::TimeOfDay(time) => Ok(local_instant(self.timezone, date.and_time(time))),
            Anchor::Sun {
                event,
                offset_minutes,
            } => {
                let instant = self.sun.event_time(date, event)?;
                Ok(instant + Duration::minutes(i64::from(offset_minutes)))
            }
        }
    }

    /// Draws a fresh fire time for `rule` on local `date`.
    ///
    /// The result lies in `[base, base + window]`, clamped to the last second
    /// of the local day so the rule still fires on the date it belongs to.
    pub fn resolve_fire_time(
        &mut self,
        rule: &ScheduleRule,
        date: NaiveDate,
    ) -> Result<DateTime<Utc>, SolarError> {
        let base = self.base_time(rule, date)?;
        let window_secs = rule.window.num_seconds();
        let jitter = if window_secs > 0 {
            Duration::seconds(self.rng.gen_range(0..=window_secs))
        } else {
            Duration::zero()
        };

        let end_of_day = date
            .and_hms_opt(23, 59, 59)
            .map(|naive| local_instant(self.timezone, naive));
        let fire_at = base + jitter;
        Ok(match end_of_day {
            Some(end) if fire_at > end => end,
            _ => fire_at,
        })
    }

    pub fn status(&self) -> Vec<RuleStatus> {
        self.rules
            .iter()
            .zip(&self.slots)
            .enumerate()
            .map(|(rule_id, (rule, slot))| RuleStatus {
                rule_id,
                trigger: rule.anchor.to_string(),
                action: rule.action,
                fire_at_epoch: slot.fire_at.map(|at| at.timestamp()),
                fired: slot.fired,
            })
            .collect()
    }

    pub fn next_event_epoch(&self, now: DateTime<Utc>) -> Option<i64> {
        if !self.enabled {
            return None;
        }
        self.slots
            .iter()
            .filter(|slot| !slot.fired)
            .filter_map(|slot| slot.fire_at)
            .filter(|at| *at >= now)
            .min()
            .map(|at| at.timestamp())
    }

    fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    /// Resolves every rule for `date`. At startup, rules already in the past
    /// count as fired so a restart does not replay the day. On a rollover only
    /// times that fall before the local midnight of `date` count as past.
    fn reset_for_day(&mut self, date: NaiveDate, now: DateTime<Utc>) {
        let past_before = if self.day.is_none() {
            now
        } else {
            local_instant(self.timezone, date.and_time(NaiveTime::MIN))
        };
        for rule_id in 0..self.rules.len() {
            let rule = self.rules[rule_id];
            let slot = match self.resolve_fire_time(&rule, date) {
                Ok(fire_at) => {
                    debug!(
                        "schedule rule {rule_id} [{rule}] resolved for {date}: {}",
                        fire_at.with_timezone(&self.timezone).format("%H:%M:%S %Z")
                    );
                    RuleSlot {
                        fire_at: Some(fire_at),
                        fired: fire_at < past_before,
                    }
                }
                Err(err) => {
                    warn!("schedule rule {rule_id} [{rule}] skipped for {date}: {err}");
                    RuleSlot::default()
                }
            };
            self.slots[rule_id] = slot;
        }
        self.day = Some(date);
    }
}

/// Maps a local wall-clock time to an instant. Ambiguous times take the
/// earlier instant; times inside a DST gap move to the end of the gap.
fn local_instant(timezone: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = naive;
    for _ in 0..=(3 * 60) {
        match timezone.from_local_datetime(&candidate) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                return dt.with_timezone(&Utc);
            }
            LocalResult::None => candidate += Duration::minutes(1),
        }
    }
    // No zone has a gap this long; fall back to treating the time as UTC.
    naive.and_utc()
}
