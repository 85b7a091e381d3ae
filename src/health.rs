//! Health classification from session telemetry.
//!
//! Pure functions: the caller supplies the current time, the thresholds, the
//! stored agent record, and a fresh probe of the live session.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::config::HealthSettings;
use crate::model::{AgentRecord, AgentStatus, HealthState};

static EXIT_STATUS_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\[metawsm\] agent command exited with status ([0-9]+)").ok()
});

/// What the session runner could observe about a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProbe {
    Missing,
    /// The runner failed in a way that says nothing about the session.
    Unknown,
    Alive {
        /// Epoch seconds of the last activity; 0 when unknown.
        activity_epoch: i64,
        /// Exit status printed by the session wrapper, if the agent command ended.
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub health: HealthState,
    pub status: AgentStatus,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl Classification {
    pub fn apply(&self, agent: &mut AgentRecord) {
        agent.health = self.health;
        agent.status = self.status;
        agent.last_activity_at = self.last_activity_at;
        agent.last_progress_at = self.last_progress_at;
    }
}

pub fn classify(
    now: DateTime<Utc>,
    thresholds: &HealthSettings,
    agent: &AgentRecord,
    probe: SessionProbe,
) -> Classification {
    let keep = |health, status| Classification {
        health,
        status,
        last_activity_at: agent.last_activity_at,
        last_progress_at: agent.last_progress_at,
    };

    let (activity_epoch, exit_code) = match probe {
        SessionProbe::Missing => return keep(HealthState::Dead, AgentStatus::Dead),
        SessionProbe::Unknown => {
            let status = match agent.status {
                AgentStatus::Dead | AgentStatus::Failed | AgentStatus::Stopped => AgentStatus::Idle,
                other => other,
            };
            let health = match agent.health {
                HealthState::Dead => HealthState::Idle,
                other => other,
            };
            return keep(health, status);
        }
        SessionProbe::Alive {
            activity_epoch,
            exit_code,
        } => (activity_epoch, exit_code),
    };

    match exit_code {
        Some(0) => return keep(HealthState::Idle, AgentStatus::Idle),
        Some(_) => return keep(HealthState::Dead, AgentStatus::Failed),
        None => {}
    }

    let last_activity = if activity_epoch > 0 {
        DateTime::from_timestamp(activity_epoch, 0).or(agent.last_activity_at)
    } else {
        agent.last_activity_at
    };
    // Progress only moves on lifecycle milestones, never on terminal activity.
    let last_progress = agent.last_progress_at;

    let age = |at: Option<DateTime<Utc>>| at.map(|t| now - t).unwrap_or_else(Duration::zero);
    let activity_age = age(last_activity);
    let progress_age = age(last_progress);

    let idle = seconds(thresholds.idle_seconds);
    let activity_stalled = seconds(thresholds.activity_stalled_seconds);
    let progress_stalled = seconds(thresholds.progress_stalled_seconds);

    let (health, status) = if activity_age >= activity_stalled
        || (progress_age > Duration::zero() && progress_age >= progress_stalled)
    {
        (HealthState::Stalled, AgentStatus::Stalled)
    } else if activity_age >= idle {
        (HealthState::Idle, AgentStatus::Idle)
    } else {
        (HealthState::Healthy, AgentStatus::Running)
    };

    Classification {
        health,
        status,
        last_activity_at: last_activity,
        last_progress_at: last_progress,
    }
}

fn seconds(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Exit status from the last wrapper line in captured pane text.
pub fn parse_exit_status(pane_text: &str) -> Option<i32> {
    let re = EXIT_STATUS_RE.as_ref()?;
    let caps = re.captures_iter(pane_text).last()?;
    caps.get(1)?.as_str().trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap()
    }

    fn agent(activity_secs_ago: Option<i64>, progress_secs_ago: Option<i64>) -> AgentRecord {
        AgentRecord {
            run_id: "run-1".to_string(),
            name: "agent".to_string(),
            workspace: "ws".to_string(),
            session_name: "agent-ws".to_string(),
            status: AgentStatus::Running,
            health: HealthState::Healthy,
            last_activity_at: activity_secs_ago.map(|s| now() - Duration::seconds(s)),
            last_progress_at: progress_secs_ago.map(|s| now() - Duration::seconds(s)),
        }
    }

    fn alive() -> SessionProbe {
        SessionProbe::Alive {
            activity_epoch: 0,
            exit_code: None,
        }
    }

    #[test]
    fn missing_session_is_dead_even_when_fresh() {
        let result = classify(now(), &HealthSettings::default(), &agent(Some(0), Some(0)), SessionProbe::Missing);
        assert_eq!(result.health, HealthState::Dead);
        assert_eq!(result.status, AgentStatus::Dead);
    }

    #[test]
    fn fresh_activity_is_healthy() {
        let result = classify(now(), &HealthSettings::default(), &agent(Some(10), Some(10)), alive());
        assert_eq!(result.health, HealthState::Healthy);
        assert_eq!(result.status, AgentStatus::Running);
    }

    #[test]
    fn old_progress_stalls_despite_fresh_activity() {
        let result = classify(now(), &HealthSettings::default(), &agent(Some(10), Some(1300)), alive());
        assert_eq!(result.health, HealthState::Stalled);
        assert_eq!(result.status, AgentStatus::Stalled);
    }

    #[test]
    fn activity_between_idle_and_stalled_is_idle() {
        let result = classify(now(), &HealthSettings::default(), &agent(Some(400), Some(400)), alive());
        assert_eq!(result.health, HealthState::Idle);
        assert_eq!(result.status, AgentStatus::Idle);
    }

    #[test]
    fn activity_past_stalled_threshold() {
        let result = classify(now(), &HealthSettings::default(), &agent(Some(900), Some(100)), alive());
        assert_eq!(result.health, HealthState::Stalled);
    }

    #[test]
    fn probe_activity_overrides_stored_activity() {
        let epoch = (now() - Duration::seconds(5)).timestamp();
        let probe = SessionProbe::Alive {
            activity_epoch: epoch,
            exit_code: None,
        };
        let result = classify(now(), &HealthSettings::default(), &agent(Some(2000), Some(60)), probe);
        assert_eq!(result.health, HealthState::Healthy);
        assert_eq!(result.last_activity_at.map(|t| t.timestamp()), Some(epoch));
        assert_eq!(
            result.last_progress_at,
            Some(now() - Duration::seconds(60))
        );
    }

    #[test]
    fn no_timestamps_counts_as_fresh() {
        let result = classify(now(), &HealthSettings::default(), &agent(None, None), alive());
        assert_eq!(result.health, HealthState::Healthy);
    }

    #[test]
    fn unknown_probe_revives_terminal_status_as_idle() {
        let mut record = agent(Some(10), Some(10));
        record.status = AgentStatus::Dead;
        record.health = HealthState::Dead;
        let result = classify(now(), &HealthSettings::default(), &record, SessionProbe::Unknown);
        assert_eq!(result.status, AgentStatus::Idle);
        assert_eq!(result.health, HealthState::Idle);

        record.status = AgentStatus::Stalled;
        record.health = HealthState::Stalled;
        let result = classify(now(), &HealthSettings::default(), &record, SessionProbe::Unknown);
        assert_eq!(result.status, AgentStatus::Stalled);
    }

    #[test]
    fn exit_status_decides_before_ages() {
        let failed = SessionProbe::Alive {
            activity_epoch: 0,
            exit_code: Some(2),
        };
        let result = classify(now(), &HealthSettings::default(), &agent(Some(1), Some(1)), failed);
        assert_eq!(result.health, HealthState::Dead);
        assert_eq!(result.status, AgentStatus::Failed);

        let clean = SessionProbe::Alive {
            activity_epoch: 0,
            exit_code: Some(0),
        };
        let result = classify(now(), &HealthSettings::default(), &agent(Some(1), Some(1)), clean);
        assert_eq!(result.status, AgentStatus::Idle);
    }

    #[test]
    fn parses_last_exit_line() {
        let pane = "\
$ make\n\
[metawsm] agent command exited with status 0 at 2026-01-01T00:00:00+00:00\n\
$ make test\n\
[metawsm] agent command exited with status 3 at 2026-01-01T00:05:00+00:00\n";
        assert_eq!(parse_exit_status(pane), Some(3));
        assert_eq!(parse_exit_status("still working"), None);
    }
}
