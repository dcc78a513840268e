//! Debate format: grid dimensions and the timed turn script

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SfuError};

/// Speaker key broadcast once the script has run out
pub const END_DEBATER: &str = "end";

/// Teams are lettered `a..=z` in seat keys
pub const MAX_TEAM_SIZE: usize = 26;
pub const MAX_ORDER_SIZE: usize = 16;
pub const MAX_RULES: usize = 256;
/// Longest single turn, in seconds
pub const MAX_TURN_SECS: u64 = 60 * 60;

/// One timed turn of the script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEntry {
    /// Seat key of the speaker, e.g. `team_a_1`
    pub debater: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    /// Turn length in seconds
    #[serde(default, skip_serializing_if = "is_zero")]
    pub time: u64,
}

const fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl RuleEntry {
    pub fn new(debater: impl Into<String>, msg: impl Into<String>, time: u64) -> Self {
        Self {
            debater: debater.into(),
            msg: msg.into(),
            time,
        }
    }

    /// The terminal `{"debater": "end"}` entry
    #[must_use]
    pub fn end() -> Self {
        Self::new(END_DEBATER, "", 0)
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        self.debater == END_DEBATER
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.time)
    }
}

fn default_team_size() -> usize {
    2
}

fn default_order_size() -> usize {
    3
}

/// A debate definition as supplied at room creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_team_size")]
    pub team_size: usize,
    #[serde(default = "default_order_size")]
    pub order_size: usize,
    pub rules: Arc<[RuleEntry]>,
}

impl Debate {
    /// Two teams of three with opening, cross-examination, rebuttal and
    /// closing turns of ten seconds each
    #[must_use]
    pub fn sample() -> Self {
        Self {
            name: "토론대회1".to_string(),
            description: "주제는 어쩌구 입니다 지금부터 토론을 시작하겠습니다.".to_string(),
            team_size: 2,
            order_size: 3,
            rules: vec![
                RuleEntry::new("team_a_1", "팀 A 입안", 10),
                RuleEntry::new("team_b_1", "팀 B 입안", 10),
                RuleEntry::new("team_a_2", "팀 A 교차질의", 10),
                RuleEntry::new("team_b_2", "팀 B 교차질의", 10),
                RuleEntry::new("team_a_3", "팀 A 반박", 10),
                RuleEntry::new("team_b_3", "팀 B 반박", 10),
                RuleEntry::new("team_a_1", "팀 A 마무리", 10),
                RuleEntry::new("team_b_1", "팀 B 마무리", 10),
            ]
            .into(),
        }
    }

    /// Number of seats in the grid
    #[must_use]
    pub const fn max_count(&self) -> usize {
        self.team_size.saturating_mul(self.order_size)
    }

    /// Total script length
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.rules.iter().map(RuleEntry::duration).sum()
    }

    /// Reject definitions a room cannot be built from. Runs before any
    /// engine resource is created.
    pub fn validate(&self) -> Result<()> {
        if self.team_size == 0 || self.order_size == 0 {
            return Err(SfuError::InvalidDebate(format!(
                "grid must have at least one seat, got {}x{}",
                self.team_size, self.order_size
            )));
        }
        if self.team_size > MAX_TEAM_SIZE || self.order_size > MAX_ORDER_SIZE {
            return Err(SfuError::InvalidDebate(format!(
                "grid {}x{} exceeds {MAX_TEAM_SIZE}x{MAX_ORDER_SIZE}",
                self.team_size, self.order_size
            )));
        }
        if self.rules.len() > MAX_RULES {
            return Err(SfuError::InvalidDebate(format!(
                "{} turns exceed the limit of {MAX_RULES}",
                self.rules.len()
            )));
        }
        if let Some(entry) = self.rules.iter().find(|entry| entry.time > MAX_TURN_SECS) {
            return Err(SfuError::InvalidDebate(format!(
                "turn for '{}' lasts {}s, longer than {MAX_TURN_SECS}s",
                entry.debater, entry.time
            )));
        }
        if let Some(entry) = self.rules.iter().find(|entry| entry.is_end()) {
            return Err(SfuError::InvalidDebate(format!(
                "'{}' is reserved and cannot be used as a turn",
                entry.debater
            )));
        }
        Ok(())
    }
}

impl Default for Debate {
    fn default() -> Self {
        Self::sample()
    }
}
