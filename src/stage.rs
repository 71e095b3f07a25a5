use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Curriculum Stages
// =============================================================================

/// Curriculum stages in training order. The discriminant is the stage id
/// written into monitor logs and used as the critic's scalar action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Stage {
    TeacherForcedBalance = 0,
    Balance = 1,
    Walk = 2,
}

impl Stage {
    pub const COUNT: usize = 3;
    pub const ALL: [Stage; Stage::COUNT] = [Stage::TeacherForcedBalance, Stage::Balance, Stage::Walk];

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::TeacherForcedBalance => "teacher_forced_balance",
            Stage::Balance => "balance",
            Stage::Walk => "walk",
        }
    }

    /// Directory tag used by the monitor exporter for this stage's logs.
    pub fn log_tag(self) -> &'static str {
        match self {
            Stage::TeacherForcedBalance => "00_balancing_tf",
            Stage::Balance => "01_balancing",
            Stage::Walk => "02_walking",
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    pub fn is_final(self) -> bool {
        self.next().is_none()
    }

    /// Numeric action fed to the critic for this stage.
    pub fn action_value(self, encoding: StageEncoding) -> f32 {
        match encoding {
            StageEncoding::Raw => self.index() as f32,
            StageEncoding::Centered => self.index() as f32 - 1.0,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "teacher_forced_balance" | "balancing_tf" => Ok(Stage::TeacherForcedBalance),
            "balance" | "balancing" => Ok(Stage::Balance),
            "walk" | "walking" => Ok(Stage::Walk),
            other => anyhow::bail!("unknown curriculum stage '{other}'"),
        }
    }
}

/// How a stage id is turned into the critic's action scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEncoding {
    Raw,
    /// Shift ids so the middle stage sits at zero.
    #[default]
    Centered,
}
