//! Global admission policy: AUTO admits any due run, SINGLE admits at most
//! one running run across the whole system.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Auto,
    Single,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Auto
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Auto => write!(f, "auto"),
            Mode::Single => write!(f, "single"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Mode::Auto),
            "single" => Ok(Mode::Single),
            other => Err(format!("unknown mode {other:?}, expected \"auto\" or \"single\"")),
        }
    }
}
