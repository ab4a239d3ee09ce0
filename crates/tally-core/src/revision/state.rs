use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outcome of the most recent execution attempt of a migration.
///
/// The engine drives `Pending -> Ongoing -> {Ok, Error}`. The ledger stores
/// whatever state it is handed and never validates transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Ongoing,
    Ok,
    Error,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Ongoing => "ongoing",
            ExecutionState::Ok => "ok",
            ExecutionState::Error => "error",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionState::Pending),
            "ongoing" => Ok(ExecutionState::Ongoing),
            "ok" => Ok(ExecutionState::Ok),
            "error" => Ok(ExecutionState::Error),
            other => Err(format!("unknown execution state '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_states() {
        assert_eq!("ok".parse::<ExecutionState>(), Ok(ExecutionState::Ok));
        assert_eq!(
            "ongoing".parse::<ExecutionState>(),
            Ok(ExecutionState::Ongoing)
        );
        assert!("OK".parse::<ExecutionState>().is_err());
        assert!("done".parse::<ExecutionState>().is_err());
    }

    #[test]
    fn test_display_matches_stored_form() {
        for state in [
            ExecutionState::Pending,
            ExecutionState::Ongoing,
            ExecutionState::Ok,
            ExecutionState::Error,
        ] {
            assert_eq!(state.to_string().parse::<ExecutionState>(), Ok(state));
        }
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&ExecutionState::Error).unwrap();
        assert_eq!(json, "\"error\"");
    }
}
