//! Traffic direction and the connectivity indicator derived from it.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ClientError;
use crate::model::Model;

/// Which way the most recent traffic went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local to backend
    Up,
    /// Backend to local
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }

    /// Parse an optional direction name; `None` clears the direction.
    pub fn parse_optional(value: Option<&str>) -> Result<Option<Direction>, ClientError> {
        value.map(str::parse).transpose()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(ClientError::InvalidDirection(other.to_string())),
        }
    }
}

/// What the connectivity icon should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    Offline,
    Idle,
    Sending,
    Receiving,
}

impl Indicator {
    pub fn from_model(model: &Model) -> Self {
        if !model.connection_live {
            return Indicator::Offline;
        }
        match model.connection_direction {
            None => Indicator::Idle,
            Some(Direction::Up) => Indicator::Sending,
            Some(Direction::Down) => Indicator::Receiving,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Indicator::Offline => "Reconnecting",
            Indicator::Idle => "Live",
            Indicator::Sending => "Sending",
            Indicator::Receiving => "Receiving",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_known_directions() {
        assert_eq!("up".parse::<Direction>().unwrap(), Direction::Up);
        assert_eq!("down".parse::<Direction>().unwrap(), Direction::Down);
        assert_eq!(Direction::parse_optional(None).unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_anything_else() {
        for bad in ["", "UP", "sideways", "null"] {
            let err = bad.parse::<Direction>().unwrap_err();
            assert!(matches!(err, ClientError::InvalidDirection(ref v) if v == bad));
        }
    }

    #[test]
    fn test_indicator_prefers_offline() {
        let mut model = Model::default();
        model.connection_direction = Some(Direction::Down);
        assert_eq!(Indicator::from_model(&model), Indicator::Offline);

        model.connection_live = true;
        assert_eq!(Indicator::from_model(&model), Indicator::Receiving);

        model.connection_direction = Some(Direction::Up);
        assert_eq!(Indicator::from_model(&model), Indicator::Sending);

        model.connection_direction = None;
        assert_eq!(Indicator::from_model(&model), Indicator::Idle);
        assert_eq!(Indicator::Idle.label(), "Live");
    }
}
