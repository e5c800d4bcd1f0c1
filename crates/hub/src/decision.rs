//! Decisions as they arrive from any source, and the fixed action set they
//! are checked against.
//!
//! Action identifiers stay free strings until the validator maps them onto
//! [`ActionKind`]; anything that does not map is not allowlisted.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Action set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Water,
    LightOn,
    LightOff,
    HeaterOn,
    HeaterOff,
    Circulation,
    DoNothing,
    NotifyHuman,
}

impl ActionKind {
    pub const ALL: [ActionKind; 8] = [
        Self::Water,
        Self::LightOn,
        Self::LightOff,
        Self::HeaterOn,
        Self::HeaterOff,
        Self::Circulation,
        Self::DoNothing,
        Self::NotifyHuman,
    ];

    /// Exact, case-sensitive match. Near misses are not allowlisted.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Water => "water",
            Self::LightOn => "light_on",
            Self::LightOff => "light_off",
            Self::HeaterOn => "heater_on",
            Self::HeaterOff => "heater_off",
            Self::Circulation => "circulation",
            Self::DoNothing => "do_nothing",
            Self::NotifyHuman => "notify_human",
        }
    }

    pub fn takes_duration(self) -> bool {
        matches!(self, Self::Water | Self::Circulation)
    }

    /// No hardware behind it and no counters consumed.
    pub fn is_passthrough(self) -> bool {
        matches!(self, Self::DoNothing | Self::NotifyHuman)
    }

    /// Only ever reduces energy delivered to the hardware.
    pub fn is_safe_direction(self) -> bool {
        matches!(self, Self::LightOff | Self::HeaterOff)
    }

    /// Position in the fixed dispatch order: light, heater, water,
    /// circulation, then the actions with no command.
    pub fn dispatch_rank(self) -> u8 {
        match self {
            Self::LightOn | Self::LightOff => 0,
            Self::HeaterOn | Self::HeaterOff => 1,
            Self::Water => 2,
            Self::Circulation => 3,
            Self::DoNothing | Self::NotifyHuman => 4,
        }
    }

    /// Link command for this action, `None` for passthrough actions.
    pub fn command(self, duration_sec: Option<u32>) -> Option<String> {
        let secs = duration_sec.unwrap_or(0);
        match self {
            Self::LightOn => Some("lon".into()),
            Self::LightOff => Some("loff".into()),
            Self::HeaterOn => Some("hon".into()),
            Self::HeaterOff => Some("hoff".into()),
            Self::Water => Some(format!("w_on,{secs}")),
            Self::Circulation => Some(format!("c_on,{secs}")),
            Self::DoNothing | Self::NotifyHuman => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<i64>,
}

/// One requested action, exactly as proposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ActionParams>,
    #[serde(default)]
    pub reason: String,
}

impl ProposedAction {
    pub fn new(kind: ActionKind, reason: impl Into<String>) -> Self {
        Self {
            action: kind.as_str().to_string(),
            duration_sec: None,
            params: None,
            reason: reason.into(),
        }
    }

    pub fn timed(kind: ActionKind, secs: i64, reason: impl Into<String>) -> Self {
        Self {
            duration_sec: Some(secs),
            ..Self::new(kind, reason)
        }
    }

    /// Requested duration. A top-level value wins over one nested in `params`.
    pub fn duration(&self) -> Option<i64> {
        self.duration_sec
            .or_else(|| self.params.as_ref().and_then(|p| p.duration_sec))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    #[default]
    Normal,
    Attention,
    Critical,
}

/// Where a decision came from. Set by the hub, never read from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Advisor,
    Fallback,
    Manual,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Advisor => "advisor",
            Self::Fallback => "fallback",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub actions: Vec<ProposedAction>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub notify_human: bool,
}

impl Decision {
    pub fn kinds(&self) -> impl Iterator<Item = Option<ActionKind>> + '_ {
        self.actions.iter().map(|a| ActionKind::parse(&a.action))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_exact() {
        assert_eq!(ActionKind::parse("water"), Some(ActionKind::Water));
        assert_eq!(ActionKind::parse("heater_off"), Some(ActionKind::HeaterOff));
        assert_eq!(ActionKind::parse("Water"), None);
        assert_eq!(ActionKind::parse(" water"), None);
        assert_eq!(ActionKind::parse("open_window"), None);
    }

    #[test]
    fn every_kind_round_trips_through_its_name() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn commands() {
        assert_eq!(ActionKind::Water.command(Some(8)).as_deref(), Some("w_on,8"));
        assert_eq!(ActionKind::Circulation.command(Some(600)).as_deref(), Some("c_on,600"));
        assert_eq!(ActionKind::HeaterOn.command(None).as_deref(), Some("hon"));
        assert_eq!(ActionKind::LightOff.command(None).as_deref(), Some("loff"));
        assert_eq!(ActionKind::NotifyHuman.command(None), None);
    }

    #[test]
    fn dispatch_order() {
        let mut kinds = vec![
            ActionKind::NotifyHuman,
            ActionKind::Circulation,
            ActionKind::Water,
            ActionKind::HeaterOff,
            ActionKind::LightOn,
        ];
        kinds.sort_by_key(|k| k.dispatch_rank());
        assert_eq!(
            kinds,
            [
                ActionKind::LightOn,
                ActionKind::HeaterOff,
                ActionKind::Water,
                ActionKind::Circulation,
                ActionKind::NotifyHuman,
            ]
        );
    }

    #[test]
    fn decision_from_json_with_nested_params() {
        let json = r#"{
            "actions": [
                {"action": "water", "params": {"duration_sec": 8}, "reason": "dry"},
                {"action": "light_on"}
            ],
            "reason": "morning",
            "urgency": "attention"
        }"#;
        let d: Decision = serde_json::from_str(json).unwrap();
        assert_eq!(d.actions.len(), 2);
        assert_eq!(d.actions[0].duration(), Some(8));
        assert_eq!(d.actions[1].duration(), None);
        assert_eq!(d.urgency, Urgency::Attention);
        assert!(!d.notify_human);
    }

    #[test]
    fn top_level_duration_wins() {
        let a = ProposedAction {
            action: "water".into(),
            duration_sec: Some(5),
            params: Some(ActionParams { duration_sec: Some(20) }),
            reason: String::new(),
        };
        assert_eq!(a.duration(), Some(5));
    }

    #[test]
    fn empty_decision_defaults() {
        let d: Decision = serde_json::from_str("{}").unwrap();
        assert!(d.actions.is_empty());
        assert_eq!(d.urgency, Urgency::Normal);
    }
}
