use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

/// A century of weekly rolls; wider windows are rejected at the catalog boundary.
pub const MAX_WEEKS: i32 = 5200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Student {
    pub id: i32,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roll {
    pub id: i32,
    pub name: String,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RollState {
    Unmark,
    Present,
    Absent,
    Late,
}

impl RollState {
    pub const ALL: [RollState; 4] = [
        RollState::Unmark,
        RollState::Present,
        RollState::Absent,
        RollState::Late,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RollState::Unmark => "unmark",
            RollState::Present => "present",
            RollState::Absent => "absent",
            RollState::Late => "late",
        }
    }
}

impl FromStr for RollState {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<Self> {
        RollState::ALL
            .into_iter()
            .find(|state| state.as_str() == value)
            .ok_or_else(|| {
                FilterError::validation("roll_states", format!("unknown roll state `{value}`"))
            })
    }
}

impl fmt::Display for RollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentRollState {
    pub id: i32,
    pub roll_id: i32,
    pub student_id: i32,
    pub state: RollState,
}

/// The accepted states of a group, stored and exchanged as a comma-delimited string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RollStateSet(BTreeSet<RollState>);

impl RollStateSet {
    /// Parses `"absent, late"` style input. Blank tokens are dropped; at least
    /// one known state must remain.
    pub fn parse(raw: &str) -> Result<Self> {
        let states = raw
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(RollState::from_str)
            .collect::<Result<BTreeSet<_>>>()?;

        if states.is_empty() {
            return Err(FilterError::validation(
                "roll_states",
                "at least one roll state is required",
            ));
        }
        Ok(Self(states))
    }

    pub fn contains(&self, state: RollState) -> bool {
        self.0.contains(&state)
    }

    pub fn iter(&self) -> impl Iterator<Item = RollState> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for RollStateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().map(RollState::as_str).collect();
        f.write_str(&joined.join(","))
    }
}

impl TryFrom<String> for RollStateSet {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self> {
        RollStateSet::parse(&value)
    }
}

impl From<RollStateSet> for String {
    fn from(value: RollStateSet) -> Self {
        value.to_string()
    }
}

/// Threshold operator of a group, the `ltmt` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">")]
    GreaterThan,
}

impl Comparison {
    pub fn as_str(self) -> &'static str {
        match self {
            Comparison::LessThan => "<",
            Comparison::GreaterThan => ">",
        }
    }
}

impl FromStr for Comparison {
    type Err = FilterError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "<" => Ok(Comparison::LessThan),
            ">" => Ok(Comparison::GreaterThan),
            other => Err(FilterError::validation(
                "ltmt",
                format!("expected `<` or `>`, got `{other}`"),
            )),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: i32,
    pub name: String,
    pub number_of_weeks: i32,
    pub roll_states: RollStateSet,
    pub incidents: i32,
    pub ltmt: Comparison,
    pub run_at: Option<DateTime<Utc>>,
    pub student_count: i32,
}

impl Group {
    pub fn from_new(id: i32, group: NewGroup) -> Self {
        Self {
            id,
            name: group.name,
            number_of_weeks: group.number_of_weeks,
            roll_states: group.roll_states,
            incidents: group.incidents,
            ltmt: group.ltmt,
            run_at: None,
            student_count: 0,
        }
    }

    pub fn apply(&mut self, patch: GroupPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(weeks) = patch.number_of_weeks {
            self.number_of_weeks = weeks;
        }
        if let Some(states) = patch.roll_states {
            self.roll_states = states;
        }
        if let Some(incidents) = patch.incidents {
            self.incidents = incidents;
        }
        if let Some(ltmt) = patch.ltmt {
            self.ltmt = ltmt;
        }
    }
}

/// A membership row: one per student qualifying for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStudent {
    pub group_id: i32,
    pub student_id: i32,
    pub incident_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
    pub student_id: i32,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub incident_count: i32,
}

impl GroupMember {
    pub fn new(student: &Student, incident_count: i32) -> Self {
        Self {
            student_id: student.id,
            first_name: student.first_name.clone(),
            last_name: student.last_name.clone(),
            full_name: format!("{} {}", student.first_name, student.last_name),
            incident_count,
        }
    }
}

/// Unvalidated group fields as they arrive from the CLI or HTTP.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupInput {
    pub name: Option<String>,
    pub number_of_weeks: Option<i32>,
    pub roll_states: Option<String>,
    pub incidents: Option<i32>,
    pub ltmt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGroup {
    pub name: String,
    pub number_of_weeks: i32,
    pub roll_states: RollStateSet,
    pub incidents: i32,
    pub ltmt: Comparison,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub number_of_weeks: Option<i32>,
    pub roll_states: Option<RollStateSet>,
    pub incidents: Option<i32>,
    pub ltmt: Option<Comparison>,
}

impl GroupInput {
    pub fn into_new_group(self) -> Result<NewGroup> {
        let patch = self.into_patch()?;
        Ok(NewGroup {
            name: patch.name.ok_or_else(|| missing("name"))?,
            number_of_weeks: patch
                .number_of_weeks
                .ok_or_else(|| missing("number_of_weeks"))?,
            roll_states: patch.roll_states.ok_or_else(|| missing("roll_states"))?,
            incidents: patch.incidents.ok_or_else(|| missing("incidents"))?,
            ltmt: patch.ltmt.ok_or_else(|| missing("ltmt"))?,
        })
    }

    /// Validates only the fields that are present.
    pub fn into_patch(self) -> Result<GroupPatch> {
        let name = match self.name {
            Some(name) if name.trim().is_empty() => {
                return Err(FilterError::validation("name", "must not be blank"))
            }
            Some(name) => Some(name.trim().to_string()),
            None => None,
        };

        if let Some(weeks) = self.number_of_weeks {
            if !(0..=MAX_WEEKS).contains(&weeks) {
                return Err(FilterError::validation(
                    "number_of_weeks",
                    format!("must be between 0 and {MAX_WEEKS}"),
                ));
            }
        }

        Ok(GroupPatch {
            name,
            number_of_weeks: self.number_of_weeks,
            roll_states: self
                .roll_states
                .as_deref()
                .map(RollStateSet::parse)
                .transpose()?,
            incidents: self.incidents,
            ltmt: self.ltmt.as_deref().map(Comparison::from_str).transpose()?,
        })
    }
}

fn missing(field: &'static str) -> FilterError {
    FilterError::validation(field, "is required")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_input() -> GroupInput {
        GroupInput {
            name: Some("Frequent absentees".to_string()),
            number_of_weeks: Some(2),
            roll_states: Some("absent, late".to_string()),
            incidents: Some(3),
            ltmt: Some("<".to_string()),
        }
    }

    #[test]
    fn parses_roll_state_list_with_blanks() {
        let states = RollStateSet::parse(" absent,, late ,").unwrap();
        assert!(states.contains(RollState::Absent));
        assert!(states.contains(RollState::Late));
        assert!(!states.contains(RollState::Present));
        assert_eq!(states.to_string(), "absent,late");
    }

    #[test]
    fn rejects_unknown_roll_state() {
        let err = RollStateSet::parse("absent,sick").unwrap_err();
        match err {
            FilterError::Validation { field, message } => {
                assert_eq!(field, "roll_states");
                assert!(message.contains("sick"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_empty_roll_state_list() {
        assert!(RollStateSet::parse(" , ").is_err());
    }

    #[test]
    fn comparison_accepts_only_two_operators() {
        assert_eq!("<".parse::<Comparison>().unwrap(), Comparison::LessThan);
        assert_eq!(">".parse::<Comparison>().unwrap(), Comparison::GreaterThan);
        assert!("=".parse::<Comparison>().is_err());
        assert!("<=".parse::<Comparison>().is_err());
    }

    #[test]
    fn new_group_requires_every_field() {
        let group = full_input().into_new_group().unwrap();
        assert_eq!(group.name, "Frequent absentees");
        assert_eq!(group.ltmt, Comparison::LessThan);

        let mut input = full_input();
        input.ltmt = None;
        match input.into_new_group().unwrap_err() {
            FilterError::Validation { field, .. } => assert_eq!(field, "ltmt"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn negative_weeks_are_rejected() {
        let mut input = full_input();
        input.number_of_weeks = Some(-1);
        assert!(input.into_new_group().is_err());
    }

    #[test]
    fn weeks_beyond_a_century_are_rejected() {
        let mut input = full_input();
        input.number_of_weeks = Some(MAX_WEEKS);
        assert!(input.into_new_group().is_ok());

        let patch = GroupInput {
            number_of_weeks: Some(20_000_000),
            ..GroupInput::default()
        };
        match patch.into_patch().unwrap_err() {
            FilterError::Validation { field, .. } => assert_eq!(field, "number_of_weeks"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let mut group = Group::from_new(7, full_input().into_new_group().unwrap());
        let patch = GroupInput {
            incidents: Some(5),
            ltmt: Some(">".to_string()),
            ..GroupInput::default()
        }
        .into_patch()
        .unwrap();

        group.apply(patch);
        assert_eq!(group.incidents, 5);
        assert_eq!(group.ltmt, Comparison::GreaterThan);
        assert_eq!(group.number_of_weeks, 2);
        assert_eq!(group.name, "Frequent absentees");
    }

    #[test]
    fn group_serializes_states_as_string() {
        let group = Group::from_new(1, full_input().into_new_group().unwrap());
        let json = serde_json::to_value(&group).unwrap();
        assert_eq!(json["roll_states"], "absent,late");
        assert_eq!(json["ltmt"], "<");
        assert!(json["run_at"].is_null());
    }
}
