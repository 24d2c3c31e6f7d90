//! Core domain model for CivicWeave volunteer/initiative skill matching.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod messages;
pub mod selection;
pub mod similarity;

pub const CRATE_NAME: &str = "cw-core";

pub type SkillId = i32;

/// A volunteer's proficiency per skill id. Weights are expected to be `>= 0`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkillWeights(BTreeMap<SkillId, f64>);

impl SkillWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, skill_id: SkillId, weight: f64) -> Option<f64> {
        self.0.insert(skill_id, weight)
    }

    pub fn get(&self, skill_id: SkillId) -> Option<f64> {
        self.0.get(&skill_id).copied()
    }

    /// Weight for `skill_id`, treating an absent skill as zero.
    pub fn weight_or_zero(&self, skill_id: SkillId) -> f64 {
        self.get(skill_id).unwrap_or(0.0)
    }

    pub fn contains(&self, skill_id: SkillId) -> bool {
        self.0.contains_key(&skill_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SkillId, f64)> + '_ {
        self.0.iter().map(|(id, weight)| (*id, *weight))
    }
}

impl FromIterator<(SkillId, f64)> for SkillWeights {
    fn from_iter<I: IntoIterator<Item = (SkillId, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<SkillId, f64>> for SkillWeights {
    fn from(map: BTreeMap<SkillId, f64>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitiativeStatus {
    Draft,
    Recruiting,
    Active,
    Completed,
    Archived,
}

impl InitiativeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Recruiting => "recruiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    /// Statuses whose initiatives take part in the hourly match recompute.
    pub fn is_scored(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Statuses whose initiatives receive candidate notifications.
    pub fn is_recruiting(self) -> bool {
        matches!(self, Self::Recruiting | Self::Active)
    }
}

impl fmt::Display for InitiativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown initiative status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for InitiativeStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "recruiting" => Ok(Self::Recruiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Recruiting initiative ("project" in the notification flow).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initiative {
    pub id: Uuid,
    pub title: String,
    pub status: InitiativeStatus,
    /// Required skills, each implicitly weighted 1.0. Duplicates are kept.
    pub required_skill_ids: Vec<SkillId>,
    pub team_lead_id: Option<Uuid>,
    pub created_by_admin_id: Option<Uuid>,
}

impl Initiative {
    /// Recipient of the per-project candidate summary: the team lead, else the creating admin.
    pub fn summary_recipient(&self) -> Option<Uuid> {
        self.team_lead_id.or(self.created_by_admin_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolunteerProfile {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub skills_visible: bool,
    pub skills: SkillWeights,
}

/// One row of the derived match table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub volunteer_id: Uuid,
    pub initiative_id: Uuid,
    /// Restricted-space cosine similarity.
    pub match_score: f64,
    /// `matched_skill_count / required_skill_ids.len()`; not a set-theoretic Jaccard index.
    pub jaccard_index: f64,
    pub matched_skill_ids: Vec<SkillId>,
    pub matched_skill_count: i32,
    pub calculated_at: DateTime<Utc>,
}

/// Identifier scoping "already notified" checks to one notification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Dedup ledger entry, unique on `(project_id, volunteer_id, batch_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub project_id: Uuid,
    pub volunteer_id: Uuid,
    pub match_score: f64,
    pub batch_id: BatchId,
    pub notified_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn same_triple(&self, other: &NotificationRecord) -> bool {
        self.project_id == other.project_id
            && self.volunteer_id == other.volunteer_id
            && self.batch_id == other.batch_id
    }
}

/// Volunteer eligible for a project notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub volunteer_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub match_score: f64,
    pub matched_skill_count: i32,
}

impl Candidate {
    pub fn match_percentage(&self) -> i64 {
        match_percentage(self.match_score)
    }
}

/// Whole-number percentage shown to people, `round(score * 100)`.
pub fn match_percentage(score: f64) -> i64 {
    (score * 100.0).round() as i64
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchStatistics {
    pub total_matches: i64,
    pub volunteers_with_matches: i64,
    pub initiatives_with_matches: i64,
    pub average_score: Option<f64>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStatistics {
    pub total_notifications: i64,
    pub recent_notifications: i64,
    pub projects_with_notifications: i64,
    pub volunteers_notified: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            InitiativeStatus::Draft,
            InitiativeStatus::Recruiting,
            InitiativeStatus::Active,
            InitiativeStatus::Completed,
            InitiativeStatus::Archived,
        ] {
            assert_eq!(status.as_str().parse::<InitiativeStatus>(), Ok(status));
        }
        assert_eq!(" Active ".parse::<InitiativeStatus>(), Ok(InitiativeStatus::Active));
        assert!("paused".parse::<InitiativeStatus>().is_err());
    }

    #[test]
    fn only_active_initiatives_are_scored() {
        assert!(InitiativeStatus::Active.is_scored());
        assert!(!InitiativeStatus::Recruiting.is_scored());
        assert!(InitiativeStatus::Recruiting.is_recruiting());
        assert!(!InitiativeStatus::Completed.is_recruiting());
    }

    #[test]
    fn summary_falls_back_to_creating_admin() {
        let admin = Uuid::new_v4();
        let lead = Uuid::new_v4();
        let mut initiative = Initiative {
            id: Uuid::new_v4(),
            title: "Park cleanup".into(),
            status: InitiativeStatus::Recruiting,
            required_skill_ids: vec![1],
            team_lead_id: None,
            created_by_admin_id: Some(admin),
        };
        assert_eq!(initiative.summary_recipient(), Some(admin));
        initiative.team_lead_id = Some(lead);
        assert_eq!(initiative.summary_recipient(), Some(lead));
        initiative.team_lead_id = None;
        initiative.created_by_admin_id = None;
        assert_eq!(initiative.summary_recipient(), None);
    }

    #[test]
    fn percentage_rounds_to_nearest() {
        assert_eq!(match_percentage(0.974), 97);
        assert_eq!(match_percentage(0.975), 98);
        assert_eq!(match_percentage(0.6), 60);
        assert_eq!(match_percentage(1.0), 100);
    }

    #[test]
    fn skill_weights_serialize_as_plain_map() {
        let weights: SkillWeights = [(1, 0.8), (2, 0.5)].into_iter().collect();
        let json = serde_json::to_string(&weights).expect("serialize");
        assert_eq!(json, r#"{"1":0.8,"2":0.5}"#);
        assert_eq!(weights.weight_or_zero(3), 0.0);
    }
}
