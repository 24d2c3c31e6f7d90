//! Storage collaborators for the matching engine: a Postgres backend and an
//! in-memory backend with the same semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cw_core::messages::OutboundMessage;
use cw_core::selection::CandidateQuery;
use cw_core::{
    BatchId, Candidate, Initiative, InitiativeStatus, MatchRecord, MatchStatistics,
    NotificationRecord, NotificationStatistics, VolunteerProfile,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgMatchStore;

pub const CRATE_NAME: &str = "cw-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("message to {recipient} rejected: {reason}")]
    Delivery { recipient: Uuid, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Stored match joined with the volunteer's display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitiativeCandidate {
    pub record: MatchRecord,
    pub volunteer_name: String,
}

/// Stored match joined with the initiative it points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolunteerRecommendation {
    pub record: MatchRecord,
    pub initiative_title: String,
    pub initiative_status: InitiativeStatus,
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Initiatives scored by the recompute, with their required skills.
    async fn active_initiatives(&self) -> Result<Vec<Initiative>, StoreError>;

    /// Initiatives that receive candidate notifications, newest first.
    async fn recruiting_projects(&self) -> Result<Vec<Initiative>, StoreError>;

    /// Volunteers holding at least one skill, ordered by id.
    async fn volunteers_with_skills(&self) -> Result<Vec<VolunteerProfile>, StoreError>;

    /// Replace the whole match table with `records` in one transaction.
    async fn replace_matches(&self, records: &[MatchRecord]) -> Result<u64, StoreError>;

    /// Ranked, visible candidates for `project_id` not yet notified in `batch_id`.
    async fn top_candidates(
        &self,
        project_id: Uuid,
        batch_id: BatchId,
        query: &CandidateQuery,
    ) -> Result<Vec<Candidate>, StoreError>;

    /// Open the transaction that holds one project's notification work.
    async fn begin_project(&self, project_id: Uuid) -> Result<Box<dyn ProjectSession>, StoreError>;

    async fn candidates_for_initiative(
        &self,
        initiative_id: Uuid,
        query: &CandidateQuery,
    ) -> Result<Vec<InitiativeCandidate>, StoreError>;

    async fn recommendations_for_volunteer(
        &self,
        volunteer_id: Uuid,
        query: &CandidateQuery,
    ) -> Result<Vec<VolunteerRecommendation>, StoreError>;

    async fn find_match(
        &self,
        volunteer_id: Uuid,
        initiative_id: Uuid,
    ) -> Result<Option<MatchRecord>, StoreError>;

    async fn match_statistics(&self) -> Result<MatchStatistics, StoreError>;

    /// Ledger counts; `recent_since` bounds the "recent" bucket.
    async fn notification_statistics(
        &self,
        recent_since: DateTime<Utc>,
    ) -> Result<NotificationStatistics, StoreError>;
}

/// One project's notification transaction. Nothing is visible to other
/// readers until [`ProjectSession::commit`]; dropping the session rolls back.
#[async_trait]
pub trait ProjectSession: Send {
    /// Write the ledger entry and, if it is new, the candidate message.
    ///
    /// Returns `Ok(false)` without sending when the triple is already recorded.
    /// On error neither the entry nor the message is kept.
    async fn notify_candidate(
        &mut self,
        record: &NotificationRecord,
        message: &OutboundMessage,
    ) -> Result<bool, StoreError>;

    async fn send_message(&mut self, message: &OutboundMessage) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
