use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cw_core::messages::OutboundMessage;
use cw_core::selection::{select_top_candidates, CandidateQuery, ScoredVolunteer};
use cw_core::{
    BatchId, Candidate, Initiative, MatchRecord, MatchStatistics, NotificationRecord,
    NotificationStatistics, VolunteerProfile,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    InitiativeCandidate, MatchStore, ProjectSession, StoreError, VolunteerRecommendation,
};

/// Process-local store with the same observable semantics as [`crate::PgMatchStore`].
///
/// Cloning shares the underlying state. Failure switches let callers exercise
/// the error paths of the pipelines.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Creation order.
    initiatives: Vec<Initiative>,
    volunteers: BTreeMap<Uuid, VolunteerProfile>,
    matches: Vec<MatchRecord>,
    notifications: Vec<NotificationRecord>,
    messages: Vec<OutboundMessage>,
    undeliverable: HashSet<Uuid>,
    failing_projects: HashSet<Uuid>,
    fail_next_replace: bool,
    statistics_unavailable: bool,
}

impl MemoryState {
    fn already_notified(&self, record: &NotificationRecord) -> bool {
        self.notifications.iter().any(|n| n.same_triple(record))
    }

    fn check_deliverable(&self, message: &OutboundMessage) -> Result<(), StoreError> {
        if self.undeliverable.contains(&message.recipient_id) {
            return Err(StoreError::Delivery {
                recipient: message.recipient_id,
                reason: "recipient rejected by outbox".to_string(),
            });
        }
        Ok(())
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_initiative(&self, initiative: Initiative) {
        let mut state = self.state.lock().await;
        match state.initiatives.iter_mut().find(|i| i.id == initiative.id) {
            Some(existing) => *existing = initiative,
            None => state.initiatives.push(initiative),
        }
    }

    pub async fn upsert_volunteer(&self, volunteer: VolunteerProfile) {
        let mut state = self.state.lock().await;
        state.volunteers.insert(volunteer.id, volunteer);
    }

    pub async fn set_skills_visible(&self, volunteer_id: Uuid, visible: bool) {
        let mut state = self.state.lock().await;
        if let Some(volunteer) = state.volunteers.get_mut(&volunteer_id) {
            volunteer.skills_visible = visible;
        }
    }

    pub async fn matches(&self) -> Vec<MatchRecord> {
        self.state.lock().await.matches.clone()
    }

    pub async fn notifications(&self) -> Vec<NotificationRecord> {
        self.state.lock().await.notifications.clone()
    }

    pub async fn messages(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.messages.clone()
    }

    /// Make every message addressed to `recipient` fail delivery.
    pub async fn reject_messages_to(&self, recipient: Uuid) {
        self.state.lock().await.undeliverable.insert(recipient);
    }

    /// Make every commit of `project_id`'s notification session fail.
    pub async fn fail_project(&self, project_id: Uuid) {
        self.state.lock().await.failing_projects.insert(project_id);
    }

    /// Make the next `replace_matches` fail, leaving the current table intact.
    pub async fn fail_next_replace(&self) {
        self.state.lock().await.fail_next_replace = true;
    }

    pub async fn set_statistics_unavailable(&self, unavailable: bool) {
        self.state.lock().await.statistics_unavailable = unavailable;
    }
}

fn rank_records(a: &MatchRecord, b: &MatchRecord) -> Ordering {
    b.match_score
        .total_cmp(&a.match_score)
        .then_with(|| b.matched_skill_count.cmp(&a.matched_skill_count))
        .then_with(|| a.volunteer_id.cmp(&b.volunteer_id))
}

#[async_trait]
impl MatchStore for InMemoryStore {
    async fn active_initiatives(&self) -> Result<Vec<Initiative>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .initiatives
            .iter()
            .filter(|i| i.status.is_scored())
            .cloned()
            .collect())
    }

    async fn recruiting_projects(&self) -> Result<Vec<Initiative>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .initiatives
            .iter()
            .rev()
            .filter(|i| i.status.is_recruiting())
            .cloned()
            .collect())
    }

    async fn volunteers_with_skills(&self) -> Result<Vec<VolunteerProfile>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .volunteers
            .values()
            .filter(|v| !v.skills.is_empty())
            .cloned()
            .collect())
    }

    async fn replace_matches(&self, records: &[MatchRecord]) -> Result<u64, StoreError> {
        let staged = records.to_vec();
        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.fail_next_replace) {
            return Err(StoreError::Unavailable(
                "match table replacement aborted".to_string(),
            ));
        }
        state.matches = staged;
        Ok(records.len() as u64)
    }

    async fn top_candidates(
        &self,
        project_id: Uuid,
        batch_id: BatchId,
        query: &CandidateQuery,
    ) -> Result<Vec<Candidate>, StoreError> {
        let state = self.state.lock().await;
        let already_notified: HashSet<Uuid> = state
            .notifications
            .iter()
            .filter(|n| n.project_id == project_id && n.batch_id == batch_id)
            .map(|n| n.volunteer_id)
            .collect();

        let pool = state
            .matches
            .iter()
            .filter(|m| m.initiative_id == project_id)
            .filter_map(|m| {
                let volunteer = state.volunteers.get(&m.volunteer_id)?;
                Some(ScoredVolunteer {
                    candidate: Candidate {
                        volunteer_id: volunteer.id,
                        user_id: volunteer.user_id,
                        name: volunteer.name.clone(),
                        match_score: m.match_score,
                        matched_skill_count: m.matched_skill_count,
                    },
                    skills_visible: volunteer.skills_visible,
                })
            });

        Ok(select_top_candidates(pool, query, &already_notified))
    }

    async fn begin_project(&self, project_id: Uuid) -> Result<Box<dyn ProjectSession>, StoreError> {
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            project_id,
            pending_notifications: Vec::new(),
            pending_messages: Vec::new(),
        }))
    }

    async fn candidates_for_initiative(
        &self,
        initiative_id: Uuid,
        query: &CandidateQuery,
    ) -> Result<Vec<InitiativeCandidate>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<&MatchRecord> = state
            .matches
            .iter()
            .filter(|m| m.initiative_id == initiative_id && query.admits(m.match_score))
            .filter(|m| {
                state
                    .volunteers
                    .get(&m.volunteer_id)
                    .is_some_and(|v| v.skills_visible)
            })
            .collect();
        rows.sort_by(|a, b| rank_records(a, b));

        Ok(rows
            .into_iter()
            .take(query.limit)
            .filter_map(|m| {
                let volunteer = state.volunteers.get(&m.volunteer_id)?;
                Some(InitiativeCandidate {
                    record: m.clone(),
                    volunteer_name: volunteer.name.clone(),
                })
            })
            .collect())
    }

    async fn recommendations_for_volunteer(
        &self,
        volunteer_id: Uuid,
        query: &CandidateQuery,
    ) -> Result<Vec<VolunteerRecommendation>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<(&MatchRecord, &Initiative)> = state
            .matches
            .iter()
            .filter(|m| m.volunteer_id == volunteer_id && query.admits(m.match_score))
            .filter_map(|m| {
                let initiative = state
                    .initiatives
                    .iter()
                    .find(|i| i.id == m.initiative_id && i.status.is_scored())?;
                Some((m, initiative))
            })
            .collect();
        rows.sort_by(|(a, _), (b, _)| {
            b.match_score
                .total_cmp(&a.match_score)
                .then_with(|| b.matched_skill_count.cmp(&a.matched_skill_count))
                .then_with(|| a.initiative_id.cmp(&b.initiative_id))
        });

        Ok(rows
            .into_iter()
            .take(query.limit)
            .map(|(m, i)| VolunteerRecommendation {
                record: m.clone(),
                initiative_title: i.title.clone(),
                initiative_status: i.status,
            })
            .collect())
    }

    async fn find_match(
        &self,
        volunteer_id: Uuid,
        initiative_id: Uuid,
    ) -> Result<Option<MatchRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .matches
            .iter()
            .find(|m| m.volunteer_id == volunteer_id && m.initiative_id == initiative_id)
            .cloned())
    }

    async fn match_statistics(&self) -> Result<MatchStatistics, StoreError> {
        let state = self.state.lock().await;
        if state.statistics_unavailable {
            return Err(StoreError::Unavailable("statistics disabled".to_string()));
        }

        let matches = &state.matches;
        let volunteers: HashSet<Uuid> = matches.iter().map(|m| m.volunteer_id).collect();
        let initiatives: HashSet<Uuid> = matches.iter().map(|m| m.initiative_id).collect();
        let scores = matches.iter().map(|m| m.match_score);

        Ok(MatchStatistics {
            total_matches: matches.len() as i64,
            volunteers_with_matches: volunteers.len() as i64,
            initiatives_with_matches: initiatives.len() as i64,
            average_score: (!matches.is_empty())
                .then(|| scores.clone().sum::<f64>() / matches.len() as f64),
            min_score: scores.clone().reduce(f64::min),
            max_score: scores.reduce(f64::max),
        })
    }

    async fn notification_statistics(
        &self,
        recent_since: DateTime<Utc>,
    ) -> Result<NotificationStatistics, StoreError> {
        let state = self.state.lock().await;
        if state.statistics_unavailable {
            return Err(StoreError::Unavailable("statistics disabled".to_string()));
        }

        let ledger = &state.notifications;
        let projects: HashSet<Uuid> = ledger.iter().map(|n| n.project_id).collect();
        let volunteers: HashSet<Uuid> = ledger.iter().map(|n| n.volunteer_id).collect();

        Ok(NotificationStatistics {
            total_notifications: ledger.len() as i64,
            recent_notifications: ledger
                .iter()
                .filter(|n| n.notified_at >= recent_since)
                .count() as i64,
            projects_with_notifications: projects.len() as i64,
            volunteers_notified: volunteers.len() as i64,
        })
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    project_id: Uuid,
    pending_notifications: Vec<NotificationRecord>,
    pending_messages: Vec<OutboundMessage>,
}

#[async_trait]
impl ProjectSession for MemorySession {
    async fn notify_candidate(
        &mut self,
        record: &NotificationRecord,
        message: &OutboundMessage,
    ) -> Result<bool, StoreError> {
        debug_assert_eq!(record.project_id, self.project_id);
        let state = self.state.lock().await;
        if state.already_notified(record)
            || self.pending_notifications.iter().any(|n| n.same_triple(record))
        {
            return Ok(false);
        }
        state.check_deliverable(message)?;
        drop(state);

        self.pending_notifications.push(record.clone());
        self.pending_messages.push(message.clone());
        Ok(true)
    }

    async fn send_message(&mut self, message: &OutboundMessage) -> Result<(), StoreError> {
        self.state.lock().await.check_deliverable(message)?;
        self.pending_messages.push(message.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemorySession {
            state,
            project_id,
            pending_notifications,
            pending_messages,
        } = *self;
        let mut state = state.lock().await;
        if state.failing_projects.contains(&project_id) {
            return Err(StoreError::Unavailable(format!(
                "commit for project {project_id} aborted"
            )));
        }
        for record in pending_notifications {
            if !state.already_notified(&record) {
                state.notifications.push(record);
            }
        }
        state.messages.extend(pending_messages);
        Ok(())
    }
}
