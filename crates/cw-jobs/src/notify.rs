//! Candidate notification batches.
//!
//! One run mints a [`BatchId`], walks every recruiting project, selects the top
//! candidates not yet notified in this batch, and writes one ledger entry plus
//! one message per candidate and a summary for the project's lead. Each
//! project commits on its own; failures are recorded per item in the returned
//! [`NotificationBatchReport`] instead of aborting the run.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cw_core::messages::OutboundMessage;
use cw_core::selection::{CandidateQuery, DEFAULT_MIN_MATCH_SCORE, DEFAULT_TOP_K};
use cw_core::{BatchId, Candidate, Initiative, NotificationRecord};
use cw_storage::MatchStore;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotifyConfig {
    pub top_k: usize,
    /// Inclusive lower bound on the stored match score.
    pub min_match_score: f64,
    /// Sender recorded on system-originated messages.
    pub system_user_id: Uuid,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_match_score: DEFAULT_MIN_MATCH_SCORE,
            system_user_id: Uuid::nil(),
        }
    }
}

impl NotifyConfig {
    pub fn candidate_query(&self) -> CandidateQuery {
        CandidateQuery::new(self.min_match_score, self.top_k)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CandidateOutcome {
    Notified,
    /// The ledger already held this triple; nothing was sent.
    AlreadyRecorded,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateReport {
    pub volunteer_id: Uuid,
    pub name: String,
    pub match_percentage: i64,
    pub outcome: CandidateOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SummaryOutcome {
    Sent { recipient_id: Uuid },
    NoRecipient,
    Failed { recipient_id: Uuid, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProjectOutcome {
    /// No candidate cleared the threshold; nothing was sent.
    NoCandidates,
    Committed {
        candidates: Vec<CandidateReport>,
        summary: SummaryOutcome,
    },
    /// Selection, session or commit failed; nothing from this project was kept.
    Failed {
        reason: String,
        candidates: Vec<CandidateReport>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectReport {
    pub project_id: Uuid,
    pub title: String,
    pub outcome: ProjectOutcome,
}

impl ProjectReport {
    fn committed_candidates(&self) -> &[CandidateReport] {
        match &self.outcome {
            ProjectOutcome::Committed { candidates, .. } => candidates,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationBatchReport {
    pub batch_id: BatchId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub top_k: usize,
    pub min_match_score: f64,
    pub projects: Vec<ProjectReport>,
}

impl NotificationBatchReport {
    pub fn candidates_notified(&self) -> usize {
        self.projects
            .iter()
            .flat_map(|p| p.committed_candidates())
            .filter(|c| c.outcome == CandidateOutcome::Notified)
            .count()
    }

    pub fn candidate_failures(&self) -> usize {
        self.projects
            .iter()
            .flat_map(|p| p.committed_candidates())
            .filter(|c| matches!(c.outcome, CandidateOutcome::Failed { .. }))
            .count()
    }

    pub fn team_leads_notified(&self) -> usize {
        self.projects
            .iter()
            .filter(|p| {
                matches!(
                    p.outcome,
                    ProjectOutcome::Committed {
                        summary: SummaryOutcome::Sent { .. },
                        ..
                    }
                )
            })
            .count()
    }

    pub fn project_failures(&self) -> usize {
        self.projects
            .iter()
            .filter(|p| matches!(p.outcome, ProjectOutcome::Failed { .. }))
            .count()
    }

    pub fn notified_volunteers(&self, project_id: Uuid) -> Vec<Uuid> {
        self.projects
            .iter()
            .filter(|p| p.project_id == project_id)
            .flat_map(|p| p.committed_candidates())
            .filter(|c| c.outcome == CandidateOutcome::Notified)
            .map(|c| c.volunteer_id)
            .collect()
    }
}

pub struct NotificationJob {
    store: Arc<dyn MatchStore>,
    config: NotifyConfig,
}

impl NotificationJob {
    pub fn new(store: Arc<dyn MatchStore>, config: NotifyConfig) -> Self {
        Self { store, config }
    }

    /// Process every recruiting project under `batch_id`.
    ///
    /// Only a failure to list the projects is returned as an error.
    pub async fn run_batch(&self, batch_id: BatchId) -> Result<NotificationBatchReport> {
        let span = info_span!("notify", %batch_id);
        self.run_inner(batch_id).instrument(span).await
    }

    async fn run_inner(&self, batch_id: BatchId) -> Result<NotificationBatchReport> {
        let started_at = Utc::now();
        info!(
            top_k = self.config.top_k,
            min_match_score = self.config.min_match_score,
            "starting candidate notification batch"
        );

        let projects = self
            .store
            .recruiting_projects()
            .await
            .context("loading recruiting projects")?;
        info!(projects = projects.len(), "found recruiting projects");

        let mut reports = Vec::with_capacity(projects.len());
        for project in &projects {
            let outcome = self
                .process_project(project, batch_id)
                .instrument(info_span!("project", project_id = %project.id))
                .await;
            reports.push(ProjectReport {
                project_id: project.id,
                title: project.title.clone(),
                outcome,
            });
        }

        let report = NotificationBatchReport {
            batch_id,
            started_at,
            finished_at: Utc::now(),
            top_k: self.config.top_k,
            min_match_score: self.config.min_match_score,
            projects: reports,
        };
        info!(
            candidates_notified = report.candidates_notified(),
            team_leads_notified = report.team_leads_notified(),
            candidate_failures = report.candidate_failures(),
            project_failures = report.project_failures(),
            "notification batch complete"
        );
        Ok(report)
    }

    async fn process_project(&self, project: &Initiative, batch_id: BatchId) -> ProjectOutcome {
        let query = self.config.candidate_query();
        let candidates = match self.store.top_candidates(project.id, batch_id, &query).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %err, "candidate selection failed");
                return ProjectOutcome::Failed {
                    reason: format!("selecting candidates: {err}"),
                    candidates: Vec::new(),
                };
            }
        };

        if candidates.is_empty() {
            info!(threshold = query.min_score, "no new candidates");
            return ProjectOutcome::NoCandidates;
        }
        info!(candidates = candidates.len(), "selected candidates");

        let mut session = match self.store.begin_project(project.id).await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "could not open project transaction");
                return ProjectOutcome::Failed {
                    reason: format!("opening project transaction: {err}"),
                    candidates: Vec::new(),
                };
            }
        };

        let mut reports = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let record = NotificationRecord {
                project_id: project.id,
                volunteer_id: candidate.volunteer_id,
                match_score: candidate.match_score,
                batch_id,
                notified_at: Utc::now(),
            };
            let message =
                OutboundMessage::candidate_match(project, candidate, self.config.system_user_id);

            let outcome = match session.notify_candidate(&record, &message).await {
                Ok(true) => {
                    info!(
                        volunteer_id = %candidate.volunteer_id,
                        match_percentage = candidate.match_percentage(),
                        "notified candidate"
                    );
                    CandidateOutcome::Notified
                }
                Ok(false) => CandidateOutcome::AlreadyRecorded,
                Err(err) => {
                    warn!(volunteer_id = %candidate.volunteer_id, error = %err, "failed to notify candidate");
                    CandidateOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            reports.push(candidate_report(candidate, outcome));
        }

        let summary = match project.summary_recipient() {
            None => {
                warn!("project has neither team lead nor creating admin; summary skipped");
                SummaryOutcome::NoRecipient
            }
            Some(recipient_id) => {
                let message = OutboundMessage::lead_summary(
                    project,
                    recipient_id,
                    &candidates,
                    self.config.system_user_id,
                );
                match session.send_message(&message).await {
                    Ok(()) => SummaryOutcome::Sent { recipient_id },
                    Err(err) => {
                        warn!(%recipient_id, error = %err, "failed to notify team lead");
                        SummaryOutcome::Failed {
                            recipient_id,
                            reason: err.to_string(),
                        }
                    }
                }
            }
        };

        match session.commit().await {
            Ok(()) => ProjectOutcome::Committed {
                candidates: reports,
                summary,
            },
            Err(err) => {
                warn!(error = %err, "project commit failed");
                ProjectOutcome::Failed {
                    reason: format!("committing project notifications: {err}"),
                    candidates: reports,
                }
            }
        }
    }
}

fn candidate_report(candidate: &Candidate, outcome: CandidateOutcome) -> CandidateReport {
    CandidateReport {
        volunteer_id: candidate.volunteer_id,
        name: candidate.name.clone(),
        match_percentage: candidate.match_percentage(),
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_core::{InitiativeStatus, MatchRecord, SkillWeights, VolunteerProfile};
    use cw_storage::InMemoryStore;

    struct Fixture {
        store: InMemoryStore,
        project: Initiative,
        volunteers: Vec<VolunteerProfile>,
    }

    async fn fixture(scores: &[(f64, i32)], team_lead: Option<Uuid>) -> Fixture {
        let store = InMemoryStore::new();
        let project = Initiative {
            id: Uuid::new_v4(),
            title: "River restoration".into(),
            status: InitiativeStatus::Recruiting,
            required_skill_ids: vec![1, 2, 3],
            team_lead_id: team_lead,
            created_by_admin_id: None,
        };
        store.upsert_initiative(project.clone()).await;

        let mut volunteers = Vec::new();
        let mut records = Vec::new();
        for (n, (score, count)) in scores.iter().enumerate() {
            let v = VolunteerProfile {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                name: format!("volunteer-{n}"),
                skills_visible: true,
                skills: [(1, 1.0)].into_iter().collect::<SkillWeights>(),
            };
            records.push(MatchRecord {
                volunteer_id: v.id,
                initiative_id: project.id,
                match_score: *score,
                jaccard_index: 0.5,
                matched_skill_ids: (1..=*count).collect(),
                matched_skill_count: *count,
                calculated_at: Utc::now(),
            });
            store.upsert_volunteer(v.clone()).await;
            volunteers.push(v);
        }
        store.replace_matches(&records).await.unwrap();

        Fixture {
            store,
            project,
            volunteers,
        }
    }

    fn job(store: &InMemoryStore, top_k: usize, min_match_score: f64) -> NotificationJob {
        NotificationJob::new(
            Arc::new(store.clone()),
            NotifyConfig {
                top_k,
                min_match_score,
                system_user_id: Uuid::nil(),
            },
        )
    }

    #[tokio::test]
    async fn notifies_top_k_and_summarises_for_lead() {
        let lead = Uuid::new_v4();
        let fx = fixture(&[(0.9, 3), (0.85, 5), (0.6, 1)], Some(lead)).await;
        let report = job(&fx.store, 2, 0.6).run_batch(BatchId::new()).await.unwrap();

        assert_eq!(report.candidates_notified(), 2);
        assert_eq!(report.team_leads_notified(), 1);
        assert_eq!(
            report.notified_volunteers(fx.project.id),
            vec![fx.volunteers[0].id, fx.volunteers[1].id]
        );

        let messages = fx.store.messages().await;
        assert_eq!(messages.len(), 3);
        let summary = messages.iter().find(|m| m.recipient_id == lead).expect("summary");
        let body = summary.body();
        assert!(body.contains("volunteer-0 (90% match)"));
        assert!(body.contains("volunteer-1 (85% match)"));
        assert!(!body.contains("volunteer-2"));
    }

    #[tokio::test]
    async fn project_without_candidates_is_skipped_silently() {
        let fx = fixture(&[(0.3, 1)], Some(Uuid::new_v4())).await;
        let report = job(&fx.store, 10, 0.6).run_batch(BatchId::new()).await.unwrap();

        assert_eq!(report.projects.len(), 1);
        assert_eq!(report.projects[0].outcome, ProjectOutcome::NoCandidates);
        assert!(fx.store.messages().await.is_empty());
        assert!(fx.store.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn failed_candidate_does_not_block_others_or_summary() {
        let lead = Uuid::new_v4();
        let fx = fixture(&[(0.95, 2), (0.9, 2), (0.8, 2)], Some(lead)).await;
        fx.store.reject_messages_to(fx.volunteers[1].user_id).await;

        let report = job(&fx.store, 10, 0.6).run_batch(BatchId::new()).await.unwrap();
        assert_eq!(report.candidates_notified(), 2);
        assert_eq!(report.candidate_failures(), 1);
        assert_eq!(report.team_leads_notified(), 1);

        let ledger: Vec<Uuid> = fx
            .store
            .notifications()
            .await
            .iter()
            .map(|n| n.volunteer_id)
            .collect();
        assert_eq!(ledger, vec![fx.volunteers[0].id, fx.volunteers[2].id]);
    }

    #[tokio::test]
    async fn summary_goes_to_creating_admin_or_is_skipped() {
        let fx = fixture(&[(0.9, 1)], None).await;
        let report = job(&fx.store, 10, 0.6).run_batch(BatchId::new()).await.unwrap();
        match &report.projects[0].outcome {
            ProjectOutcome::Committed { summary, .. } => {
                assert_eq!(*summary, SummaryOutcome::NoRecipient)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(report.candidates_notified(), 1);

        let admin = Uuid::new_v4();
        let mut project = fx.project.clone();
        project.created_by_admin_id = Some(admin);
        fx.store.upsert_initiative(project).await;
        let report = job(&fx.store, 10, 0.6).run_batch(BatchId::new()).await.unwrap();
        assert_eq!(report.team_leads_notified(), 1);
        assert!(fx.store.messages().await.iter().any(|m| m.recipient_id == admin));
    }

    #[tokio::test]
    async fn failed_summary_is_reported_without_losing_candidates() {
        let lead = Uuid::new_v4();
        let fx = fixture(&[(0.9, 1)], Some(lead)).await;
        fx.store.reject_messages_to(lead).await;

        let report = job(&fx.store, 10, 0.6).run_batch(BatchId::new()).await.unwrap();
        assert_eq!(report.candidates_notified(), 1);
        assert_eq!(report.team_leads_notified(), 0);
        assert_eq!(fx.store.notifications().await.len(), 1);
    }

    #[test]
    fn report_serializes_outcomes_with_status_tags() {
        let report = ProjectReport {
            project_id: Uuid::nil(),
            title: "t".into(),
            outcome: ProjectOutcome::Committed {
                candidates: vec![CandidateReport {
                    volunteer_id: Uuid::nil(),
                    name: "Ada".into(),
                    match_percentage: 97,
                    outcome: CandidateOutcome::Failed {
                        reason: "boom".into(),
                    },
                }],
                summary: SummaryOutcome::NoRecipient,
            },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"]["status"], "committed");
        assert_eq!(json["outcome"]["candidates"][0]["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["summary"]["status"], "no_recipient");
    }
}
