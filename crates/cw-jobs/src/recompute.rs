//! Full recompute of the volunteer/initiative match table.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cw_core::similarity::{matched_count, score_pair};
use cw_core::{Initiative, MatchRecord, VolunteerProfile};
use cw_storage::MatchStore;
use serde::Serialize;
use tracing::{debug, info, info_span, trace, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct RecomputeConfig {
    /// Emit a progress line every this many evaluated pairs.
    pub progress_every: usize,
}

impl Default for RecomputeConfig {
    fn default() -> Self {
        Self {
            progress_every: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecomputeSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub initiatives: usize,
    pub volunteers: usize,
    pub pairs_evaluated: usize,
    pub matches_stored: u64,
}

/// Score one pair; `None` when the volunteer holds none of the required skills.
pub fn match_for_pair(
    initiative: &Initiative,
    volunteer: &VolunteerProfile,
    calculated_at: DateTime<Utc>,
) -> Option<MatchRecord> {
    let required = &initiative.required_skill_ids;
    if matched_count(&volunteer.skills, required) == 0 {
        return None;
    }

    let score = score_pair(&volunteer.skills, required);
    trace!(
        initiative_id = %initiative.id,
        volunteer_id = %volunteer.id,
        cosine = score.cosine,
        euclidean = score.euclidean,
        coverage = score.coverage,
        "scored pair"
    );

    Some(MatchRecord {
        volunteer_id: volunteer.id,
        initiative_id: initiative.id,
        match_score: score.cosine,
        jaccard_index: score.jaccard_index,
        matched_skill_count: score.matched_count() as i32,
        matched_skill_ids: score.matched_skill_ids,
        calculated_at,
    })
}

/// Evaluate the full cross product, keeping only pairs with at least one shared skill.
///
/// Output order is initiative order, then volunteer order, so identical input
/// yields an identical record list.
pub fn compute_matches(
    initiatives: &[Initiative],
    volunteers: &[VolunteerProfile],
    calculated_at: DateTime<Utc>,
    config: &RecomputeConfig,
) -> (Vec<MatchRecord>, usize) {
    let total = initiatives.len() * volunteers.len();
    let mut processed = 0usize;
    let mut records = Vec::new();

    for initiative in initiatives {
        for volunteer in volunteers {
            if let Some(record) = match_for_pair(initiative, volunteer, calculated_at) {
                records.push(record);
            }
            processed += 1;
            if config.progress_every > 0 && processed % config.progress_every == 0 {
                debug!(processed, total, "recompute progress");
            }
        }
    }

    (records, processed)
}

pub struct RecomputePipeline {
    store: Arc<dyn MatchStore>,
    config: RecomputeConfig,
}

impl RecomputePipeline {
    pub fn new(store: Arc<dyn MatchStore>, config: RecomputeConfig) -> Self {
        Self { store, config }
    }

    /// Rebuild the match table from scratch.
    ///
    /// Any storage error aborts the run before or during the replacement; the
    /// replacement itself is a single transaction, so a failed run leaves the
    /// previous table in place.
    pub async fn run_once(&self) -> Result<RecomputeSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("recompute", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RecomputeSummary> {
        let started_at = Utc::now();
        info!("starting match recompute");

        let initiatives = self
            .store
            .active_initiatives()
            .await
            .context("loading active initiatives")?;
        let volunteers: Vec<VolunteerProfile> = self
            .store
            .volunteers_with_skills()
            .await
            .context("loading volunteer skills")?
            .into_iter()
            .filter(|v| !v.skills.is_empty())
            .collect();
        info!(
            initiatives = initiatives.len(),
            volunteers = volunteers.len(),
            "loaded recompute inputs"
        );

        let (records, pairs_evaluated) =
            compute_matches(&initiatives, &volunteers, started_at, &self.config);
        info!(matches = records.len(), pairs_evaluated, "calculated matches");

        let matches_stored = self
            .store
            .replace_matches(&records)
            .await
            .context("replacing volunteer_initiative_matches")?;

        let finished_at = Utc::now();
        info!(matches_stored, "match recompute complete");

        Ok(RecomputeSummary {
            run_id,
            started_at,
            finished_at,
            initiatives: initiatives.len(),
            volunteers: volunteers.len(),
            pairs_evaluated,
            matches_stored,
        })
    }
}
