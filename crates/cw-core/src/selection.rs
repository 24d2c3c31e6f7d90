//! Top-K candidate selection over stored match scores.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Candidate;

pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_MIN_MATCH_SCORE: f64 = 0.6;

/// Threshold and cap applied when ranking candidates for one project.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuery {
    /// Inclusive lower bound on `match_score`.
    pub min_score: f64,
    pub limit: usize,
}

impl Default for CandidateQuery {
    fn default() -> Self {
        Self {
            min_score: DEFAULT_MIN_MATCH_SCORE,
            limit: DEFAULT_TOP_K,
        }
    }
}

impl CandidateQuery {
    pub fn new(min_score: f64, limit: usize) -> Self {
        Self { min_score, limit }
    }

    pub fn admits(&self, score: f64) -> bool {
        score >= self.min_score
    }
}

/// A stored match joined with the volunteer's visibility flag.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredVolunteer {
    pub candidate: Candidate,
    pub skills_visible: bool,
}

/// Ranking order: score descending, then matched skill count descending, then volunteer id.
pub fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.match_score
        .total_cmp(&a.match_score)
        .then_with(|| b.matched_skill_count.cmp(&a.matched_skill_count))
        .then_with(|| a.volunteer_id.cmp(&b.volunteer_id))
}

/// Rank `pool` and keep at most `query.limit` candidates that clear the
/// threshold, have visible skills, and are not in `already_notified`.
pub fn select_top_candidates<I>(
    pool: I,
    query: &CandidateQuery,
    already_notified: &HashSet<Uuid>,
) -> Vec<Candidate>
where
    I: IntoIterator<Item = ScoredVolunteer>,
{
    let mut eligible: Vec<Candidate> = pool
        .into_iter()
        .filter(|row| row.skills_visible)
        .map(|row| row.candidate)
        .filter(|c| query.admits(c.match_score))
        .filter(|c| !already_notified.contains(&c.volunteer_id))
        .collect();

    eligible.sort_by(compare_candidates);
    eligible.truncate(query.limit);
    eligible
}
