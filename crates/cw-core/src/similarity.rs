//! Skill-vector similarity between a volunteer and an initiative.
//!
//! A volunteer is a sparse vector of skill weights; an initiative is a list of
//! required skill ids, each implicitly weighted `1.0`. All functions are pure
//! and return values in `[0, 1]` for non-negative weights.
//!
//! The required list keeps list semantics: a duplicated skill id counts twice
//! toward the denominators of [`coverage_score`], [`euclidean_similarity`] and
//! [`jaccard_index`], but only once in the matched set used by
//! [`cosine_similarity`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{SkillId, SkillWeights};

/// Result of the restricted-space cosine computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosineMatch {
    pub score: f64,
    /// Required skills the volunteer holds, in required-list order.
    pub matched_skill_ids: Vec<SkillId>,
}

impl CosineMatch {
    pub fn matched_count(&self) -> usize {
        self.matched_skill_ids.len()
    }

    fn empty() -> Self {
        Self {
            score: 0.0,
            matched_skill_ids: Vec::new(),
        }
    }
}

/// Every metric for one volunteer/initiative pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    pub cosine: f64,
    pub euclidean: f64,
    pub coverage: f64,
    pub jaccard_index: f64,
    pub matched_skill_ids: Vec<SkillId>,
}

impl PairScore {
    pub fn matched_count(&self) -> usize {
        self.matched_skill_ids.len()
    }
}

/// Required skill ids present in `weights`, first occurrence only, in list order.
pub fn matched_skill_ids(weights: &SkillWeights, required: &[SkillId]) -> Vec<SkillId> {
    let mut seen = HashSet::with_capacity(required.len());
    required
        .iter()
        .copied()
        .filter(|id| weights.contains(*id) && seen.insert(*id))
        .collect()
}

/// Size of the intersection between the required list and the volunteer's skills.
///
/// Cheaper than [`cosine_similarity`]; the recompute pipeline uses it to skip
/// zero-overlap pairs before any floating-point work.
pub fn matched_count(weights: &SkillWeights, required: &[SkillId]) -> usize {
    let mut seen = HashSet::with_capacity(required.len());
    required
        .iter()
        .filter(|id| weights.contains(**id) && seen.insert(**id))
        .count()
}

/// Cosine similarity over the skills both sides share.
///
/// The volunteer vector is `[W[s] for s in M]` and the target vector is all
/// ones, where `M` is the matched set. Required skills the volunteer lacks do
/// not affect the score: this measures how evenly strong the volunteer is on the
/// overlap, not how much of the requirement they cover.
pub fn cosine_similarity(weights: &SkillWeights, required: &[SkillId]) -> CosineMatch {
    let matched = matched_skill_ids(weights, required);
    if matched.is_empty() {
        return CosineMatch::empty();
    }

    let (dot, norm_sq) = matched.iter().fold((0.0_f64, 0.0_f64), |(dot, norm_sq), id| {
        let w = weights.weight_or_zero(*id);
        (dot + w, norm_sq + w * w)
    });
    let norm_v = norm_sq.sqrt();
    let norm_p = (matched.len() as f64).sqrt();

    let score = if norm_v > 0.0 && norm_p > 0.0 {
        (dot / (norm_v * norm_p)).clamp(0.0, 1.0)
    } else {
        0.0
    };

    CosineMatch {
        score,
        matched_skill_ids: matched,
    }
}

/// `1 - |v - 1| / sqrt(|R|)` over the full required list, missing skills as zero.
pub fn euclidean_similarity(weights: &SkillWeights, required: &[SkillId]) -> f64 {
    if required.is_empty() {
        return 0.0;
    }

    let distance = required
        .iter()
        .map(|id| {
            let delta = weights.weight_or_zero(*id) - 1.0;
            delta * delta
        })
        .sum::<f64>()
        .sqrt();
    let max_distance = (required.len() as f64).sqrt();
    let normalized = (distance / max_distance).min(1.0);

    (1.0 - normalized).clamp(0.0, 1.0)
}

/// Mean weight across the required list, missing skills as zero.
pub fn coverage_score(weights: &SkillWeights, required: &[SkillId]) -> f64 {
    if required.is_empty() {
        return 0.0;
    }

    let total: f64 = required.iter().map(|id| weights.weight_or_zero(*id)).sum();
    (total / required.len() as f64).clamp(0.0, 1.0)
}

/// `matched_count / required_len`, or 0 when nothing is required.
pub fn jaccard_index(matched_count: usize, required_len: usize) -> f64 {
    if required_len == 0 {
        return 0.0;
    }
    (matched_count as f64 / required_len as f64).min(1.0)
}

pub fn score_pair(weights: &SkillWeights, required: &[SkillId]) -> PairScore {
    let cosine = cosine_similarity(weights, required);
    PairScore {
        cosine: cosine.score,
        euclidean: euclidean_similarity(weights, required),
        coverage: coverage_score(weights, required),
        jaccard_index: jaccard_index(cosine.matched_count(), required.len()),
        matched_skill_ids: cosine.matched_skill_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(SkillId, f64)]) -> SkillWeights {
        pairs.iter().copied().collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn restricted_cosine_matches_worked_example() {
        let w = weights(&[(1, 0.8), (2, 0.5)]);
        let result = cosine_similarity(&w, &[1, 2, 3]);

        assert_eq!(result.matched_skill_ids, vec![1, 2]);
        assert_eq!(result.matched_count(), 2);
        let expected = 1.3 / (0.89_f64.sqrt() * 2.0_f64.sqrt());
        assert!(approx(result.score, expected));
        assert!((result.score - 0.974).abs() < 1e-3);
        assert!(approx(jaccard_index(2, 3), 2.0 / 3.0));
    }

    #[test]
    fn disjoint_skills_score_zero() {
        let w = weights(&[(10, 1.0), (11, 0.4)]);
        let result = cosine_similarity(&w, &[1, 2, 3]);
        assert_eq!(result.score, 0.0);
        assert!(result.matched_skill_ids.is_empty());
        assert_eq!(matched_count(&w, &[1, 2, 3]), 0);
    }

    #[test]
    fn unmatched_required_skills_do_not_move_cosine() {
        let w = weights(&[(1, 0.7), (2, 0.7)]);
        let narrow = cosine_similarity(&w, &[1, 2]);
        let wide = cosine_similarity(&w, &[1, 2, 3, 4, 5]);
        assert!(approx(narrow.score, 1.0));
        assert!(approx(narrow.score, wide.score));
    }

    #[test]
    fn zero_weights_on_matched_skills_score_zero() {
        let w = weights(&[(1, 0.0), (2, 0.0)]);
        let result = cosine_similarity(&w, &[1, 2]);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.matched_count(), 2);
    }

    #[test]
    fn empty_requirement_scores_zero_everywhere() {
        let w = weights(&[(1, 1.0)]);
        let score = score_pair(&w, &[]);
        assert_eq!(score.cosine, 0.0);
        assert_eq!(score.euclidean, 0.0);
        assert_eq!(score.coverage, 0.0);
        assert_eq!(score.jaccard_index, 0.0);
        assert_eq!(score.matched_count(), 0);
    }

    #[test]
    fn empty_volunteer_gets_minimum_scores() {
        let w = SkillWeights::new();
        let score = score_pair(&w, &[1, 2, 3]);
        assert_eq!(score.cosine, 0.0);
        assert_eq!(score.coverage, 0.0);
        assert!(approx(score.euclidean, 0.0));
    }

    #[test]
    fn perfect_weights_give_full_euclidean_similarity() {
        let w = weights(&[(1, 1.0), (2, 1.0), (3, 1.0)]);
        assert_eq!(euclidean_similarity(&w, &[1, 2, 3]), 1.0);
        assert_eq!(coverage_score(&w, &[1, 2, 3]), 1.0);
    }

    #[test]
    fn euclidean_penalises_missing_skills() {
        let w = weights(&[(1, 1.0)]);
        let one = euclidean_similarity(&w, &[1]);
        let three = euclidean_similarity(&w, &[1, 2, 3]);
        assert_eq!(one, 1.0);
        let expected = 1.0 - (2.0_f64).sqrt() / (3.0_f64).sqrt();
        assert!(approx(three, expected));
    }

    #[test]
    fn coverage_is_mean_weight_over_required() {
        let w = weights(&[(1, 0.8), (2, 0.5)]);
        assert!(approx(coverage_score(&w, &[1, 2, 3]), 1.3 / 3.0));
    }

    #[test]
    fn duplicate_requirements_inflate_denominators_only() {
        let w = weights(&[(1, 0.9)]);
        let score = score_pair(&w, &[1, 1, 2]);
        assert_eq!(score.matched_skill_ids, vec![1]);
        assert!(approx(score.jaccard_index, 1.0 / 3.0));
        assert!(approx(score.coverage, 1.8 / 3.0));
        assert!(approx(score.cosine, 1.0));
    }

    #[test]
    fn scores_stay_in_unit_interval_for_heavy_weights() {
        let w = weights(&[(1, 4.0), (2, 0.1), (3, 2.5)]);
        for required in [vec![1], vec![1, 2], vec![1, 2, 3, 4], vec![3, 3, 9]] {
            let score = score_pair(&w, &required);
            for value in [score.cosine, score.euclidean, score.coverage, score.jaccard_index] {
                assert!((0.0..=1.0).contains(&value), "{value} out of range for {required:?}");
            }
        }
    }

    #[test]
    fn matched_ids_follow_required_order() {
        let w = weights(&[(1, 0.5), (2, 0.5), (3, 0.5)]);
        assert_eq!(matched_skill_ids(&w, &[3, 9, 1, 3]), vec![3, 1]);
        assert_eq!(matched_count(&w, &[3, 9, 1, 3]), 2);
    }
}
