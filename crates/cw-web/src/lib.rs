//! Read-only JSON API over the stored match table.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cw_core::selection::CandidateQuery;
use cw_core::{match_percentage, InitiativeStatus, MatchRecord};
use cw_storage::{InitiativeCandidate, MatchStore, VolunteerRecommendation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cw-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MatchStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn MatchStore>) -> Self {
        Self { store }
    }
}

/// Default and inclusive maximum for a list endpoint's `limit`, plus its default `min_score`.
#[derive(Debug, Clone, Copy)]
struct ListBounds {
    default_limit: usize,
    max_limit: usize,
    default_min_score: f64,
}

const CANDIDATE_BOUNDS: ListBounds = ListBounds {
    default_limit: 50,
    max_limit: 100,
    default_min_score: 0.1,
};

const RECOMMENDATION_BOUNDS: ListBounds = ListBounds {
    default_limit: 20,
    max_limit: 50,
    default_min_score: 0.2,
};

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    limit: Option<String>,
    min_score: Option<String>,
}

impl ListQuery {
    /// Out-of-range or unparseable values fall back to the defaults.
    fn resolve(&self, bounds: ListBounds) -> CandidateQuery {
        let limit = self
            .limit
            .as_deref()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|l| (1..=bounds.max_limit).contains(l))
            .unwrap_or(bounds.default_limit);
        let min_score = self
            .min_score
            .as_deref()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|s| s.is_finite())
            .unwrap_or(bounds.default_min_score);
        CandidateQuery::new(min_score, limit)
    }
}

#[derive(Debug, Serialize)]
struct CandidateView {
    volunteer_id: Uuid,
    name: String,
    match_score: f64,
    jaccard_index: f64,
    matched_skill_ids: Vec<i32>,
    matched_skill_count: i32,
    calculated_at: chrono::DateTime<chrono::Utc>,
    match_percentage: i64,
}

impl From<InitiativeCandidate> for CandidateView {
    fn from(row: InitiativeCandidate) -> Self {
        let InitiativeCandidate {
            record,
            volunteer_name,
        } = row;
        Self {
            volunteer_id: record.volunteer_id,
            name: volunteer_name,
            match_percentage: match_percentage(record.match_score),
            match_score: record.match_score,
            jaccard_index: record.jaccard_index,
            matched_skill_ids: record.matched_skill_ids,
            matched_skill_count: record.matched_skill_count,
            calculated_at: record.calculated_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct RecommendationView {
    initiative_id: Uuid,
    title: String,
    status: InitiativeStatus,
    match_score: f64,
    matched_skill_ids: Vec<i32>,
    matched_skill_count: i32,
    calculated_at: chrono::DateTime<chrono::Utc>,
    match_percentage: i64,
}

impl From<VolunteerRecommendation> for RecommendationView {
    fn from(row: VolunteerRecommendation) -> Self {
        let VolunteerRecommendation {
            record,
            initiative_title,
            initiative_status,
        } = row;
        Self {
            initiative_id: record.initiative_id,
            title: initiative_title,
            status: initiative_status,
            match_percentage: match_percentage(record.match_score),
            match_score: record.match_score,
            matched_skill_ids: record.matched_skill_ids,
            matched_skill_count: record.matched_skill_count,
            calculated_at: record.calculated_at,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/initiatives/{id}/candidates", get(initiative_candidates_handler))
        .route("/volunteers/{id}/recommendations", get(volunteer_recommendations_handler))
        .route("/matches/{volunteer_id}/{initiative_id}", get(match_detail_handler))
        .route("/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(store: Arc<dyn MatchStore>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "serving match api");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

pub fn parse_bind_addr(raw: &str) -> anyhow::Result<SocketAddr> {
    raw.trim()
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid CW_BIND_ADDR {raw:?}: {err}"))
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn initiative_candidates_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    let Some(initiative_id) = parse_id(&id) else {
        return bad_request("Invalid initiative ID");
    };
    let query = query.resolve(CANDIDATE_BOUNDS);

    match state.store.candidates_for_initiative(initiative_id, &query).await {
        Ok(rows) => {
            let candidates: Vec<CandidateView> = rows.into_iter().map(CandidateView::from).collect();
            Json(json!({
                "initiative_id": initiative_id,
                "min_score": query.min_score,
                "count": candidates.len(),
                "candidates": candidates,
            }))
            .into_response()
        }
        Err(err) => server_error("Failed to get candidate volunteers", err),
    }
}

async fn volunteer_recommendations_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    let Some(volunteer_id) = parse_id(&id) else {
        return bad_request("Invalid volunteer ID");
    };
    let query = query.resolve(RECOMMENDATION_BOUNDS);

    match state
        .store
        .recommendations_for_volunteer(volunteer_id, &query)
        .await
    {
        Ok(rows) => {
            let recommendations: Vec<RecommendationView> =
                rows.into_iter().map(RecommendationView::from).collect();
            Json(json!({
                "volunteer_id": volunteer_id,
                "min_score": query.min_score,
                "count": recommendations.len(),
                "recommendations": recommendations,
            }))
            .into_response()
        }
        Err(err) => server_error("Failed to get recommended initiatives", err),
    }
}

async fn match_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((volunteer_id, initiative_id)): AxumPath<(String, String)>,
) -> Response {
    let Some(volunteer_id) = parse_id(&volunteer_id) else {
        return bad_request("Invalid volunteer ID");
    };
    let Some(initiative_id) = parse_id(&initiative_id) else {
        return bad_request("Invalid initiative ID");
    };

    match state.store.find_match(volunteer_id, initiative_id).await {
        Ok(Some(record)) => Json(match_detail(&record)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Match not found" })),
        )
            .into_response(),
        Err(err) => server_error("Failed to load match", err),
    }
}

fn match_detail(record: &MatchRecord) -> serde_json::Value {
    json!({
        "match_details": record,
        "explanation": {
            "match_percentage": match_percentage(record.match_score),
            "skills_matched": record.matched_skill_count,
            "coverage_percentage": match_percentage(record.jaccard_index),
        },
    })
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match cw_jobs::collect_statistics(state.store.as_ref()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "statistics request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to load statistics" })),
            )
                .into_response()
        }
    }
}

fn parse_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(message: &str, err: cw_storage::StoreError) -> Response {
    warn!(error = %err, "{message}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use cw_core::{Initiative, SkillWeights, VolunteerProfile};
    use cw_storage::InMemoryStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct Seeded {
        store: InMemoryStore,
        initiative: Initiative,
        shown: VolunteerProfile,
        hidden: VolunteerProfile,
    }

    fn volunteer(name: &str, visible: bool) -> VolunteerProfile {
        VolunteerProfile {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: name.to_string(),
            skills_visible: visible,
            skills: [(1, 0.9)].into_iter().collect::<SkillWeights>(),
        }
    }

    fn record(volunteer_id: Uuid, initiative_id: Uuid, score: f64) -> MatchRecord {
        MatchRecord {
            volunteer_id,
            initiative_id,
            match_score: score,
            jaccard_index: 0.5,
            matched_skill_ids: vec![1],
            matched_skill_count: 1,
            calculated_at: Utc::now(),
        }
    }

    async fn seeded() -> Seeded {
        let store = InMemoryStore::new();
        let initiative = Initiative {
            id: Uuid::new_v4(),
            title: "Tool library".into(),
            status: InitiativeStatus::Active,
            required_skill_ids: vec![1, 2],
            team_lead_id: None,
            created_by_admin_id: None,
        };
        let shown = volunteer("Ada", true);
        let hidden = volunteer("Hidden", false);
        store.upsert_initiative(initiative.clone()).await;
        store.upsert_volunteer(shown.clone()).await;
        store.upsert_volunteer(hidden.clone()).await;
        store
            .replace_matches(&[
                record(shown.id, initiative.id, 0.974),
                record(hidden.id, initiative.id, 0.99),
            ])
            .await
            .unwrap();
        Seeded {
            store,
            initiative,
            shown,
            hidden,
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn router(store: &InMemoryStore) -> Router {
        app(AppState::new(Arc::new(store.clone())))
    }

    #[test]
    fn bind_addr_comes_from_jobs_config() {
        let config = cw_jobs::JobsConfig::default();
        let addr = parse_bind_addr(&config.bind_addr).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert!(parse_bind_addr("localhost").is_err());
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (status, body) = get_json(router(&InMemoryStore::new()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn candidates_hide_invisible_volunteers_and_carry_percentage() {
        let s = seeded().await;
        let uri = format!("/initiatives/{}/candidates", s.initiative.id);
        let (status, body) = get_json(router(&s.store), &uri).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["min_score"], 0.1);
        assert_eq!(body["candidates"][0]["volunteer_id"], s.shown.id.to_string());
        assert_eq!(body["candidates"][0]["match_percentage"], 97);
    }

    #[tokio::test]
    async fn out_of_range_limit_falls_back_and_min_score_filters() {
        let s = seeded().await;
        let uri = format!(
            "/initiatives/{}/candidates?limit=500&min_score=0.98",
            s.initiative.id
        );
        let (status, body) = get_json(router(&s.store), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);

        let query = ListQuery {
            limit: Some("500".into()),
            min_score: Some("nope".into()),
        }
        .resolve(CANDIDATE_BOUNDS);
        assert_eq!(query.limit, 50);
        assert_eq!(query.min_score, 0.1);
    }

    #[tokio::test]
    async fn recommendations_list_active_initiatives() {
        let s = seeded().await;
        let uri = format!("/volunteers/{}/recommendations", s.hidden.id);
        let (status, body) = get_json(router(&s.store), &uri).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["recommendations"][0]["title"], "Tool library");
        assert_eq!(body["recommendations"][0]["status"], "active");
        assert_eq!(body["recommendations"][0]["match_percentage"], 99);
    }

    #[tokio::test]
    async fn match_detail_found_missing_and_malformed() {
        let s = seeded().await;
        let found = format!("/matches/{}/{}", s.shown.id, s.initiative.id);
        let (status, body) = get_json(router(&s.store), &found).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["explanation"]["match_percentage"], 97);
        assert_eq!(body["explanation"]["coverage_percentage"], 50);

        let missing = format!("/matches/{}/{}", Uuid::new_v4(), s.initiative.id);
        let (status, _) = get_json(router(&s.store), &missing).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get_json(router(&s.store), "/matches/nope/also-nope").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid volunteer ID");
    }

    #[tokio::test]
    async fn stats_summarise_store_and_surface_failures() {
        let s = seeded().await;
        let (status, body) = get_json(router(&s.store), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matches"]["total_matches"], 2);
        assert_eq!(body["notifications"]["total_notifications"], 0);

        s.store.set_statistics_unavailable(true).await;
        let (status, _) = get_json(router(&s.store), "/stats").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
