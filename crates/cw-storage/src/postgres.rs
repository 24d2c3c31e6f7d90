use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cw_core::messages::OutboundMessage;
use cw_core::selection::CandidateQuery;
use cw_core::{
    BatchId, Candidate, Initiative, InitiativeStatus, MatchRecord, MatchStatistics,
    NotificationRecord, NotificationStatistics, SkillWeights, VolunteerProfile,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Acquire, PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::{
    InitiativeCandidate, MatchStore, ProjectSession, StoreError, VolunteerRecommendation,
};

/// Rows per bulk INSERT; seven binds each.
const INSERT_CHUNK_ROWS: usize = 1000;

const INITIATIVE_COLUMNS: &str = r#"
    SELECT i.id,
           i.title,
           i.status,
           i.team_lead_id,
           i.created_by_admin_id,
           COALESCE(
               array_agg(irs.skill_id ORDER BY irs.position) FILTER (WHERE irs.skill_id IS NOT NULL),
               ARRAY[]::INT4[]
           ) AS required_skill_ids
      FROM initiatives i
      LEFT JOIN initiative_required_skills irs ON irs.initiative_id = i.id
"#;

const MATCH_COLUMNS: &str = "m.volunteer_id, m.initiative_id, m.match_score, m.jaccard_index, \
     m.matched_skill_ids, m.matched_skill_count, m.calculated_at";

#[derive(Debug, Clone)]
pub struct PgMatchStore {
    pool: PgPool,
}

impl PgMatchStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn initiatives_with_status(
        &self,
        statuses: &[InitiativeStatus],
        newest_first: bool,
    ) -> Result<Vec<Initiative>, StoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let order = if newest_first {
            "i.created_at DESC, i.id"
        } else {
            "i.created_at, i.id"
        };
        let sql = format!(
            "{INITIATIVE_COLUMNS} WHERE i.status = ANY($1) GROUP BY i.id ORDER BY {order}"
        );
        let rows = sqlx::query(&sql).bind(statuses).fetch_all(&self.pool).await?;
        rows.iter().map(initiative_from_row).collect()
    }
}

fn initiative_from_row(row: &PgRow) -> Result<Initiative, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Initiative {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        status: status
            .parse()
            .map_err(|err: cw_core::UnknownStatus| StoreError::InvalidValue(err.to_string()))?,
        required_skill_ids: row.try_get("required_skill_ids")?,
        team_lead_id: row.try_get("team_lead_id")?,
        created_by_admin_id: row.try_get("created_by_admin_id")?,
    })
}

fn match_from_row(row: &PgRow) -> Result<MatchRecord, sqlx::Error> {
    Ok(MatchRecord {
        volunteer_id: row.try_get("volunteer_id")?,
        initiative_id: row.try_get("initiative_id")?,
        match_score: row.try_get("match_score")?,
        jaccard_index: row.try_get("jaccard_index")?,
        matched_skill_ids: row.try_get("matched_skill_ids")?,
        matched_skill_count: row.try_get("matched_skill_count")?,
        calculated_at: row.try_get("calculated_at")?,
    })
}

async fn insert_message(conn: &mut PgConnection, message: &OutboundMessage) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO project_messages (id, project_id, sender_id, recipient_id, message_text, created_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(message.project_id)
    .bind(message.sender_id)
    .bind(message.recipient_id)
    .bind(message.body())
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl MatchStore for PgMatchStore {
    async fn active_initiatives(&self) -> Result<Vec<Initiative>, StoreError> {
        self.initiatives_with_status(&[InitiativeStatus::Active], false)
            .await
    }

    async fn recruiting_projects(&self) -> Result<Vec<Initiative>, StoreError> {
        self.initiatives_with_status(&[InitiativeStatus::Recruiting, InitiativeStatus::Active], true)
            .await
    }

    async fn volunteers_with_skills(&self) -> Result<Vec<VolunteerProfile>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT v.id, v.user_id, v.name, v.skills_visible, vs.skill_id, vs.skill_weight
              FROM volunteers v
              JOIN volunteer_skills vs ON vs.volunteer_id = v.id
             ORDER BY v.id, vs.skill_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut profiles: BTreeMap<Uuid, VolunteerProfile> = BTreeMap::new();
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let skill_id: i32 = row.try_get("skill_id")?;
            let weight: f64 = row.try_get("skill_weight")?;
            if !profiles.contains_key(&id) {
                profiles.insert(
                    id,
                    VolunteerProfile {
                        id,
                        user_id: row.try_get("user_id")?,
                        name: row.try_get("name")?,
                        skills_visible: row.try_get("skills_visible")?,
                        skills: SkillWeights::new(),
                    },
                );
            }
            if let Some(profile) = profiles.get_mut(&id) {
                profile.skills.insert(skill_id, weight);
            }
        }
        Ok(profiles.into_values().collect())
    }

    async fn replace_matches(&self, records: &[MatchRecord]) -> Result<u64, StoreError> {
        let span = info_span!("replace_matches", rows = records.len());
        async {
            let mut tx = self.pool.begin().await?;
            // Readers keep seeing the previous rows until commit.
            let cleared = sqlx::query("DELETE FROM volunteer_initiative_matches")
                .execute(&mut *tx)
                .await?
                .rows_affected();
            debug!(cleared, "cleared previous matches");

            let mut inserted = 0u64;
            for chunk in records.chunks(INSERT_CHUNK_ROWS) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                    "INSERT INTO volunteer_initiative_matches \
                     (volunteer_id, initiative_id, match_score, jaccard_index, \
                      matched_skill_ids, matched_skill_count, calculated_at) ",
                );
                builder.push_values(chunk, |mut row, record| {
                    row.push_bind(record.volunteer_id)
                        .push_bind(record.initiative_id)
                        .push_bind(record.match_score)
                        .push_bind(record.jaccard_index)
                        .push_bind(record.matched_skill_ids.clone())
                        .push_bind(record.matched_skill_count)
                        .push_bind(record.calculated_at);
                });
                inserted += builder.build().execute(&mut *tx).await?.rows_affected();
            }

            tx.commit().await?;
            Ok::<u64, StoreError>(inserted)
        }
        .instrument(span)
        .await
    }

    async fn top_candidates(
        &self,
        project_id: Uuid,
        batch_id: BatchId,
        query: &CandidateQuery,
    ) -> Result<Vec<Candidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT v.id AS volunteer_id,
                   v.user_id,
                   v.name,
                   m.match_score,
                   m.matched_skill_count
              FROM volunteer_initiative_matches m
              JOIN volunteers v ON m.volunteer_id = v.id
             WHERE m.initiative_id = $1
               AND m.match_score >= $2
               AND v.skills_visible = true
               AND NOT EXISTS (
                   SELECT 1 FROM candidate_notifications cn
                    WHERE cn.project_id = $1
                      AND cn.volunteer_id = v.id
                      AND cn.notification_batch_id = $3
               )
             ORDER BY m.match_score DESC, m.matched_skill_count DESC, v.id
             LIMIT $4
            "#,
        )
        .bind(project_id)
        .bind(query.min_score)
        .bind(batch_id.as_uuid())
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Candidate, StoreError> {
                Ok(Candidate {
                    volunteer_id: row.try_get("volunteer_id")?,
                    user_id: row.try_get("user_id")?,
                    name: row.try_get("name")?,
                    match_score: row.try_get("match_score")?,
                    matched_skill_count: row.try_get("matched_skill_count")?,
                })
            })
            .collect()
    }

    async fn begin_project(&self, project_id: Uuid) -> Result<Box<dyn ProjectSession>, StoreError> {
        let tx = self.pool.begin().await?;
        debug!(%project_id, "opened project notification transaction");
        Ok(Box::new(PgProjectSession { tx }))
    }

    async fn candidates_for_initiative(
        &self,
        initiative_id: Uuid,
        query: &CandidateQuery,
    ) -> Result<Vec<InitiativeCandidate>, StoreError> {
        let sql = format!(
            r#"
            SELECT {MATCH_COLUMNS}, v.name
              FROM volunteer_initiative_matches m
              JOIN volunteers v ON m.volunteer_id = v.id
             WHERE m.initiative_id = $1
               AND m.match_score >= $2
               AND v.skills_visible = true
             ORDER BY m.match_score DESC, m.matched_skill_count DESC, m.volunteer_id
             LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(initiative_id)
            .bind(query.min_score)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<InitiativeCandidate, StoreError> {
                Ok(InitiativeCandidate {
                    record: match_from_row(row)?,
                    volunteer_name: row.try_get("name")?,
                })
            })
            .collect()
    }

    async fn recommendations_for_volunteer(
        &self,
        volunteer_id: Uuid,
        query: &CandidateQuery,
    ) -> Result<Vec<VolunteerRecommendation>, StoreError> {
        let sql = format!(
            r#"
            SELECT {MATCH_COLUMNS}, i.title, i.status
              FROM volunteer_initiative_matches m
              JOIN initiatives i ON m.initiative_id = i.id
             WHERE m.volunteer_id = $1
               AND m.match_score >= $2
               AND i.status = 'active'
             ORDER BY m.match_score DESC, m.matched_skill_count DESC, m.initiative_id
             LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(volunteer_id)
            .bind(query.min_score)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.try_get("status")?;
            out.push(VolunteerRecommendation {
                record: match_from_row(row)?,
                initiative_title: row.try_get("title")?,
                initiative_status: status
                    .parse()
                    .map_err(|err: cw_core::UnknownStatus| StoreError::InvalidValue(err.to_string()))?,
            });
        }
        Ok(out)
    }

    async fn find_match(
        &self,
        volunteer_id: Uuid,
        initiative_id: Uuid,
    ) -> Result<Option<MatchRecord>, StoreError> {
        let sql = format!(
            "SELECT {MATCH_COLUMNS} FROM volunteer_initiative_matches m \
             WHERE m.volunteer_id = $1 AND m.initiative_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(volunteer_id)
            .bind(initiative_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(match_from_row).transpose()?)
    }

    async fn match_statistics(&self) -> Result<MatchStatistics, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_matches,
                   COUNT(DISTINCT volunteer_id) AS volunteers_with_matches,
                   COUNT(DISTINCT initiative_id) AS initiatives_with_matches,
                   AVG(match_score) AS average_score,
                   MIN(match_score) AS min_score,
                   MAX(match_score) AS max_score
              FROM volunteer_initiative_matches
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(MatchStatistics {
            total_matches: row.try_get("total_matches")?,
            volunteers_with_matches: row.try_get("volunteers_with_matches")?,
            initiatives_with_matches: row.try_get("initiatives_with_matches")?,
            average_score: row.try_get("average_score")?,
            min_score: row.try_get("min_score")?,
            max_score: row.try_get("max_score")?,
        })
    }

    async fn notification_statistics(
        &self,
        recent_since: DateTime<Utc>,
    ) -> Result<NotificationStatistics, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_notifications,
                   COUNT(*) FILTER (WHERE notified_at >= $1) AS recent_notifications,
                   COUNT(DISTINCT project_id) AS projects_with_notifications,
                   COUNT(DISTINCT volunteer_id) AS volunteers_notified
              FROM candidate_notifications
            "#,
        )
        .bind(recent_since)
        .fetch_one(&self.pool)
        .await?;

        Ok(NotificationStatistics {
            total_notifications: row.try_get("total_notifications")?,
            recent_notifications: row.try_get("recent_notifications")?,
            projects_with_notifications: row.try_get("projects_with_notifications")?,
            volunteers_notified: row.try_get("volunteers_notified")?,
        })
    }
}

struct PgProjectSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ProjectSession for PgProjectSession {
    async fn notify_candidate(
        &mut self,
        record: &NotificationRecord,
        message: &OutboundMessage,
    ) -> Result<bool, StoreError> {
        // An error rolls back to here and leaves earlier candidates intact.
        let mut savepoint = Acquire::begin(&mut self.tx).await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO candidate_notifications
                (id, project_id, volunteer_id, match_score, notification_batch_id, notified_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (project_id, volunteer_id, notification_batch_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.project_id)
        .bind(record.volunteer_id)
        .bind(record.match_score)
        .bind(record.batch_id.as_uuid())
        .bind(record.notified_at)
        .execute(&mut *savepoint)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            insert_message(&mut *savepoint, message).await?;
        }
        savepoint.commit().await?;
        Ok(inserted)
    }

    async fn send_message(&mut self, message: &OutboundMessage) -> Result<(), StoreError> {
        let mut savepoint = Acquire::begin(&mut self.tx).await?;
        insert_message(&mut *savepoint, message).await?;
        savepoint.commit().await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIGRATION: &str = include_str!("../migrations/0001_matching.sql");

    fn required_skills_table() -> &'static str {
        let start = MIGRATION
            .find("CREATE TABLE IF NOT EXISTS initiative_required_skills")
            .unwrap();
        let end = start + MIGRATION[start..].find(");").unwrap();
        &MIGRATION[start..end]
    }

    #[test]
    fn required_skills_keep_duplicates_and_list_order() {
        let table = required_skills_table();
        assert!(table.contains("PRIMARY KEY (initiative_id, position)"));
        assert!(!table.contains("PRIMARY KEY (initiative_id, skill_id)"));
        assert!(!table.contains("UNIQUE"));
        assert!(INITIATIVE_COLUMNS.contains("ORDER BY irs.position"));
    }
}
