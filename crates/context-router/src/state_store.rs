//! Durable profile and ranking-model state.
//!
//! Profiles edited at runtime and every published ranking model are
//! written here so a restart resumes from the last published version.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use context_router_core::feedback::ModelPersistence;
use context_router_core::profile::AgentProfile;
use context_router_core::ranker::RankingModelState;

#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save_profile(&self, profile: &AgentProfile) -> Result<()> {
        let body = serde_json::to_string(profile)?;
        sqlx::query(
            r#"
            INSERT INTO profiles (id, body_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                body_json = excluded.body_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.id)
        .bind(body)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stored profiles, ordered by id.
    pub async fn load_profiles(&self) -> Result<Vec<AgentProfile>> {
        let rows = sqlx::query("SELECT id, body_json FROM profiles ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let body: String = row.get("body_json");
                serde_json::from_str(&body).with_context(|| format!("corrupt stored profile '{}'", id))
            })
            .collect()
    }

    /// Highest persisted model version, if any.
    pub async fn latest_model(&self) -> Result<Option<RankingModelState>> {
        let body: Option<String> =
            sqlx::query_scalar("SELECT body_json FROM model_versions ORDER BY version DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        body.map(|b| serde_json::from_str(&b).context("corrupt stored ranking model"))
            .transpose()
    }

    pub async fn model_history(&self) -> Result<Vec<(u64, i64)>> {
        let rows = sqlx::query("SELECT version, created_at FROM model_versions ORDER BY version")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<i64, _>("version") as u64, r.get::<i64, _>("created_at")))
            .collect())
    }
}

#[async_trait]
impl ModelPersistence for SqliteStateStore {
    async fn save_model(&self, model: &RankingModelState) -> Result<()> {
        let body = serde_json::to_string(model)?;
        sqlx::query(
            "INSERT OR REPLACE INTO model_versions (version, body_json, created_at) VALUES (?, ?, ?)",
        )
        .bind(model.version as i64)
        .bind(body)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use context_router_core::profile::builtin_profiles;

    async fn state() -> SqliteStateStore {
        let pool = db::connect_memory().await.unwrap();
        migrate::apply(&pool).await.unwrap();
        SqliteStateStore::new(pool)
    }

    #[tokio::test]
    async fn profiles_overwrite_by_id() {
        let state = state().await;
        let mut profile = builtin_profiles().remove(0);
        state.save_profile(&profile).await.unwrap();
        profile.description = "edited".into();
        state.save_profile(&profile).await.unwrap();

        let loaded = state.load_profiles().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], profile);
    }

    #[tokio::test]
    async fn latest_model_is_highest_version() {
        let state = state().await;
        assert!(state.latest_model().await.unwrap().is_none());

        let v1 = RankingModelState::initial();
        let mut v2 = v1.successor();
        v2.feature_weights.insert("symbol_match".into(), 1.5);
        state.save_model(&v2).await.unwrap();
        state.save_model(&v1).await.unwrap();

        let latest = state.latest_model().await.unwrap().unwrap();
        assert_eq!(latest, v2);
        assert_eq!(state.model_history().await.unwrap().len(), 2);
    }
}
