use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::models::job::EmbeddingItem;

/// Dictionary phrase storage. The schema belongs to the hosted backend;
/// this is the narrow slice the embedding jobs need.
#[async_trait]
pub trait DictionaryRepository: Send + Sync {
    /// Every phrase of an organization's dictionary, or of every
    /// organization when `organization_id` is `None`.
    async fn list_phrases(
        &self,
        organization_id: Option<i64>,
    ) -> Result<Vec<EmbeddingItem>, sqlx::Error>;

    async fn save_embedding(&self, phrase_id: i64, embedding: &[f32]) -> Result<(), sqlx::Error>;

    /// Connectivity probe for health checks.
    async fn ping(&self) -> Result<(), sqlx::Error>;
}

pub struct PgDictionaryRepository {
    pool: PgPool,
}

impl PgDictionaryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DictionaryRepository for PgDictionaryRepository {
    async fn list_phrases(
        &self,
        organization_id: Option<i64>,
    ) -> Result<Vec<EmbeddingItem>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, phrase
            FROM dictionary_phrases
            WHERE $1::BIGINT IS NULL OR organization_id = $1
            ORDER BY id
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(EmbeddingItem {
                    id: r.try_get("id")?,
                    phrase: r.try_get("phrase")?,
                })
            })
            .collect()
    }

    async fn save_embedding(&self, phrase_id: i64, embedding: &[f32]) -> Result<(), sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE dictionary_phrases
            SET embedding = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(phrase_id)
        .bind(embedding)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
