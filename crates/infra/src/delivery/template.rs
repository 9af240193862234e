//! Stored body templates and their Handlebars rendering.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use hookrelay_core::{Payload, TemplateId};

/// A named body template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub id: TemplateId,
    pub name: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("template render failed: {0}")]
    Render(String),
    #[error("template storage error: {0}")]
    Storage(String),
}

/// Template storage.
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn find_by_name(&self, name: &str) -> Result<Option<TemplateConfig>, TemplateError>;

    async fn find_by_id(&self, id: TemplateId) -> Result<Option<TemplateConfig>, TemplateError>;

    /// Create the template or replace the content stored under `name`.
    async fn upsert(&self, name: &str, content: &str) -> Result<TemplateConfig, TemplateError>;
}

/// Turns a template reference plus a job payload into a request body.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, template_id: TemplateId, model: &Payload)
    -> Result<String, TemplateError>;
}

/// In-memory template repository for tests/dev.
#[derive(Debug)]
pub struct InMemoryTemplateRepository {
    inner: RwLock<Templates>,
}

#[derive(Debug)]
struct Templates {
    next_id: i64,
    by_name: BTreeMap<String, TemplateConfig>,
}

impl Default for InMemoryTemplateRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTemplateRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Templates {
                next_id: 1,
                by_name: BTreeMap::new(),
            }),
        }
    }
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateRepository {
    async fn find_by_name(&self, name: &str) -> Result<Option<TemplateConfig>, TemplateError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.by_name.get(name).cloned())
    }

    async fn find_by_id(&self, id: TemplateId) -> Result<Option<TemplateConfig>, TemplateError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.by_name.values().find(|t| t.id == id).cloned())
    }

    async fn upsert(&self, name: &str, content: &str) -> Result<TemplateConfig, TemplateError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        if let Some(existing) = inner.by_name.get_mut(name) {
            existing.content = content.to_string();
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let id = TemplateId::new(inner.next_id);
        inner.next_id += 1;
        let template = TemplateConfig {
            id,
            name: name.to_string(),
            content: content.to_string(),
            updated_at: now,
        };
        inner.by_name.insert(name.to_string(), template.clone());
        Ok(template)
    }
}

/// Postgres-backed template repository over `template_config`.
#[derive(Debug, Clone)]
pub struct PostgresTemplateRepository {
    pool: PgPool,
}

impl PostgresTemplateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for PostgresTemplateRepository {
    #[instrument(skip(self), err)]
    async fn find_by_name(&self, name: &str) -> Result<Option<TemplateConfig>, TemplateError> {
        let row = sqlx::query(
            "SELECT id, name, content, updated_at FROM template_config WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_name", e))?;

        row.as_ref().map(template_from_row).transpose()
    }

    #[instrument(skip(self), fields(template_id = %id), err)]
    async fn find_by_id(&self, id: TemplateId) -> Result<Option<TemplateConfig>, TemplateError> {
        let row =
            sqlx::query("SELECT id, name, content, updated_at FROM template_config WHERE id = $1")
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.as_ref().map(template_from_row).transpose()
    }

    #[instrument(skip(self, content), err)]
    async fn upsert(&self, name: &str, content: &str) -> Result<TemplateConfig, TemplateError> {
        let row = sqlx::query(
            r#"
            INSERT INTO template_config (name, content, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (name) DO UPDATE
            SET content = EXCLUDED.content, updated_at = EXCLUDED.updated_at
            RETURNING id, name, content, updated_at
            "#,
        )
        .bind(name)
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_template", e))?;

        template_from_row(&row)
    }
}

fn template_from_row(row: &PgRow) -> Result<TemplateConfig, TemplateError> {
    let storage = |e: sqlx::Error| map_sqlx_error("template_from_row", e);
    Ok(TemplateConfig {
        id: TemplateId::new(row.try_get("id").map_err(storage)?),
        name: row.try_get("name").map_err(storage)?,
        content: row.try_get("content").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TemplateError {
    match err {
        sqlx::Error::Database(db_err) => {
            TemplateError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            TemplateError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { index, source } => {
            TemplateError::Storage(format!("column {index} in {operation}: {source}"))
        }
        _ => TemplateError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Renders stored templates with Handlebars.
///
/// Output is not HTML-escaped since bodies are usually JSON.
pub struct HandlebarsRenderer {
    repository: Arc<dyn TemplateRepository>,
    handlebars: Handlebars<'static>,
}

impl HandlebarsRenderer {
    pub fn new(repository: Arc<dyn TemplateRepository>) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        Self {
            repository,
            handlebars,
        }
    }
}

#[async_trait]
impl TemplateRenderer for HandlebarsRenderer {
    async fn render(
        &self,
        template_id: TemplateId,
        model: &Payload,
    ) -> Result<String, TemplateError> {
        let template = self
            .repository
            .find_by_id(template_id)
            .await?
            .ok_or_else(|| TemplateError::NotFound(template_id.to_string()))?;

        self.handlebars
            .render_template(&template.content, model)
            .map_err(|e| TemplateError::Render(format!("{}: {e}", template.name)))
    }
}
