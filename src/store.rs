use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::EvalConfig;
use crate::models::{EvaluationRecord, Submission};

// Narrow store surface: add, query by equality, delete by id, ordered list.
// The upsert and clear policies are built on these and nothing else.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn init(&self) -> anyhow::Result<()>;

    async fn add(&self, record: &EvaluationRecord) -> anyhow::Result<()>;

    async fn query_by_pair(
        &self,
        evaluator: &str,
        target: &str,
    ) -> anyhow::Result<Vec<EvaluationRecord>>;

    async fn query_by_target(&self, target: &str) -> anyhow::Result<Vec<EvaluationRecord>>;

    async fn delete_by_id(&self, id: &str) -> anyhow::Result<()>;

    // Timestamp-descending on Postgres; file order on the local fallback.
    async fn list_ordered(&self) -> anyhow::Result<Vec<EvaluationRecord>>;
}

// Insert-or-replace keyed on (evaluator, target): delete every prior match,
// then insert with a fresh id and timestamp. Delete and insert are awaited in
// order but not atomic; a failed save leaves state unknown and the caller
// should retry.
pub async fn save_evaluation(
    store: &dyn RecordStore,
    config: &EvalConfig,
    submission: Submission,
) -> anyhow::Result<EvaluationRecord> {
    config.validate_submission(&submission)?;

    let existing = store
        .query_by_pair(&submission.evaluator, &submission.target)
        .await
        .context("failed to look up prior evaluations for this pair")?;

    // Normally at most one, but clear out duplicates left by any earlier
    // inconsistent state.
    for prior in &existing {
        store
            .delete_by_id(&prior.id)
            .await
            .with_context(|| format!("failed to delete prior evaluation {}", prior.id))?;
    }

    let record = EvaluationRecord {
        id: Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        evaluator: submission.evaluator,
        target: submission.target,
        pos_scores: submission.pos_scores,
        neg_scores: submission.neg_scores,
        text_start: submission.text_start,
        text_stop: submission.text_stop,
        text_continue: submission.text_continue,
    };

    store
        .add(&record)
        .await
        .context("failed to insert evaluation")?;
    Ok(record)
}

// Stops at the first failed delete; records removed before the failure stay
// removed.
pub async fn clear_all(store: &dyn RecordStore) -> anyhow::Result<usize> {
    let records = store
        .list_ordered()
        .await
        .context("failed to enumerate evaluations")?;

    let mut deleted = 0usize;
    for record in &records {
        store.delete_by_id(&record.id).await.with_context(|| {
            format!(
                "failed to delete evaluation {} ({} evaluations already removed); \
                 check the store's access rules allow deletes",
                record.id, deleted
            )
        })?;
        deleted += 1;
    }

    Ok(deleted)
}

// Sample evaluations for demos, written through the upsert path so re-running
// seed stays idempotent per pair.
pub async fn seed(store: &dyn RecordStore, config: &EvalConfig) -> anyhow::Result<usize> {
    let target = config.roster[0].clone();
    let evaluators: Vec<String> = config.targets_for(&target)
        .into_iter()
        .take(3)
        .map(str::to_owned)
        .collect();

    let mut inserted = 0usize;
    for (i, evaluator) in evaluators.iter().enumerate() {
        let base = 6.0 + i as f64;
        let mut pos_scores = HashMap::new();
        for q in config.positive_questions() {
            pos_scores.insert(q.to_string(), base.min(10.0));
        }
        let mut neg_scores = HashMap::new();
        for q in config.negative_questions() {
            neg_scores.insert(q.to_string(), (3.0 - i as f64).max(0.0));
        }

        save_evaluation(
            store,
            config,
            Submission {
                evaluator: evaluator.clone(),
                target: target.clone(),
                pos_scores,
                neg_scores,
                text_start: "多给团队一线支持".to_string(),
                text_stop: String::new(),
                text_continue: "保持跨部门响应速度".to_string(),
            },
        )
        .await?;
        inserted += 1;
    }

    Ok(inserted)
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> anyhow::Result<EvaluationRecord> {
        let id: Uuid = row.get("id");
        let pos_scores: HashMap<String, f64> =
            serde_json::from_value(row.get::<serde_json::Value, _>("pos_scores"))
                .context("malformed pos_scores column")?;
        let neg_scores: HashMap<String, f64> =
            serde_json::from_value(row.get::<serde_json::Value, _>("neg_scores"))
                .context("malformed neg_scores column")?;

        Ok(EvaluationRecord {
            id: id.to_string(),
            timestamp: row.get::<DateTime<Utc>, _>("submitted_at"),
            evaluator: row.get("evaluator"),
            target: row.get("target"),
            pos_scores,
            neg_scores,
            text_start: row.get("text_start"),
            text_stop: row.get("text_stop"),
            text_continue: row.get("text_continue"),
        })
    }

    async fn fetch_where(
        &self,
        suffix: &str,
        binds: &[&str],
    ) -> anyhow::Result<Vec<EvaluationRecord>> {
        let query = format!(
            "SELECT id, evaluator, target, pos_scores, neg_scores, \
             text_start, text_stop, text_continue, submitted_at \
             FROM evaluations {suffix}"
        );
        let mut q = sqlx::query(&query);
        for bind in binds {
            q = q.bind(*bind);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(Self::record_from_row).collect()
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS evaluations (
                id UUID PRIMARY KEY,
                evaluator TEXT NOT NULL,
                target TEXT NOT NULL,
                pos_scores JSONB NOT NULL,
                neg_scores JSONB NOT NULL,
                text_start TEXT NOT NULL DEFAULT '',
                text_stop TEXT NOT NULL DEFAULT '',
                text_continue TEXT NOT NULL DEFAULT '',
                submitted_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create evaluations table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS evaluations_pair_idx \
             ON evaluations (evaluator, target)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS evaluations_target_idx ON evaluations (target)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn add(&self, record: &EvaluationRecord) -> anyhow::Result<()> {
        let id = Uuid::parse_str(&record.id)
            .with_context(|| format!("record id {:?} is not a uuid", record.id))?;
        sqlx::query(
            r#"
            INSERT INTO evaluations
            (id, evaluator, target, pos_scores, neg_scores,
             text_start, text_stop, text_continue, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(&record.evaluator)
        .bind(&record.target)
        .bind(serde_json::to_value(&record.pos_scores)?)
        .bind(serde_json::to_value(&record.neg_scores)?)
        .bind(&record.text_start)
        .bind(&record.text_stop)
        .bind(&record.text_continue)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_by_pair(
        &self,
        evaluator: &str,
        target: &str,
    ) -> anyhow::Result<Vec<EvaluationRecord>> {
        self.fetch_where("WHERE evaluator = $1 AND target = $2", &[evaluator, target])
            .await
    }

    async fn query_by_target(&self, target: &str) -> anyhow::Result<Vec<EvaluationRecord>> {
        self.fetch_where("WHERE target = $1", &[target]).await
    }

    async fn delete_by_id(&self, id: &str) -> anyhow::Result<()> {
        let id = Uuid::parse_str(id).with_context(|| format!("record id {id:?} is not a uuid"))?;
        sqlx::query("DELETE FROM evaluations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_ordered(&self) -> anyhow::Result<Vec<EvaluationRecord>> {
        self.fetch_where("ORDER BY submitted_at DESC", &[]).await
    }
}

// ---------------------------------------------------------------------------
// Local JSON-file fallback
// ---------------------------------------------------------------------------

// Whole record set kept as one JSON array on disk, rewritten on every
// mutation. Good enough for a seventeen-person roster.
pub struct LocalStore {
    path: PathBuf,
}

impl LocalStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> anyhow::Result<Vec<EvaluationRecord>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("corrupt record file {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err).context(format!("failed to read {}", self.path.display())),
        }
    }

    fn persist(&self, records: &[EvaluationRecord]) -> anyhow::Result<()> {
        let raw = serde_json::to_string_pretty(records)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

#[async_trait]
impl RecordStore for LocalStore {
    async fn init(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        Ok(())
    }

    async fn add(&self, record: &EvaluationRecord) -> anyhow::Result<()> {
        let mut records = self.load()?;
        records.push(record.clone());
        self.persist(&records)
    }

    async fn query_by_pair(
        &self,
        evaluator: &str,
        target: &str,
    ) -> anyhow::Result<Vec<EvaluationRecord>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.evaluator == evaluator && r.target == target)
            .collect())
    }

    async fn query_by_target(&self, target: &str) -> anyhow::Result<Vec<EvaluationRecord>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|r| r.target == target)
            .collect())
    }

    async fn delete_by_id(&self, id: &str) -> anyhow::Result<()> {
        let mut records = self.load()?;
        records.retain(|r| r.id != id);
        self.persist(&records)
    }

    async fn list_ordered(&self) -> anyhow::Result<Vec<EvaluationRecord>> {
        self.load()
    }
}
