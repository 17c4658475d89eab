//! Database layer for SQLite
//!
//! [`Database`] implements both [`RuleStore`] and [`InstanceStore`]. Group
//! commits run in a single transaction and every rule update or delete is
//! predicated on the version the change was computed from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::labels::Fingerprint;
use crate::rule::{AlertRule, AlertRuleGroupKey, AlertRuleKey};
use crate::rule_group::{verify_group_snapshot, GroupDelta};
use crate::state::{AlertInstance, InstanceKey, Status};
use crate::store::{CommittedChanges, InstanceStore, RuleFilter, RuleStore, RuleUpdate};
use crate::{Error, Result};

/// Database configuration
pub struct DatabaseConfig {
    /// Maximum number of connections
    pub max_connections: u32,
    /// Connection acquire timeout
    pub acquire_timeout: Duration,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

const RULE_COLUMNS: &str = "id, org_id, uid, title, condition, data, updated, interval_seconds, \
    version, namespace_uid, rule_group, rule_group_idx, no_data_state, exec_err_state, \
    for_seconds, annotations, labels, is_paused, notification_settings, provenance";

/// Database connection and operations
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with default config
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, DatabaseConfig::default()).await
    }

    /// Create a new database connection with custom config
    pub async fn with_config(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&url)
            .await?;

        // WAL lets the daemon and the CLI share the file
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout=5000")
            .execute(&pool)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(include_str!("../../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn current_version(conn: &mut SqliteConnection, key: &AlertRuleKey) -> Result<Option<i64>> {
    let version: Option<(i64,)> =
        sqlx::query_as("SELECT version FROM alert_rule WHERE org_id = ? AND uid = ?")
            .bind(key.org_id)
            .bind(&key.uid)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(version.map(|(v,)| v))
}

async fn conflict(conn: &mut SqliteConnection, rule: &AlertRule) -> Error {
    match current_version(conn, &rule.key()).await {
        Ok(Some(actual)) => Error::VersionConflict {
            uid: rule.uid.clone(),
            expected: rule.version,
            actual,
        },
        Ok(None) => Error::RuleNotFound(rule.uid.clone()),
        Err(e) => e,
    }
}

async fn insert_rule(conn: &mut SqliteConnection, mut rule: AlertRule) -> Result<AlertRule> {
    if rule.uid.is_empty() {
        rule.uid = uuid::Uuid::new_v4().simple().to_string();
    }
    rule.version = 1;
    rule.updated = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO alert_rule (org_id, uid, title, condition, data, updated, interval_seconds,
            version, namespace_uid, rule_group, rule_group_idx, no_data_state, exec_err_state,
            for_seconds, annotations, labels, is_paused, notification_settings, provenance)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(rule.org_id)
    .bind(&rule.uid)
    .bind(&rule.title)
    .bind(&rule.condition)
    .bind(serde_json::to_string(&rule.data)?)
    .bind(rule.updated.to_rfc3339())
    .bind(rule.interval_seconds)
    .bind(rule.version)
    .bind(&rule.namespace_uid)
    .bind(&rule.rule_group)
    .bind(rule.rule_group_index)
    .bind(rule.no_data_state.as_str())
    .bind(rule.exec_err_state.as_str())
    .bind(rule.for_seconds)
    .bind(serde_json::to_string(&rule.annotations)?)
    .bind(serde_json::to_string(&rule.labels)?)
    .bind(rule.is_paused)
    .bind(
        rule.notification_settings
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    )
    .bind(rule.provenance.as_str())
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        let unique = e
            .as_database_error()
            .map_or(false, |db| db.is_unique_violation());
        if unique {
            Error::DuplicateUid(rule.uid.clone())
        } else {
            Error::Database(e)
        }
    })?;

    rule.id = result.last_insert_rowid();
    Ok(rule)
}

async fn update_rule(conn: &mut SqliteConnection, update: &RuleUpdate) -> Result<AlertRule> {
    let mut rule = update.new.clone();
    rule.id = update.existing.id;
    rule.uid = update.existing.uid.clone();
    rule.version = update.existing.version + 1;
    rule.updated = Utc::now();

    let result = sqlx::query(
        r#"
        UPDATE alert_rule
        SET title = ?, condition = ?, data = ?, updated = ?, interval_seconds = ?,
            version = ?, namespace_uid = ?, rule_group = ?, rule_group_idx = ?,
            no_data_state = ?, exec_err_state = ?, for_seconds = ?, annotations = ?,
            labels = ?, is_paused = ?, notification_settings = ?, provenance = ?
        WHERE org_id = ? AND uid = ? AND version = ?
        "#,
    )
    .bind(&rule.title)
    .bind(&rule.condition)
    .bind(serde_json::to_string(&rule.data)?)
    .bind(rule.updated.to_rfc3339())
    .bind(rule.interval_seconds)
    .bind(rule.version)
    .bind(&rule.namespace_uid)
    .bind(&rule.rule_group)
    .bind(rule.rule_group_index)
    .bind(rule.no_data_state.as_str())
    .bind(rule.exec_err_state.as_str())
    .bind(rule.for_seconds)
    .bind(serde_json::to_string(&rule.annotations)?)
    .bind(serde_json::to_string(&rule.labels)?)
    .bind(rule.is_paused)
    .bind(
        rule.notification_settings
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    )
    .bind(rule.provenance.as_str())
    .bind(update.existing.org_id)
    .bind(&update.existing.uid)
    .bind(update.existing.version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(conflict(conn, &update.existing).await);
    }
    Ok(rule)
}

async fn delete_rule(conn: &mut SqliteConnection, rule: &AlertRule) -> Result<()> {
    let result = sqlx::query("DELETE FROM alert_rule WHERE org_id = ? AND uid = ? AND version = ?")
        .bind(rule.org_id)
        .bind(&rule.uid)
        .bind(rule.version)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(conflict(conn, rule).await);
    }
    Ok(())
}

async fn list_group_rules(
    conn: &mut SqliteConnection,
    key: &AlertRuleGroupKey,
) -> Result<Vec<AlertRule>> {
    let rows: Vec<AlertRuleRow> = sqlx::query_as(&format!(
        "SELECT {} FROM alert_rule WHERE org_id = ? AND namespace_uid = ? AND rule_group = ?",
        RULE_COLUMNS
    ))
    .bind(key.org_id)
    .bind(&key.namespace_uid)
    .bind(&key.rule_group)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(AlertRule::try_from).collect()
}

#[async_trait]
impl RuleStore for Database {
    async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<AlertRule>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM alert_rule WHERE 1 = 1", RULE_COLUMNS));
        if let Some(org_id) = filter.org_id {
            query.push(" AND org_id = ").push_bind(org_id);
        }
        if let Some(namespace_uid) = &filter.namespace_uid {
            query.push(" AND namespace_uid = ").push_bind(namespace_uid.clone());
        }
        if let Some(rule_group) = &filter.rule_group {
            query.push(" AND rule_group = ").push_bind(rule_group.clone());
        }
        if !filter.uids.is_empty() {
            query.push(" AND uid IN (");
            let mut uids = query.separated(", ");
            for uid in &filter.uids {
                uids.push_bind(uid.clone());
            }
            uids.push_unseparated(")");
        }
        query.push(" ORDER BY org_id, namespace_uid, rule_group, rule_group_idx, uid");

        let rows: Vec<AlertRuleRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(AlertRule::try_from).collect()
    }

    async fn insert_rules(&self, rules: Vec<AlertRule>) -> Result<Vec<AlertRule>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rules.len());
        for rule in rules {
            inserted.push(insert_rule(&mut *tx, rule).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn update_rules(&self, updates: Vec<RuleUpdate>) -> Result<Vec<AlertRule>> {
        let mut tx = self.pool.begin().await?;
        let mut updated = Vec::with_capacity(updates.len());
        for update in &updates {
            updated.push(update_rule(&mut *tx, update).await?);
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_rules_by_uid(&self, org_id: i64, uids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for uid in uids {
            sqlx::query("DELETE FROM alert_rule WHERE org_id = ? AND uid = ?")
                .bind(org_id)
                .bind(uid)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn commit_group_changes(&self, delta: &GroupDelta) -> Result<CommittedChanges> {
        let mut tx = self.pool.begin().await?;
        let mut committed = CommittedChanges::default();

        // A returned error drops the transaction, which rolls it back
        let current = list_group_rules(&mut *tx, &delta.group_key).await?;
        verify_group_snapshot(delta, &current)?;

        for rule in &delta.delete {
            delete_rule(&mut *tx, rule).await?;
            committed.deleted.push(rule.clone());
        }
        for change in &delta.update {
            let update = RuleUpdate {
                existing: change.existing.clone(),
                new: change.new.clone(),
            };
            let new = update_rule(&mut *tx, &update).await?;
            committed.updated.push(RuleUpdate {
                existing: update.existing,
                new,
            });
        }
        for rule in &delta.new {
            committed.inserted.push(insert_rule(&mut *tx, rule.clone()).await?);
        }

        tx.commit().await?;
        debug!(group = %delta.group_key, "Committed rule group changes");
        Ok(committed)
    }
}

#[async_trait]
impl InstanceStore for Database {
    async fn list_instances(&self, org_id: i64) -> Result<Vec<AlertInstance>> {
        let rows: Vec<AlertInstanceRow> = sqlx::query_as(
            r#"
            SELECT org_id, rule_uid, fingerprint, labels, state, reason, starts_at, ends_at,
                last_eval_time, last_eval_string, error, resolved, resolved_at, last_sent_at
            FROM alert_instance
            WHERE org_id = ?
            ORDER BY rule_uid, fingerprint
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AlertInstance::try_from).collect()
    }

    async fn upsert_instances(&self, instances: &[AlertInstance]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for instance in instances {
            sqlx::query(
                r#"
                INSERT INTO alert_instance (org_id, rule_uid, fingerprint, labels, state, reason,
                    starts_at, ends_at, last_eval_time, last_eval_string, error, resolved,
                    resolved_at, last_sent_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (org_id, rule_uid, fingerprint) DO UPDATE SET
                    labels = excluded.labels,
                    state = excluded.state,
                    reason = excluded.reason,
                    starts_at = excluded.starts_at,
                    ends_at = excluded.ends_at,
                    last_eval_time = excluded.last_eval_time,
                    last_eval_string = excluded.last_eval_string,
                    error = excluded.error,
                    resolved = excluded.resolved,
                    resolved_at = excluded.resolved_at,
                    last_sent_at = excluded.last_sent_at
                "#,
            )
            .bind(instance.org_id)
            .bind(&instance.rule_uid)
            .bind(instance.fingerprint.to_string())
            .bind(serde_json::to_string(&instance.labels)?)
            .bind(instance.state().as_str())
            .bind(instance.reason().to_string())
            .bind(instance.starts_at.to_rfc3339())
            .bind(instance.ends_at.to_rfc3339())
            .bind(instance.last_evaluation_time.to_rfc3339())
            .bind(&instance.last_evaluation_string)
            .bind(&instance.error)
            .bind(instance.resolved)
            .bind(instance.resolved_at.map(|t| t.to_rfc3339()))
            .bind(instance.last_sent_at.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_instances(&self, keys: &[InstanceKey]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query(
                "DELETE FROM alert_instance WHERE org_id = ? AND rule_uid = ? AND fingerprint = ?",
            )
            .bind(key.rule.org_id)
            .bind(&key.rule.uid)
            .bind(key.fingerprint.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[derive(sqlx::FromRow)]
struct AlertRuleRow {
    id: i64,
    org_id: i64,
    uid: String,
    title: String,
    condition: String,
    data: String,
    updated: String,
    interval_seconds: i64,
    version: i64,
    namespace_uid: String,
    rule_group: String,
    rule_group_idx: i32,
    no_data_state: String,
    exec_err_state: String,
    for_seconds: i64,
    annotations: String,
    labels: String,
    is_paused: bool,
    notification_settings: Option<String>,
    provenance: String,
}

impl TryFrom<AlertRuleRow> for AlertRule {
    type Error = crate::Error;

    fn try_from(row: AlertRuleRow) -> Result<Self> {
        Ok(AlertRule {
            id: row.id,
            org_id: row.org_id,
            uid: row.uid,
            title: row.title,
            condition: row.condition,
            data: serde_json::from_str(&row.data)?,
            updated: parse_time(&row.updated)?,
            interval_seconds: row.interval_seconds,
            version: row.version,
            namespace_uid: row.namespace_uid,
            rule_group: row.rule_group,
            rule_group_index: row.rule_group_idx,
            no_data_state: row.no_data_state.parse()?,
            exec_err_state: row.exec_err_state.parse()?,
            for_seconds: row.for_seconds,
            annotations: serde_json::from_str(&row.annotations)?,
            labels: serde_json::from_str(&row.labels)?,
            is_paused: row.is_paused,
            notification_settings: row
                .notification_settings
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            provenance: row.provenance.parse()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertInstanceRow {
    org_id: i64,
    rule_uid: String,
    fingerprint: String,
    labels: String,
    state: String,
    reason: String,
    starts_at: String,
    ends_at: String,
    last_eval_time: String,
    last_eval_string: String,
    error: Option<String>,
    resolved: bool,
    resolved_at: Option<String>,
    last_sent_at: Option<String>,
}

impl TryFrom<AlertInstanceRow> for AlertInstance {
    type Error = crate::Error;

    fn try_from(row: AlertInstanceRow) -> Result<Self> {
        let key = AlertRuleKey::new(row.org_id, row.rule_uid);
        let starts_at = parse_time(&row.starts_at)?;
        let mut instance = AlertInstance::new(&key, serde_json::from_str(&row.labels)?, starts_at);

        let stored: Fingerprint = row.fingerprint.parse()?;
        if stored != instance.fingerprint {
            return Err(Error::Parse(format!(
                "Fingerprint {} does not match labels of instance of rule {}",
                stored, key.uid
            )));
        }

        instance.status = Status::new(row.state.parse()?, row.reason.parse()?)?;
        instance.ends_at = parse_time(&row.ends_at)?;
        instance.last_evaluation_time = parse_time(&row.last_eval_time)?;
        instance.last_evaluation_string = row.last_eval_string;
        instance.error = row.error;
        instance.resolved = row.resolved;
        instance.resolved_at = row.resolved_at.as_deref().map(parse_time).transpose()?;
        instance.last_sent_at = row.last_sent_at.as_deref().map(parse_time).transpose()?;
        Ok(instance)
    }
}
