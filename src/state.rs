// AutoPeer: BGP peering automation toolchain written in Rust
// Copyright (C) 2022-2023 AutoPeer contributors <noc@autopeer.example.net>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Durable run history in SQLite: discrete events, generation runs and
//! deployment runs. Every generation/deployment row is written together
//! with a correlated event row in one transaction, so neither can exist
//! without the other. Rows are immutable once written; only the retention
//! cleanup deletes them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::config::StateConfig;

/// Types of events that can be tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GenerationStart,
    GenerationSuccess,
    GenerationFailure,
    DeploymentStart,
    DeploymentSuccess,
    DeploymentFailure,
    ValidationSuccess,
    ValidationFailure,
    ApiCallSuccess,
    ApiCallFailure,
    ConfigReload,
    Error,
    Warning,
    Info,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::GenerationStart => "generation_start",
            EventKind::GenerationSuccess => "generation_success",
            EventKind::GenerationFailure => "generation_failure",
            EventKind::DeploymentStart => "deployment_start",
            EventKind::DeploymentSuccess => "deployment_success",
            EventKind::DeploymentFailure => "deployment_failure",
            EventKind::ValidationSuccess => "validation_success",
            EventKind::ValidationFailure => "validation_failure",
            EventKind::ApiCallSuccess => "api_call_success",
            EventKind::ApiCallFailure => "api_call_failure",
            EventKind::ConfigReload => "config_reload",
            EventKind::Error => "error",
            EventKind::Warning => "warning",
            EventKind::Info => "info",
        }
    }
}

impl FromStr for EventKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "generation_start" => EventKind::GenerationStart,
            "generation_success" => EventKind::GenerationSuccess,
            "generation_failure" => EventKind::GenerationFailure,
            "deployment_start" => EventKind::DeploymentStart,
            "deployment_success" => EventKind::DeploymentSuccess,
            "deployment_failure" => EventKind::DeploymentFailure,
            "validation_success" => EventKind::ValidationSuccess,
            "validation_failure" => EventKind::ValidationFailure,
            "api_call_success" => EventKind::ApiCallSuccess,
            "api_call_failure" => EventKind::ApiCallFailure,
            "config_reload" => EventKind::ConfigReload,
            "error" => EventKind::Error,
            "warning" => EventKind::Warning,
            "info" => EventKind::Info,
            other => return Err(StateError::UnknownEventKind(other.to_string())),
        })
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete tracked event.
#[derive(Debug, Clone, Serialize)]
pub struct StateEvent {
    pub id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    pub component: String,
    pub message: String,
    pub details: serde_json::Value,
    pub duration_ms: Option<i64>,
    pub success: bool,
}

impl StateEvent {
    pub fn new(kind: EventKind, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: None,
            timestamp: OffsetDateTime::now_utc(),
            kind,
            component: component.into(),
            message: message.into(),
            details: serde_json::Value::Null,
            duration_ms: None,
            success: true,
        }
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn failure(mut self) -> Self {
        self.success = false;
        self
    }
}

/// One configuration generation run.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRecord {
    pub id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub config_hash: String,
    pub peer_count: i64,
    pub filter_count: i64,
    pub duration_ms: i64,
    pub memory_peak_mb: f64,
    pub success: bool,
    pub error_message: String,
    pub metadata: serde_json::Value,
}

impl Default for GenerationRecord {
    fn default() -> Self {
        Self {
            id: None,
            timestamp: OffsetDateTime::now_utc(),
            config_hash: String::new(),
            peer_count: 0,
            filter_count: 0,
            duration_ms: 0,
            memory_peak_mb: 0.0,
            success: true,
            error_message: String::new(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// One configuration deployment to a single router.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRecord {
    pub id: Option<i64>,
    pub generation_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub router: String,
    pub config_hash: String,
    pub deployment_method: String,
    pub duration_ms: i64,
    pub success: bool,
    pub error_message: String,
    pub validation_passed: bool,
    pub rollback_required: bool,
}

impl Default for DeploymentRecord {
    fn default() -> Self {
        Self {
            id: None,
            generation_id: None,
            timestamp: OffsetDateTime::now_utc(),
            router: String::new(),
            config_hash: String::new(),
            deployment_method: "ssh".to_string(),
            duration_ms: 0,
            success: true,
            error_message: String::new(),
            validation_passed: true,
            rollback_required: false,
        }
    }
}

/// Windowed aggregation over the stored history.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub period_days: i64,
    pub generations: GenerationStats,
    pub deployments: DeploymentStats,
    pub errors: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationStats {
    pub total: i64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: i64,
    pub avg_memory_mb: f64,
    pub max_memory_mb: f64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStats {
    pub total: i64,
    pub avg_duration_ms: f64,
    pub success_rate: f64,
    pub routers_count: i64,
}

/// Row counts removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub events_deleted: usize,
    pub generations_deleted: usize,
    pub deployments_deleted: usize,
}

/// Handle over the state database. Cheap to clone; every call opens its own
/// connection, so concurrent writers from the deployment workers rely on
/// SQLite's own locking.
#[derive(Debug, Clone)]
pub struct StateStore {
    db_path: PathBuf,
    retention_days: i64,
    retention_generations: i64,
    track_generations: bool,
    track_deployments: bool,
    track_errors: bool,
}

impl StateStore {
    /// Open (and, if needed, create) the state database.
    pub fn open(config: &StateConfig) -> Result<Self, StateError> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            db_path: config.database_path.clone(),
            retention_days: config.retention.days,
            retention_generations: config.retention.generations,
            track_generations: config.events.track_generations,
            track_deployments: config.events.track_deployments,
            track_errors: config.events.track_errors,
        };
        store.init_schema()?;
        log::debug!("[state] database ready: {}", store.db_path.display());
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StateError> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<(), StateError> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                component TEXT NOT NULL,
                message TEXT,
                details TEXT,
                duration_ms INTEGER,
                success INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS generations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                config_hash TEXT NOT NULL,
                peer_count INTEGER DEFAULT 0,
                filter_count INTEGER DEFAULT 0,
                duration_ms INTEGER DEFAULT 0,
                memory_peak_mb REAL DEFAULT 0.0,
                success INTEGER DEFAULT 1,
                error_message TEXT,
                metadata TEXT
            );
            CREATE TABLE IF NOT EXISTS deployments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                generation_id INTEGER,
                timestamp INTEGER NOT NULL,
                router TEXT NOT NULL,
                config_hash TEXT NOT NULL,
                deployment_method TEXT DEFAULT 'ssh',
                duration_ms INTEGER DEFAULT 0,
                success INTEGER DEFAULT 1,
                error_message TEXT,
                validation_passed INTEGER DEFAULT 1,
                rollback_required INTEGER DEFAULT 0,
                FOREIGN KEY (generation_id) REFERENCES generations (id)
            );
            CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
            CREATE INDEX IF NOT EXISTS idx_generations_timestamp ON generations(timestamp);
            CREATE INDEX IF NOT EXISTS idx_deployments_timestamp ON deployments(timestamp);
            CREATE INDEX IF NOT EXISTS idx_deployments_router ON deployments(router);",
        )?;
        Ok(())
    }

    fn should_track(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::GenerationStart
            | EventKind::GenerationSuccess
            | EventKind::GenerationFailure => self.track_generations,
            EventKind::DeploymentStart
            | EventKind::DeploymentSuccess
            | EventKind::DeploymentFailure => self.track_deployments,
            EventKind::Error | EventKind::Warning => self.track_errors,
            _ => true,
        }
    }

    /// Persist a discrete event. Returns 0 when the event category is not
    /// tracked.
    pub fn track_event(&self, event: &StateEvent) -> Result<i64, StateError> {
        if !self.should_track(event.kind) {
            return Ok(0);
        }
        let conn = self.connect()?;
        let id = insert_event(&conn, event)?;
        log::debug!("[state] tracked event {} (ID: {id})", event.kind);
        Ok(id)
    }

    /// Persist a generation record together with its correlated event.
    pub fn track_generation(&self, generation: &GenerationRecord) -> Result<i64, StateError> {
        if !self.track_generations {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO generations (timestamp, config_hash, peer_count, filter_count,
                                      duration_ms, memory_peak_mb, success, error_message, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                generation.timestamp.unix_timestamp(),
                generation.config_hash,
                generation.peer_count,
                generation.filter_count,
                generation.duration_ms,
                generation.memory_peak_mb,
                generation.success,
                generation.error_message,
                json_text(&generation.metadata),
            ],
        )?;
        let generation_id = tx.last_insert_rowid();

        let event = if generation.success {
            StateEvent::new(
                EventKind::GenerationSuccess,
                "generate",
                format!(
                    "Generated configuration for {} peers",
                    generation.peer_count
                ),
            )
            .details(serde_json::json!({
                "generation_id": generation_id,
                "peer_count": generation.peer_count,
                "filter_count": generation.filter_count,
                "duration_ms": generation.duration_ms,
                "memory_peak_mb": generation.memory_peak_mb,
            }))
            .duration_ms(generation.duration_ms)
        } else {
            StateEvent::new(
                EventKind::GenerationFailure,
                "generate",
                format!("Generation failed: {}", generation.error_message),
            )
            .details(serde_json::json!({ "generation_id": generation_id }))
            .failure()
        };
        insert_event(&tx, &event)?;
        tx.commit()?;

        log::info!("[state] tracked generation ID {generation_id}");
        Ok(generation_id)
    }

    /// Persist a deployment record together with its correlated event.
    pub fn track_deployment(&self, deployment: &DeploymentRecord) -> Result<i64, StateError> {
        if !self.track_deployments {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO deployments (generation_id, timestamp, router, config_hash,
                                      deployment_method, duration_ms, success, error_message,
                                      validation_passed, rollback_required)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                deployment.generation_id,
                deployment.timestamp.unix_timestamp(),
                deployment.router,
                deployment.config_hash,
                deployment.deployment_method,
                deployment.duration_ms,
                deployment.success,
                deployment.error_message,
                deployment.validation_passed,
                deployment.rollback_required,
            ],
        )?;
        let deployment_id = tx.last_insert_rowid();

        let event = if deployment.success {
            StateEvent::new(
                EventKind::DeploymentSuccess,
                "deploy",
                format!("Deployed configuration to {}", deployment.router),
            )
            .details(serde_json::json!({
                "deployment_id": deployment_id,
                "router": deployment.router,
                "method": deployment.deployment_method,
                "duration_ms": deployment.duration_ms,
                "validation_passed": deployment.validation_passed,
            }))
            .duration_ms(deployment.duration_ms)
        } else {
            StateEvent::new(
                EventKind::DeploymentFailure,
                "deploy",
                format!(
                    "Deployment to {} failed: {}",
                    deployment.router, deployment.error_message
                ),
            )
            .details(serde_json::json!({
                "deployment_id": deployment_id,
                "router": deployment.router,
                "rollback_required": deployment.rollback_required,
            }))
            .failure()
        };
        insert_event(&tx, &event)?;
        tx.commit()?;

        log::info!(
            "[state] tracked deployment ID {deployment_id} to {}",
            deployment.router
        );
        Ok(deployment_id)
    }

    /// The most recent events, newest first, optionally filtered by kind.
    pub fn recent_events(
        &self,
        limit: usize,
        kind: Option<EventKind>,
    ) -> Result<Vec<StateEvent>, StateError> {
        let conn = self.connect()?;
        let sql = match kind {
            Some(_) => {
                "SELECT id, timestamp, event_type, component, message, details, duration_ms, success
                 FROM events WHERE event_type = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2"
            }
            None => {
                "SELECT id, timestamp, event_type, component, message, details, duration_ms, success
                 FROM events ORDER BY timestamp DESC, id DESC LIMIT ?1"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(i64, i64, String, String, Option<String>, Option<String>, Option<i64>, bool)> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        };
        let rows: Vec<_> = match kind {
            Some(k) => stmt
                .query_map(params![k.as_str(), limit as i64], map_row)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map(params![limit as i64], map_row)?
                .collect::<rusqlite::Result<_>>()?,
        };

        let mut events = Vec::with_capacity(rows.len());
        for (id, ts, kind, component, message, details, duration_ms, success) in rows {
            let kind = match kind.parse::<EventKind>() {
                Ok(k) => k,
                Err(e) => {
                    log::error!("[state] skipping event {id}: {e}");
                    continue;
                }
            };
            events.push(StateEvent {
                id: Some(id),
                timestamp: timestamp_from_unix(ts)?,
                kind,
                component,
                message: message.unwrap_or_default(),
                details: parse_json(details),
                duration_ms,
                success,
            });
        }
        Ok(events)
    }

    /// The most recent generation runs, newest first.
    pub fn recent_generations(&self, limit: usize) -> Result<Vec<GenerationRecord>, StateError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, config_hash, peer_count, filter_count,
                    duration_ms, memory_peak_mb, success, error_message, metadata
             FROM generations ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows: Vec<_> = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut generations = Vec::with_capacity(rows.len());
        for (id, ts, config_hash, peer_count, filter_count, duration_ms, memory, success, error, metadata) in rows
        {
            generations.push(GenerationRecord {
                id: Some(id),
                timestamp: timestamp_from_unix(ts)?,
                config_hash,
                peer_count,
                filter_count,
                duration_ms,
                memory_peak_mb: memory,
                success,
                error_message: error.unwrap_or_default(),
                metadata: parse_json(metadata),
            });
        }
        Ok(generations)
    }

    /// Deployment history, newest first, optionally filtered by router.
    pub fn deployment_history(
        &self,
        router: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeploymentRecord>, StateError> {
        let conn = self.connect()?;
        let sql = match router {
            Some(_) => {
                "SELECT id, generation_id, timestamp, router, config_hash, deployment_method,
                        duration_ms, success, error_message, validation_passed, rollback_required
                 FROM deployments WHERE router = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2"
            }
            None => {
                "SELECT id, generation_id, timestamp, router, config_hash, deployment_method,
                        duration_ms, success, error_message, validation_passed, rollback_required
                 FROM deployments ORDER BY timestamp DESC, id DESC LIMIT ?1"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        type Row = (
            i64,
            Option<i64>,
            i64,
            String,
            String,
            String,
            i64,
            bool,
            Option<String>,
            bool,
            bool,
        );
        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<Row> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
            ))
        };
        let rows: Vec<Row> = match router {
            Some(r) => stmt
                .query_map(params![r, limit as i64], map_row)?
                .collect::<rusqlite::Result<_>>()?,
            None => stmt
                .query_map(params![limit as i64], map_row)?
                .collect::<rusqlite::Result<_>>()?,
        };

        let mut deployments = Vec::with_capacity(rows.len());
        for (id, generation_id, ts, router, config_hash, method, duration_ms, success, error, validated, rollback) in rows
        {
            deployments.push(DeploymentRecord {
                id: Some(id),
                generation_id,
                timestamp: timestamp_from_unix(ts)?,
                router,
                config_hash,
                deployment_method: method,
                duration_ms,
                success,
                error_message: error.unwrap_or_default(),
                validation_passed: validated,
                rollback_required: rollback,
            });
        }
        Ok(deployments)
    }

    /// Identifier of the most recent generation run, if any.
    pub fn latest_generation_id(&self) -> Result<Option<i64>, StateError> {
        let conn = self.connect()?;
        let id = conn
            .query_row(
                "SELECT id FROM generations ORDER BY timestamp DESC, id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(id)
    }

    /// Aggregated statistics over the trailing `days` days.
    pub fn performance_stats(&self, days: i64) -> Result<PerformanceStats, StateError> {
        let conn = self.connect()?;
        let since = OffsetDateTime::now_utc().unix_timestamp() - days * 86_400;

        let generations = conn.query_row(
            "SELECT COUNT(*), AVG(duration_ms), MAX(duration_ms),
                    AVG(memory_peak_mb), MAX(memory_peak_mb),
                    SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END)
             FROM generations WHERE timestamp >= ?1",
            params![since],
            |row| {
                let total: i64 = row.get(0)?;
                let avg_duration: Option<f64> = row.get(1)?;
                let max_duration: Option<i64> = row.get(2)?;
                let avg_memory: Option<f64> = row.get(3)?;
                let max_memory: Option<f64> = row.get(4)?;
                let successful: Option<i64> = row.get(5)?;
                Ok(GenerationStats {
                    total,
                    avg_duration_ms: round2(avg_duration.unwrap_or(0.0)),
                    max_duration_ms: max_duration.unwrap_or(0),
                    avg_memory_mb: round2(avg_memory.unwrap_or(0.0)),
                    max_memory_mb: round2(max_memory.unwrap_or(0.0)),
                    success_rate: success_rate(successful.unwrap_or(0), total),
                })
            },
        )?;

        let deployments = conn.query_row(
            "SELECT COUNT(*), AVG(duration_ms),
                    SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END),
                    COUNT(DISTINCT router)
             FROM deployments WHERE timestamp >= ?1",
            params![since],
            |row| {
                let total: i64 = row.get(0)?;
                let avg_duration: Option<f64> = row.get(1)?;
                let successful: Option<i64> = row.get(2)?;
                let routers: i64 = row.get(3)?;
                Ok(DeploymentStats {
                    total,
                    avg_duration_ms: round2(avg_duration.unwrap_or(0.0)),
                    success_rate: success_rate(successful.unwrap_or(0), total),
                    routers_count: routers,
                })
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT event_type, COUNT(*) AS count FROM events
             WHERE timestamp >= ?1 AND success = 0
             GROUP BY event_type ORDER BY count DESC",
        )?;
        let errors: BTreeMap<String, i64> = stmt
            .query_map(params![since], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        Ok(PerformanceStats {
            period_days: days,
            generations,
            deployments,
            errors,
        })
    }

    /// Apply the retention policies: age out events, keep only the most
    /// recent generations, and cascade away deployments whose generation is
    /// gone. Each step runs even when a previous one fails.
    pub fn cleanup_old_data(&self) -> CleanupStats {
        let mut stats = CleanupStats::default();
        let conn = match self.connect() {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("[state] cleanup cannot open database: {e}");
                return stats;
            }
        };

        let cutoff = OffsetDateTime::now_utc().unix_timestamp() - self.retention_days * 86_400;
        match conn.execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff]) {
            Ok(n) => stats.events_deleted = n,
            Err(e) => log::error!("[state] event cleanup failed: {e}"),
        }

        match conn.execute(
            "DELETE FROM generations WHERE id NOT IN (
                 SELECT id FROM generations ORDER BY timestamp DESC, id DESC LIMIT ?1
             )",
            params![self.retention_generations],
        ) {
            Ok(n) => stats.generations_deleted = n,
            Err(e) => log::error!("[state] generation cleanup failed: {e}"),
        }

        match conn.execute(
            "DELETE FROM deployments WHERE generation_id NOT IN (SELECT id FROM generations)",
            [],
        ) {
            Ok(n) => stats.deployments_deleted = n,
            Err(e) => log::error!("[state] deployment cleanup failed: {e}"),
        }

        log::info!(
            "[state] cleanup removed {} events, {} generations, {} deployments",
            stats.events_deleted,
            stats.generations_deleted,
            stats.deployments_deleted
        );
        stats
    }

    /// Export the state as one JSON document with `events`, `generations`,
    /// `deployments` and `stats`.
    pub fn export_data(&self, path: impl AsRef<std::path::Path>) -> Result<(), StateError> {
        let document = serde_json::json!({
            "events": self.recent_events(1000, None)?,
            "generations": self.recent_generations(100)?,
            "deployments": self.deployment_history(None, 100)?,
            "stats": self.performance_stats(30)?,
        });
        std::fs::write(path.as_ref(), serde_json::to_vec_pretty(&document)?)?;
        log::info!("[state] exported state data to {}", path.as_ref().display());
        Ok(())
    }
}

fn insert_event(conn: &Connection, event: &StateEvent) -> Result<i64, StateError> {
    conn.execute(
        "INSERT INTO events (timestamp, event_type, component, message, details, duration_ms, success)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.timestamp.unix_timestamp(),
            event.kind.as_str(),
            event.component,
            event.message,
            json_text(&event.details),
            event.duration_ms,
            event.success,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn json_text(value: &serde_json::Value) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_json(raw: Option<String>) -> serde_json::Value {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

fn timestamp_from_unix(ts: i64) -> Result<OffsetDateTime, StateError> {
    OffsetDateTime::from_unix_timestamp(ts).map_err(|_| StateError::InvalidTimestamp(ts))
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn success_rate(successful: i64, total: i64) -> f64 {
    round2(successful as f64 / total.max(1) as f64 * 100.0)
}

/// Error kind returned by the [`StateStore`].
#[derive(Debug, Error)]
pub enum StateError {
    /// Database error.
    #[error("state database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// I/O failure on the database directory or an export file.
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding failure during export.
    #[error("state export error: {0}")]
    Json(#[from] serde_json::Error),
    /// A stored event type is unknown to this version.
    #[error("unknown event type: {0}")]
    UnknownEventKind(String),
    /// A stored timestamp is outside the representable range.
    #[error("invalid timestamp in state database: {0}")]
    InvalidTimestamp(i64),
}
