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

use pretty_assertions::assert_eq;
use time::{Duration, OffsetDateTime};

use crate::config::{EventTrackingConfig, RetentionConfig, StateConfig};
use crate::state::{
    DeploymentRecord, EventKind, GenerationRecord, StateEvent, StateStore,
};

fn store_in(dir: &tempfile::TempDir, retention_generations: i64) -> StateStore {
    let config = StateConfig {
        database_path: dir.path().join("state.db"),
        retention: RetentionConfig {
            days: 30,
            generations: retention_generations,
        },
        events: EventTrackingConfig::default(),
    };
    StateStore::open(&config).unwrap()
}

fn generation(hash: &str, age_minutes: i64, success: bool) -> GenerationRecord {
    GenerationRecord {
        timestamp: OffsetDateTime::now_utc() - Duration::minutes(age_minutes),
        config_hash: hash.to_string(),
        peer_count: 10,
        filter_count: 4,
        duration_ms: 1500,
        memory_peak_mb: 64.0,
        success,
        error_message: if success { String::new() } else { "boom".to_string() },
        ..Default::default()
    }
}

fn deployment(router: &str, generation_id: Option<i64>, success: bool) -> DeploymentRecord {
    DeploymentRecord {
        generation_id,
        router: router.to_string(),
        config_hash: "cafecafecafecafe".to_string(),
        duration_ms: 900,
        success,
        error_message: if success {
            String::new()
        } else {
            "rsync failed".to_string()
        },
        validation_passed: success,
        ..Default::default()
    }
}

#[test]
fn generation_dual_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, 100);

    let id = store.track_generation(&generation("abc123", 0, true)).unwrap();
    assert!(id > 0);

    let generations = store.recent_generations(10).unwrap();
    assert_eq!(generations.len(), 1);
    assert_eq!(generations[0].config_hash, "abc123");

    // the correlated event must exist and reference the generation
    let events = store
        .recent_events(10, Some(EventKind::GenerationSuccess))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].details["generation_id"], serde_json::json!(id));
}

#[test]
fn failed_generation_writes_failure_event() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, 100);

    store.track_generation(&generation("abc123", 0, false)).unwrap();
    let events = store
        .recent_events(10, Some(EventKind::GenerationFailure))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert!(events[0].message.contains("boom"));
}

#[test]
fn deployment_dual_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, 100);

    let generation_id = store.track_generation(&generation("abc123", 0, true)).unwrap();
    let id = store
        .track_deployment(&deployment("dc1-1.router.example.net", Some(generation_id), false))
        .unwrap();
    assert!(id > 0);

    let history = store
        .deployment_history(Some("dc1-1.router.example.net"), 10)
        .unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(history[0].error_message, "rsync failed");

    let events = store
        .recent_events(10, Some(EventKind::DeploymentFailure))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
}

#[test]
fn tracking_can_be_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let config = StateConfig {
        database_path: dir.path().join("state.db"),
        retention: RetentionConfig::default(),
        events: EventTrackingConfig {
            track_generations: false,
            track_deployments: true,
            track_errors: true,
        },
    };
    let store = StateStore::open(&config).unwrap();

    assert_eq!(store.track_generation(&generation("x", 0, true)).unwrap(), 0);
    assert!(store.recent_generations(10).unwrap().is_empty());
    assert!(store
        .recent_events(10, Some(EventKind::GenerationSuccess))
        .unwrap()
        .is_empty());
}

#[test]
fn cleanup_keeps_most_recent_generations_and_cascades() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, 2);

    let mut ids = Vec::new();
    for i in 0..5 {
        // oldest first: ages 50, 40, 30, 20, 10 minutes
        let id = store
            .track_generation(&generation(&format!("hash{i}"), 50 - i * 10, true))
            .unwrap();
        ids.push(id);
    }
    // one deployment per generation
    for id in &ids {
        store
            .track_deployment(&deployment("dc1-1.router.example.net", Some(*id), true))
            .unwrap();
    }

    let stats = store.cleanup_old_data();
    assert_eq!(stats.generations_deleted, 3);
    assert_eq!(stats.deployments_deleted, 3);

    let remaining = store.recent_generations(10).unwrap();
    assert_eq!(remaining.len(), 2);
    // the two youngest survive
    assert_eq!(remaining[0].config_hash, "hash4");
    assert_eq!(remaining[1].config_hash, "hash3");

    let deployments = store.deployment_history(None, 10).unwrap();
    assert_eq!(deployments.len(), 2);
    assert!(deployments
        .iter()
        .all(|d| d.generation_id == Some(ids[3]) || d.generation_id == Some(ids[4])));
}

#[test]
fn cleanup_ages_out_events() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, 100);

    let mut old_event = StateEvent::new(EventKind::Info, "test", "ancient");
    old_event.timestamp = OffsetDateTime::now_utc() - Duration::days(40);
    store.track_event(&old_event).unwrap();
    store
        .track_event(&StateEvent::new(EventKind::Info, "test", "recent"))
        .unwrap();

    let stats = store.cleanup_old_data();
    assert_eq!(stats.events_deleted, 1);

    let events = store.recent_events(10, None).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message, "recent");
}

#[test]
fn performance_stats_window() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, 100);

    store.track_generation(&generation("a", 1, true)).unwrap();
    store.track_generation(&generation("b", 2, true)).unwrap();
    store.track_generation(&generation("c", 3, false)).unwrap();
    store
        .track_deployment(&deployment("dc1-1.router.example.net", None, true))
        .unwrap();
    store
        .track_deployment(&deployment("dc1-2.router.example.net", None, false))
        .unwrap();

    let stats = store.performance_stats(7).unwrap();
    assert_eq!(stats.period_days, 7);
    assert_eq!(stats.generations.total, 3);
    assert_eq!(stats.generations.avg_duration_ms, 1500.0);
    assert_eq!(stats.generations.max_duration_ms, 1500);
    assert_eq!(stats.generations.success_rate, 66.67);
    assert_eq!(stats.deployments.total, 2);
    assert_eq!(stats.deployments.success_rate, 50.0);
    assert_eq!(stats.deployments.routers_count, 2);
    // the failure histogram sees the generation and deployment failures
    assert_eq!(stats.errors.get("generation_failure"), Some(&1));
    assert_eq!(stats.errors.get("deployment_failure"), Some(&1));
}

#[test]
fn export_produces_complete_document() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, 100);

    let id = store.track_generation(&generation("a", 1, true)).unwrap();
    store
        .track_deployment(&deployment("dc1-1.router.example.net", Some(id), true))
        .unwrap();

    let out = dir.path().join("export.json");
    store.export_data(&out).unwrap();

    let document: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    for key in ["events", "generations", "deployments", "stats"] {
        assert!(document.get(key).is_some(), "missing export key {key}");
    }
    assert_eq!(document["generations"].as_array().unwrap().len(), 1);
    assert_eq!(document["deployments"].as_array().unwrap().len(), 1);
    // events: one per generation and one per deployment
    assert_eq!(document["events"].as_array().unwrap().len(), 2);
}

#[test]
fn latest_generation_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(&dir, 100);
    assert_eq!(store.latest_generation_id().unwrap(), None);

    store.track_generation(&generation("a", 20, true)).unwrap();
    let newest = store.track_generation(&generation("b", 1, true)).unwrap();
    assert_eq!(store.latest_generation_id().unwrap(), Some(newest));
}
