//! End-to-end collector cycles against a mocked MCS and a switchable database

use std::time::Duration;

use assert_matches::assert_matches;
use mcs_collector::actors::CollectorHandle;
use mcs_collector::ingest::{CycleOutcome, CycleStep, LoopState};
use mcs_collector::mcs::{LOGIN_PATH, TokenStore};
use mcs_collector::storage::StorageBackend;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_first_run_logs_in_stores_and_then_finds_nothing_new() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"access_token": "opaque-1", "expires_in": 3600}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mcs = FakeMcs::new();
    mcs.raise("a-1", ts("2026-10-18T09:00:00Z"));
    mcs.raise("a-2", ts("2026-10-18T09:00:30Z"));
    mcs.mount(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("token_storage.json");
    let db = Database::new();
    let sleeper = GatedSleeper::new();

    let handle = CollectorHandle::spawn_with(
        collector(&server.uri(), &server.uri(), token_path.clone(), db.connector()),
        Duration::from_secs(60),
        sleeper.clone(),
        CancellationToken::new(),
    );

    handle.wait_for_state(LoopState::Sleeping).await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(
        status.last_report.unwrap().outcome,
        CycleOutcome::Completed {
            fetched: 2,
            inserted: 2
        }
    );
    assert_eq!(status.cursor, Some(ts("2026-10-18T09:00:30Z")));

    let persisted = TokenStore::new(&token_path).load().unwrap().unwrap();
    assert_eq!(persisted.value, "opaque-1");
    assert_eq!(persisted.ttl().num_seconds(), 3600);

    sleeper.release();
    wait_for_iteration(&handle, 2).await;
    assert_eq!(sleeper.delays()[0], Duration::from_secs(60));

    let status = handle.status().await.unwrap();
    assert_eq!(
        status.last_report.unwrap().outcome,
        CycleOutcome::Completed {
            fetched: 1,
            inserted: 0
        }
    );
    assert_eq!(db.rows.count_alarms().await.unwrap(), 2);
    assert_eq!(
        mcs.seen_since(),
        vec![None, Some("2026-10-18T09:00:30.000Z".to_string())]
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_within_the_same_cycle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"access_token": "opaque", "expires_in": 3600}
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ALARMS_PATH))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ALARMS_PATH))
        .and(header("authorization", "Bearer opaque"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": [{"id": "a-1", "timestamp": "2026-10-18T09:00:00Z"}]
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let db = Database::new();
    let mut collector = collector(
        &server.uri(),
        &server.uri(),
        dir.path().join("token.json"),
        db.connector(),
    );

    let report = collector.run_iteration().await;

    assert_eq!(
        report.outcome,
        CycleOutcome::Completed {
            fetched: 1,
            inserted: 1
        }
    );
}

#[tokio::test]
async fn test_database_outage_loses_nothing_and_duplicates_nothing() {
    let server = MockServer::start().await;
    mount_login(&server, "opaque", 3600).await;
    let mcs = FakeMcs::new();
    mcs.mount(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let db = Database::new();
    db.set_down(true);
    let mut collector = collector(
        &server.uri(),
        &server.uri(),
        dir.path().join("token.json"),
        db.connector(),
    );

    for cycle in 1..=3 {
        mcs.raise(
            &format!("outage-{cycle}"),
            ts(&format!("2026-10-18T09:0{cycle}:00Z")),
        );

        let report = collector.run_iteration().await;

        assert_matches!(
            report.outcome,
            CycleOutcome::Skipped {
                step: CycleStep::Store,
                ..
            }
        );
        assert_eq!(collector.cursor().since(), None);
    }

    db.set_down(false);
    let report = collector.run_iteration().await;

    assert_eq!(
        report.outcome,
        CycleOutcome::Completed {
            fetched: 3,
            inserted: 3
        }
    );
    assert_eq!(db.rows.count_alarms().await.unwrap(), 3);
    assert_eq!(mcs.seen_since(), vec![None, None, None, None]);

    let report = collector.run_iteration().await;
    assert_eq!(
        report.outcome,
        CycleOutcome::Completed {
            fetched: 1,
            inserted: 0
        }
    );
    assert_eq!(db.rows.count_alarms().await.unwrap(), 3);
}

#[tokio::test]
async fn test_cursor_is_seeded_from_storage() {
    let server = MockServer::start().await;
    mount_login(&server, "opaque", 3600).await;
    let mcs = FakeMcs::new();
    mcs.raise("old", ts("2026-10-18T08:00:00Z"));
    mcs.raise("new", ts("2026-10-18T10:00:00Z"));
    mcs.mount(&server).await;

    let db = Database::new();
    db.rows
        .upsert_alarms(&[mcs_collector::AlarmEvent {
            event_id: "old".to_string(),
            timestamp: ts("2026-10-18T08:00:00Z"),
            severity: "major".to_string(),
            description: "alarm old".to_string(),
            raw_payload: serde_json::json!({}),
        }])
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut collector = collector(
        &server.uri(),
        &server.uri(),
        dir.path().join("token.json"),
        db.connector(),
    );

    let report = collector.run_iteration().await;

    assert_eq!(
        report.outcome,
        CycleOutcome::Completed {
            fetched: 2,
            inserted: 1
        }
    );
    assert_eq!(
        mcs.seen_since(),
        vec![Some("2026-10-18T08:00:00.000Z".to_string())]
    );
}

#[tokio::test]
async fn test_auth_failure_skips_cycle_without_persisting() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ALARMS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("token.json");
    let db = Database::new();
    let mut collector = collector(&server.uri(), &server.uri(), token_path.clone(), db.connector());

    let report = collector.run_iteration().await;

    assert_matches!(
        report.outcome,
        CycleOutcome::Skipped {
            step: CycleStep::Authenticate,
            ..
        }
    );
    assert!(!token_path.exists());
}

#[tokio::test]
async fn test_poll_now_and_shutdown_during_sleep() {
    let server = MockServer::start().await;
    mount_login(&server, "opaque", 3600).await;
    let mcs = FakeMcs::new();
    mcs.mount(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let db = Database::new();
    let sleeper = GatedSleeper::new();
    let handle = CollectorHandle::spawn_with(
        collector(&server.uri(), &server.uri(), dir.path().join("token.json"), db.connector()),
        Duration::from_secs(60),
        sleeper.clone(),
        CancellationToken::new(),
    );

    handle.wait_for_state(LoopState::Sleeping).await.unwrap();
    mcs.raise("late", ts("2026-10-18T11:00:00Z"));

    let report = handle.poll_now().await.unwrap();
    assert_eq!(report.iteration, 2);
    assert!(report.is_completed());
    assert_eq!(db.rows.count_alarms().await.unwrap(), 1);

    tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
        .await
        .expect("shutdown must not wait for the sleep to end")
        .unwrap();
    assert_eq!(handle.state(), LoopState::Stopping);
}
