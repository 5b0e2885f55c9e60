//! Host failover across cycles, and what a restart picks up from disk

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use mcs_collector::ingest::{CycleOutcome, CycleStep};
use mcs_collector::mcs::{EndpointChoice, LOGIN_PATH, Token, TokenStore};
use mcs_collector::storage::StorageBackend;
use pretty_assertions::assert_eq;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_reads_move_to_secondary_after_three_failed_cycles() {
    let primary = MockServer::start().await;
    let secondary = MockServer::start().await;
    mount_login(&primary, "opaque", 3600).await;
    Mock::given(method("GET"))
        .and(path(ALARMS_PATH))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&primary)
        .await;

    let mcs = FakeMcs::new();
    mcs.raise("a-1", ts("2026-10-18T09:00:00Z"));
    mcs.mount(&secondary).await;

    let dir = tempfile::tempdir().unwrap();
    let db = Database::new();
    let mut collector = collector(
        &primary.uri(),
        &secondary.uri(),
        dir.path().join("token.json"),
        db.connector(),
    );

    for _ in 0..3 {
        let report = collector.run_iteration().await;
        assert_matches!(
            report.outcome,
            CycleOutcome::Skipped {
                step: CycleStep::Fetch,
                ..
            }
        );
    }
    assert_eq!(
        collector.fetcher().endpoints().active(),
        EndpointChoice::Secondary
    );

    let report = collector.run_iteration().await;

    assert_eq!(
        report.outcome,
        CycleOutcome::Completed {
            fetched: 1,
            inserted: 1
        }
    );
    assert_eq!(
        collector.fetcher().endpoints().active(),
        EndpointChoice::Secondary
    );
    assert_eq!(db.rows.count_alarms().await.unwrap(), 1);
}

#[tokio::test]
async fn test_restart_reuses_persisted_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ALARMS_PATH))
        .and(header("authorization", "Bearer from-last-run"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("token.json");
    let now = Utc::now();
    TokenStore::new(&token_path)
        .save(&Token {
            value: "from-last-run".to_string(),
            refresh_token: None,
            obtained_at: now - Duration::minutes(10),
            expires_at: now + Duration::minutes(50),
        })
        .unwrap();

    let db = Database::new();
    let mut collector = collector(&server.uri(), &server.uri(), token_path, db.connector());

    let report = collector.run_iteration().await;

    assert_eq!(
        report.outcome,
        CycleOutcome::Completed {
            fetched: 0,
            inserted: 0
        }
    );
}

#[tokio::test]
async fn test_restart_with_expired_token_logs_in_and_overwrites_file() {
    let server = MockServer::start().await;
    let fresh = jwt(Utc::now().timestamp() + 7200);
    Mock::given(method("POST"))
        .and(path(LOGIN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"access_token": fresh}
        })))
        .expect(1)
        .mount(&server)
        .await;
    let mcs = FakeMcs::new();
    mcs.mount(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("token.json");
    let now = Utc::now();
    TokenStore::new(&token_path)
        .save(&Token {
            value: "stale".to_string(),
            refresh_token: None,
            obtained_at: now - Duration::hours(2),
            expires_at: now - Duration::hours(1),
        })
        .unwrap();

    let db = Database::new();
    let mut collector = collector(
        &server.uri(),
        &server.uri(),
        token_path.clone(),
        db.connector(),
    );

    let report = collector.run_iteration().await;
    assert!(report.is_completed());

    let persisted = TokenStore::new(&token_path).load().unwrap().unwrap();
    assert_eq!(persisted.value, fresh);
    assert!(persisted.expires_at > now + Duration::minutes(110));
}

#[tokio::test]
async fn test_database_down_at_startup_leaves_cursor_unbounded() {
    let server = MockServer::start().await;
    mount_login(&server, "opaque", 3600).await;
    let mcs = FakeMcs::new();
    mcs.raise("a-1", ts("2026-10-18T09:00:00Z"));
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

    collector.start().await;
    assert_eq!(collector.cursor().since(), None);

    db.set_down(false);
    let report = collector.run_iteration().await;

    assert!(report.is_completed());
    assert_eq!(collector.cursor().since(), Some(ts("2026-10-18T09:00:00Z")));
    assert_eq!(mcs.seen_since(), vec![None]);
}
