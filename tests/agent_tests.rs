//! End-to-end tests for the agent against a scripted collector.
//!
//! Tests verify:
//! - Session requests carry the right identity across id changes
//! - Consent gating of writes
//! - Reply classification: rejected requests dropped, failures retried
//! - Recovery of sessions abandoned by a previous process

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use pulse::request::{Params, Request};
use pulse::session::{Event, Session};
use pulse::storage::{BlobStore, Storable, Storage};
use pulse::transport::{Body, Exchange, ExchangeFuture, HttpReply, PreparedRequest};
use pulse::types::now_ns;
use pulse::{Agent, AgentBuilder, AgentConfig, Feature, HostLifecycle};

// ============================================================================
// SCRIPTED COLLECTOR
// ============================================================================

/// Answers with queued statuses (200 once the script runs out) and records
/// every request it receives.
#[derive(Default)]
struct ScriptedExchange {
    statuses: Mutex<VecDeque<u16>>,
    sent: Mutex<Vec<Params>>,
    gets: Mutex<Vec<bool>>,
}

impl ScriptedExchange {
    fn with_statuses(statuses: &[u16]) -> Arc<Self> {
        let exchange = ScriptedExchange::default();
        exchange.statuses.lock().extend(statuses.iter().copied());
        Arc::new(exchange)
    }

    fn sent(&self) -> Vec<Params> {
        self.sent.lock().clone()
    }

    /// Sent requests that begin or end a session, as `(kind, device_id)`.
    fn session_transitions(&self) -> Vec<(&'static str, String)> {
        self.sent()
            .iter()
            .filter_map(|params| {
                let kind = if params.has("begin_session") {
                    "begin"
                } else if params.has("end_session") {
                    "end"
                } else {
                    return None;
                };
                Some((kind, params.get("device_id").unwrap_or("").to_string()))
            })
            .collect()
    }
}

fn decode(request: &PreparedRequest) -> Params {
    match &request.body {
        Body::Empty => {
            let query = request.url.split_once('?').map(|(_, q)| q).unwrap_or("");
            Params::from_query(query)
        }
        Body::Form(query) => Params::from_query(query),
        Body::Multipart { fields, .. } => fields.iter().cloned().collect(),
    }
}

impl Exchange for ScriptedExchange {
    fn exchange(&self, request: PreparedRequest) -> ExchangeFuture<'_> {
        let status = self.statuses.lock().pop_front().unwrap_or(200);
        self.gets.lock().push(request.is_get());
        self.sent.lock().push(decode(&request));
        Box::pin(async move {
            Ok(HttpReply {
                status,
                body: String::new(),
            })
        })
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn test_config(dir: &TempDir) -> AgentConfig {
    let mut config = AgentConfig::new("https://collector.test", "test-app");
    config.storage_dir = dir.path().to_path_buf();
    config.crash_reporting_hook = false;
    config.anr_timeout_secs = 0;
    config.update_interval_secs = 3600;
    config.backoff_base_secs = 1;
    config.backoff_ceiling_secs = 2;
    config
}

async fn build(config: AgentConfig, exchange: &Arc<ScriptedExchange>) -> Agent {
    AgentBuilder::new(config)
        .exchange(Arc::clone(exchange) as Arc<dyn Exchange>)
        .build()
        .await
        .unwrap()
}

/// Drains until the queue is empty.
async fn settle(agent: &Agent) {
    for _ in 0..100 {
        agent.flush().await.unwrap();
        if agent.queue_len().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("queue did not drain: {} left", agent.queue_len().await);
}

// ============================================================================
// SESSIONS & IDENTITY
// ============================================================================

#[tokio::test]
async fn test_session_begins_and_ends_with_device_id() {
    let dir = TempDir::new().unwrap();
    let exchange = ScriptedExchange::with_statuses(&[]);
    let mut config = test_config(&dir);
    config.custom_device_id = Some("device-a".to_string());
    config.device_id_strategy = pulse::DeviceIdStrategy::Custom;
    let agent = build(config, &exchange).await;

    agent.on_foreground_start().await.unwrap();
    agent
        .record_event(Event::new("purchase").unwrap().sum(9.99))
        .await
        .unwrap();
    agent.on_foreground_stop().await.unwrap();
    settle(&agent).await;

    assert_eq!(
        exchange.session_transitions(),
        vec![
            ("begin", "device-a".to_string()),
            ("end", "device-a".to_string())
        ]
    );
    let sent = exchange.sent();
    let end = sent.iter().find(|p| p.has("end_session")).unwrap();
    assert!(end.get("events").unwrap().contains("purchase"));
    for params in &sent {
        assert_eq!(params.get("app_key"), Some("test-app"));
        assert!(params.has("checksum256"));
    }
    assert!(exchange.gets.lock().iter().all(|get| *get));
    agent.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_change_with_merge_keeps_session() {
    let dir = TempDir::new().unwrap();
    let exchange = ScriptedExchange::with_statuses(&[]);
    let mut config = test_config(&dir);
    config.device_id_strategy = pulse::DeviceIdStrategy::Custom;
    config.custom_device_id = Some("A".to_string());
    let agent = build(config, &exchange).await;

    agent.on_foreground_start().await.unwrap();
    agent.change_device_id_with_merge("B").await.unwrap();
    assert_eq!(agent.device_id().as_deref(), Some("B"));
    agent.on_foreground_stop().await.unwrap();
    settle(&agent).await;

    assert_eq!(
        exchange.session_transitions(),
        vec![("begin", "A".to_string()), ("end", "B".to_string())]
    );
    let merge: Vec<Params> = exchange
        .sent()
        .into_iter()
        .filter(|p| p.has("old_device_id"))
        .collect();
    assert_eq!(merge.len(), 1);
    assert_eq!(merge[0].get("device_id"), Some("B"));
    assert_eq!(merge[0].get("old_device_id"), Some("A"));
    agent.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_change_without_merge_restarts_session() {
    let dir = TempDir::new().unwrap();
    let exchange = ScriptedExchange::with_statuses(&[]);
    let mut config = test_config(&dir);
    config.device_id_strategy = pulse::DeviceIdStrategy::Custom;
    config.custom_device_id = Some("A".to_string());
    let agent = build(config, &exchange).await;

    agent.on_foreground_start().await.unwrap();
    settle(&agent).await;
    let before = exchange.session_transitions().len();

    agent.change_device_id_without_merge("B").await.unwrap();
    settle(&agent).await;

    let after: Vec<_> = exchange.session_transitions().into_iter().skip(before).collect();
    assert_eq!(
        after,
        vec![("end", "A".to_string()), ("begin", "B".to_string())]
    );
    assert!(exchange.sent().iter().all(|p| !p.has("old_device_id")));
    agent.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_device_id_survives_restart() {
    let dir = TempDir::new().unwrap();
    let exchange = ScriptedExchange::with_statuses(&[]);

    let first = build(test_config(&dir), &exchange).await;
    let id = first.device_id().unwrap();
    first.stop(false).await.unwrap();

    let second = build(test_config(&dir), &exchange).await;
    assert_eq!(second.device_id(), Some(id));
    second.stop(false).await.unwrap();
}

// ============================================================================
// CONSENT
// ============================================================================

#[tokio::test]
async fn test_nothing_recorded_without_consent() {
    let dir = TempDir::new().unwrap();
    let exchange = ScriptedExchange::with_statuses(&[]);
    let mut config = test_config(&dir);
    config.require_consent = true;
    let agent = build(config, &exchange).await;

    agent.on_foreground_start().await.unwrap();
    agent.record_event(Event::new("ignored").unwrap()).await.unwrap();
    agent.record_view("home", Default::default()).await.unwrap();
    assert_eq!(agent.queue_len().await, 0);
    assert!(agent.current_session().await.is_none());

    agent.give_consent(&[Feature::Events]).await.unwrap();
    agent.record_event(Event::new("counted").unwrap()).await.unwrap();
    settle(&agent).await;

    let sent = exchange.sent();
    let events: Vec<&Params> = sent.iter().filter(|p| p.has("events")).collect();
    assert_eq!(events.len(), 1);
    assert!(events[0].get("events").unwrap().contains("counted"));
    let consent: Vec<&Params> = sent.iter().filter(|p| p.has("consent")).collect();
    assert_eq!(consent.len(), 1);
    assert!(consent[0].get("consent").unwrap().contains("\"events\":true"));

    agent.on_foreground_stop().await.unwrap();
    agent.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_revoking_consent_purges_queue() {
    let dir = TempDir::new().unwrap();
    // Keep requests queued: every send fails until the script runs out.
    let exchange = ScriptedExchange::with_statuses(&[503; 64]);
    let mut config = test_config(&dir);
    config.require_consent = true;
    config.initial_consents = vec![Feature::Events, Feature::Location];
    config.backoff_base_secs = 60;
    config.backoff_ceiling_secs = 60;
    let agent = build(config, &exchange).await;

    agent.record_event(Event::new("a").unwrap()).await.unwrap();
    agent
        .set_location(Some("DE"), Some("Berlin"), None, None)
        .await
        .unwrap();
    let queued = agent.queue_len().await;

    agent.remove_consent(&[Feature::Events]).await.unwrap();
    // Event request gone, revocation notice added.
    assert_eq!(agent.queue_len().await, queued);
    assert!(!agent.is_consented(Feature::Events));
    assert!(agent.is_consented(Feature::Location));
    agent.stop(true).await.unwrap();
}

/// Queued requests read straight from the storage directory.
fn queued_requests(dir: &TempDir) -> Vec<Request> {
    let store = BlobStore::open(dir.path()).unwrap();
    store
        .ids(Request::PREFIX)
        .unwrap()
        .into_iter()
        .filter_map(|id| {
            let data = store.read(Request::PREFIX, id).unwrap()?;
            Request::restore(id, &data).ok()
        })
        .collect()
}

#[tokio::test]
async fn test_revoking_events_strips_session_batches() {
    let dir = TempDir::new().unwrap();
    let exchange = ScriptedExchange::with_statuses(&[503; 64]);
    let mut config = test_config(&dir);
    config.require_consent = true;
    config.initial_consents = vec![Feature::Sessions, Feature::Events, Feature::Views];
    config.events_buffer_size = 1;
    config.backoff_base_secs = 60;
    config.backoff_ceiling_secs = 60;
    let agent = build(config, &exchange).await;

    agent.on_foreground_start().await.unwrap();
    agent.record_view("home", Default::default()).await.unwrap();
    agent.record_event(Event::new("secret").unwrap()).await.unwrap();
    let carrying = |needle: &str| {
        queued_requests(&dir)
            .iter()
            .filter(|r| r.params.get("events").is_some_and(|e| e.contains(needle)))
            .count()
    };
    assert_eq!(carrying("secret"), 1);

    agent.remove_consent(&[Feature::Events]).await.unwrap();
    assert_eq!(carrying("secret"), 0);
    assert_eq!(carrying("[CLY]_view"), 1);
    assert!(queued_requests(&dir)
        .iter()
        .any(|r| r.params.has("begin_session")));

    agent.remove_consent(&[Feature::Views]).await.unwrap();
    assert_eq!(carrying("[CLY]_view"), 0);
    agent.stop(true).await.unwrap();
}

// ============================================================================
// DELIVERY
// ============================================================================

#[tokio::test]
async fn test_rejected_dropped_failed_retried() {
    let dir = TempDir::new().unwrap();
    let exchange = ScriptedExchange::with_statuses(&[400, 500]);
    let agent = build(test_config(&dir), &exchange).await;

    agent.record_event(Event::new("first").unwrap()).await.unwrap();
    agent.record_event(Event::new("second").unwrap()).await.unwrap();
    settle(&agent).await;

    let sent = exchange.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent[0].get("events").unwrap().contains("first"));
    assert!(sent[1].get("events").unwrap().contains("second"));
    assert!(sent[2].get("events").unwrap().contains("second"));

    let stats = agent.network_stats();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.delivered, 1);
    agent.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_large_request_goes_as_post() {
    let dir = TempDir::new().unwrap();
    let exchange = ScriptedExchange::with_statuses(&[]);
    let agent = build(test_config(&dir), &exchange).await;

    let long = "x".repeat(2048);
    agent
        .record_event(Event::new("big").unwrap().segment("blob", long.clone()))
        .await
        .unwrap();
    settle(&agent).await;

    let sent = exchange.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].get("events").unwrap().contains(&long));
    assert_eq!(*exchange.gets.lock(), vec![false]);
    agent.stop(false).await.unwrap();
}

// ============================================================================
// RECOVERY
// ============================================================================

#[tokio::test]
async fn test_abandoned_session_ended_on_start() {
    let dir = TempDir::new().unwrap();
    let last_seen = now_ns() - 300 * 1_000_000_000;
    {
        let storage = Storage::open(dir.path()).unwrap();
        let mut session = Session::new(1_000);
        session.begin(last_seen - 120 * 1_000_000_000);
        session.update(last_seen);
        session.set_device_id(Some("old-device".to_string()));
        assert!(storage.push(&session).await);
        storage.shutdown();
        storage.await_termination().await;
    }

    let exchange = ScriptedExchange::with_statuses(&[]);
    let agent = build(test_config(&dir), &exchange).await;
    settle(&agent).await;

    assert_eq!(
        exchange.session_transitions(),
        vec![("end", "old-device".to_string())]
    );
    let sent = exchange.sent();
    let end = sent.iter().find(|p| p.has("end_session")).unwrap();
    assert_eq!(end.get("session_id"), Some("1000"));
    assert!(!end.has("session_duration"));
    assert!(agent.storage_stats().await.by_prefix.get(Session::PREFIX).is_none());
    agent.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_stop_is_final() {
    let dir = TempDir::new().unwrap();
    let exchange = ScriptedExchange::with_statuses(&[]);
    let agent = build(test_config(&dir), &exchange).await;

    agent.stop(true).await.unwrap();
    agent.stop(true).await.unwrap();
    assert!(agent.record_event(Event::new("late").unwrap()).await.is_err());
    assert!(agent.on_foreground_start().await.is_err());
}
