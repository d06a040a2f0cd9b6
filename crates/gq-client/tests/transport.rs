//! Transport integration tests against an in-process mock backend

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use gq_client::{
    Endpoint, GenerationApi, JobsSource, JobsUpdate, ResultsQuery, RestClient, TransportAdapter,
    TransportCallbacks,
};
use gq_core::config::{ClientConfig, RetryConfig};
use gq_core::{GenerationResult, TransportError};
use gq_protocol::{
    CompletionUpdate, ErrorUpdate, GenerationRequest, ProgressUpdate, ResultPatch, StartedUpdate,
    SystemStatus,
};
use gq_test_support::{wait_until, MockBackend};

fn test_config(base_url: &str) -> ClientConfig {
    let mut config = ClientConfig::with_base_url(base_url);
    config.reconnect_delay = Duration::from_millis(50);
    config.request_timeout = Duration::from_secs(2);
    config.retry = RetryConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    };
    config
}

fn rest_client(config: &ClientConfig) -> RestClient {
    let endpoint = Arc::new(Endpoint::new(&config.base_url, config.api_key.clone()).unwrap());
    RestClient::new(endpoint, config).unwrap()
}

/// Forwards every callback as a short string
struct ChannelCallbacks {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelCallbacks {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn send(&self, event: String) {
        let _ = self.tx.send(event);
    }
}

impl TransportCallbacks for ChannelCallbacks {
    fn on_system_status(&self, status: SystemStatus) {
        self.send(format!("status:{}", status.status.unwrap_or_default()));
    }
    fn on_jobs_update(&self, update: JobsUpdate) {
        let ids: Vec<_> = update.records.iter().map(|r| r.job_id.clone()).collect();
        self.send(format!("jobs:{:?}:{}", update.source, ids.join(",")));
    }
    fn on_recent_results(&self, results: Vec<GenerationResult>, epoch: u64) {
        let ids: Vec<_> = results.iter().map(|r| r.id.clone()).collect();
        self.send(format!("results:{}:{}", epoch, ids.join(",")));
    }
    fn on_progress(&self, update: ProgressUpdate) {
        self.send(format!(
            "progress:{}:{}",
            update.job_id,
            update.progress.unwrap_or_default()
        ));
    }
    fn on_complete(&self, update: CompletionUpdate) {
        self.send(format!("complete:{}", update.job_id));
    }
    fn on_error(&self, update: ErrorUpdate) {
        self.send(format!("error:{}", update.job_id.unwrap_or_default()));
    }
    fn on_started(&self, update: StartedUpdate) {
        self.send(format!("started:{}", update.job_id));
    }
    fn on_connection_change(&self, live: bool) {
        self.send(format!("live:{}", live));
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("Timed out waiting for callback")
        .expect("Callback channel closed")
}

#[tokio::test]
async fn test_get_retried_on_server_error() {
    let backend = MockBackend::start().await;
    backend.fail("GET /system/status", 503, 2);
    let client = rest_client(&test_config(&backend.base_url()));

    let status = client.system_status().await.unwrap();
    assert_eq!(status.status.as_deref(), Some("ok"));
    assert_eq!(backend.hits("GET /system/status"), 3);
}

#[tokio::test]
async fn test_get_gives_up_after_max_attempts() {
    let backend = MockBackend::start().await;
    backend.fail("GET /generation/jobs/active", 500, 10);
    let client = rest_client(&test_config(&backend.base_url()));

    let err = client.active_jobs().await.unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert_eq!(backend.hits("GET /generation/jobs/active"), 3);
}

#[tokio::test]
async fn test_get_not_retried_on_client_error() {
    let backend = MockBackend::start().await;
    backend.fail("GET /system/status", 404, 5);
    let client = rest_client(&test_config(&backend.base_url()));

    let err = client.system_status().await.unwrap_err();
    assert_eq!(
        err,
        TransportError::Http {
            status: 404,
            message: "injected failure".to_string()
        }
    );
    assert_eq!(backend.hits("GET /system/status"), 1);
}

#[tokio::test]
async fn test_post_never_retried() {
    let backend = MockBackend::start().await;
    backend.fail("POST /generation/generate", 503, 5);
    let client = rest_client(&test_config(&backend.base_url()));

    let err = client
        .start_generation(&GenerationRequest::new("x"))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(503));
    assert_eq!(backend.hits("POST /generation/generate"), 1);
}

#[tokio::test]
async fn test_network_error_is_reported() {
    let backend = MockBackend::start().await;
    let mut config = test_config(&backend.base_url());
    // Nothing listens on port 9 locally
    config.base_url = "http://127.0.0.1:9".to_string();
    config.retry.max_attempts = 2;
    let client = rest_client(&config);

    let err = client.system_status().await.unwrap_err();
    assert!(matches!(err, TransportError::Network { .. }), "{:?}", err);
    assert_eq!(err.status(), None);
}

#[tokio::test]
async fn test_api_key_sent_on_every_request() {
    let backend = MockBackend::start().await;
    let mut config = test_config(&backend.base_url());
    config.api_key = Some("k-123".to_string());
    let client = rest_client(&config);

    client.system_status().await.unwrap();
    client.active_jobs().await.unwrap();

    let keys = backend.state.api_keys.lock().clone();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|k| k.as_deref() == Some("k-123")));
}

#[tokio::test]
async fn test_cancel_refusal_is_an_error() {
    let backend = MockBackend::start().await;
    let client = rest_client(&test_config(&backend.base_url()));

    client.cancel_job("j1").await.unwrap();

    backend
        .state
        .cancel_refused
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = client.cancel_job("j1").await.unwrap_err();
    assert_eq!(
        err,
        TransportError::Rejected("job already running".to_string())
    );
}

#[tokio::test]
async fn test_delete_missing_result_reports_detail() {
    let backend = MockBackend::start().await;
    backend.set_results(vec![json!({"id": "r1", "image_url": "/a.png"})]);
    let client = rest_client(&test_config(&backend.base_url()));

    client.delete_result("r1").await.unwrap();
    let err = client.delete_result("r1").await.unwrap_err();
    assert_eq!(
        err,
        TransportError::Http {
            status: 404,
            message: "Result not found".to_string()
        }
    );
}

#[tokio::test]
async fn test_ids_are_sent_as_single_path_segment() {
    let backend = MockBackend::start().await;
    backend.set_results(vec![
        json!({"id": "a", "image_url": "/a.png"}),
        json!({"id": "a?b", "image_url": "/ab.png"}),
        json!({"id": "x/y", "image_url": "/xy.png"}),
    ]);
    let client = rest_client(&test_config(&backend.base_url()));

    client.delete_result("a?b").await.unwrap();
    client.delete_result("x/y").await.unwrap();
    let remaining: Vec<_> = backend
        .state
        .results
        .lock()
        .iter()
        .map(|r| r["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(remaining, vec!["a".to_string()]);

    client
        .update_result(
            "a#1",
            &ResultPatch {
                rating: Some(3),
                is_favorite: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(backend.state.patches.lock()[0].0, "a#1");

    let err = client.delete_result("..").await.unwrap_err();
    assert_eq!(err, TransportError::InvalidId("..".to_string()));
    assert_eq!(backend.hits("DELETE /generation/results"), 2);
}

#[tokio::test]
async fn test_download_filename() {
    let backend = MockBackend::start().await;
    let client = rest_client(&test_config(&backend.base_url()));

    let download = client.download_result("r7").await.unwrap();
    assert_eq!(download.filename, "r7-final.png");
    assert_eq!(download.content_type.as_deref(), Some("image/png"));
    assert_eq!(&download.bytes[..], &[0x89, b'P', b'N', b'G']);

    let anonymous = client.download_result("anonymous").await.unwrap();
    assert_eq!(anonymous.filename, "anonymous.png");
}

#[tokio::test]
async fn test_results_query_and_validation() {
    let backend = MockBackend::start().await;
    backend.set_results(vec![
        json!({"id": "r1", "prompt": "a cat", "image_url": "/1.png", "is_favorite": true}),
        json!({"id": "r2", "prompt": "a cat", "images": []}),
        json!({"id": "r3", "prompt": "a dog", "image_url": "/3.png"}),
    ]);
    let (callbacks, mut rx) = ChannelCallbacks::new();
    let adapter = TransportAdapter::new(&test_config(&backend.base_url()), callbacks).unwrap();

    let query = ResultsQuery {
        limit: 10,
        search: Some("cat".to_string()),
        favorites_only: false,
    };
    adapter.refresh_recent_results(&query, 7).await.unwrap();
    assert_eq!(next_event(&mut rx).await, "results:7:r1");

    let queries = backend.state.queries.lock().clone();
    assert_eq!(queries[0].get("search").map(String::as_str), Some("cat"));
    assert_eq!(queries[0].get("limit").map(String::as_str), Some("10"));
}

#[tokio::test]
async fn test_refresh_all_reports_error_after_all_settle() {
    let backend = MockBackend::start().await;
    backend.fail("GET /system/status", 400, 1);
    backend.set_jobs(vec![json!({"job_id": "j1", "status": "running"})]);
    let (callbacks, mut rx) = ChannelCallbacks::new();
    let adapter = TransportAdapter::new(&test_config(&backend.base_url()), callbacks).unwrap();

    let err = adapter
        .refresh_all(&ResultsQuery::new(5), 1)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(400));

    let mut events = vec![next_event(&mut rx).await, next_event(&mut rx).await];
    events.sort();
    assert_eq!(events, vec!["jobs:Snapshot:j1", "results:1:"]);
}

#[tokio::test]
async fn test_base_url_change_discards_inflight_response() {
    let backend = MockBackend::start().await;
    let other = MockBackend::start().await;
    backend.delay_search("slow", Duration::from_millis(300));
    backend.set_results(vec![json!({"id": "old", "prompt": "slow", "image_url": "/o.png"})]);

    let (callbacks, mut rx) = ChannelCallbacks::new();
    let adapter = Arc::new(
        TransportAdapter::new(&test_config(&backend.base_url()), callbacks).unwrap(),
    );

    let inflight = {
        let adapter = Arc::clone(&adapter);
        tokio::spawn(async move {
            let query = ResultsQuery {
                search: Some("slow".to_string()),
                ..ResultsQuery::new(5)
            };
            adapter.refresh_recent_results(&query, 1).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(adapter.set_base_url(&other.base_url()).unwrap());

    inflight.await.unwrap().unwrap();
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_push_frames_reach_callbacks() {
    let backend = MockBackend::start().await;
    let (callbacks, mut rx) = ChannelCallbacks::new();
    let adapter = TransportAdapter::new(&test_config(&backend.base_url()), callbacks).unwrap();

    adapter.start_push();
    assert_eq!(next_event(&mut rx).await, "live:true");
    assert!(adapter.is_live());

    backend.push_raw("not json");
    backend.push(json!({"no_type": 1}));
    backend.push(json!({"type": "generation_started", "job_id": "j1"}));
    backend.push(json!({"type": "generation_progress", "job_id": "j1", "progress": 0.5}));
    backend.push(json!({"type": "something_new", "job_id": "j1"}));
    backend.push(json!({"type": "generation_complete", "job_id": "j1", "images": ["u"]}));

    assert_eq!(next_event(&mut rx).await, "started:j1");
    assert_eq!(next_event(&mut rx).await, "progress:j1:0.5");
    assert_eq!(next_event(&mut rx).await, "complete:j1");

    adapter.shutdown();
}

#[tokio::test]
async fn test_push_reconnects_after_server_close() {
    let backend = MockBackend::start().await;
    let (callbacks, mut rx) = ChannelCallbacks::new();
    let adapter = TransportAdapter::new(&test_config(&backend.base_url()), callbacks).unwrap();

    adapter.start_push();
    assert_eq!(next_event(&mut rx).await, "live:true");

    backend.drop_push_connections();
    assert_eq!(next_event(&mut rx).await, "live:false");
    assert_eq!(adapter.connection_state().attempts, 1);

    assert_eq!(next_event(&mut rx).await, "live:true");
    assert!(wait_until(|| backend.ws_connections() == 2).await);
    assert_eq!(adapter.connection_state().attempts, 0);

    adapter.shutdown();
}

#[tokio::test]
async fn test_stop_suppresses_reconnect() {
    let backend = MockBackend::start().await;
    let (callbacks, mut rx) = ChannelCallbacks::new();
    let adapter = TransportAdapter::new(&test_config(&backend.base_url()), callbacks).unwrap();

    adapter.start_push();
    assert_eq!(next_event(&mut rx).await, "live:true");

    adapter.stop_push();
    assert_eq!(next_event(&mut rx).await, "live:false");
    assert!(wait_until(|| backend.ws_open() == 0).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.ws_connections(), 1);
    assert!(adapter.connection_state().stopped);

    adapter.start_push();
    assert_eq!(next_event(&mut rx).await, "live:true");
    assert!(wait_until(|| backend.ws_connections() == 2).await);

    adapter.shutdown();
}

#[tokio::test]
async fn test_push_sends_api_key() {
    let backend = MockBackend::start().await;
    let mut config = test_config(&backend.base_url());
    config.api_key = Some("push-key".to_string());
    let (callbacks, mut rx) = ChannelCallbacks::new();
    let adapter = TransportAdapter::new(&config, callbacks).unwrap();

    adapter.start_push();
    assert_eq!(next_event(&mut rx).await, "live:true");
    assert_eq!(backend.hits("GET /ws/progress"), 1);
    let keys = backend.state.api_keys.lock().clone();
    assert_eq!(keys, vec![Some("push-key".to_string())]);

    adapter.shutdown();
}

#[tokio::test]
async fn test_unreachable_push_keeps_retrying() {
    let mut config = test_config("http://127.0.0.1:9");
    config.reconnect_delay = Duration::from_millis(20);
    let (callbacks, mut rx) = ChannelCallbacks::new();
    let adapter = TransportAdapter::new(&config, callbacks).unwrap();

    adapter.start_push();
    assert_eq!(next_event(&mut rx).await, "live:false");
    assert_eq!(next_event(&mut rx).await, "live:false");
    assert!(adapter.connection_state().attempts >= 2);
    assert!(!adapter.is_live());

    adapter.shutdown();
}
