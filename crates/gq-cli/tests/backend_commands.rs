//! CLI commands against an in-process mock backend
//!
//! The binary runs on a blocking thread while the mock keeps serving on
//! the test runtime.

use std::path::PathBuf;
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use assert_cmd::Command;
use serde_json::json;

use gq_test_support::MockBackend;

struct Harness {
    backend: Arc<MockBackend>,
    dir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        Self {
            backend: Arc::new(MockBackend::start().await),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    async fn run(&self, args: &[&str]) -> Output {
        let mut cmd = Command::cargo_bin("genqueue").unwrap();
        cmd.env_remove("GENQUEUE_BASE_URL")
            .env_remove("GENQUEUE_API_KEY")
            .env_remove("RUST_LOG")
            .current_dir(self.dir.path())
            .arg("--config")
            .arg(self.config_path())
            .arg("--base-url")
            .arg(self.backend.base_url())
            .args(args)
            .timeout(Duration::from_secs(30));

        tokio::task::spawn_blocking(move || cmd.output().unwrap())
            .await
            .unwrap()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn result(id: &str, prompt: &str, favorite: bool) -> serde_json::Value {
    json!({
        "id": id,
        "prompt": prompt,
        "image_url": format!("/img/{}.png", id),
        "created_at": "2024-05-01T12:00:00Z",
        "parameters": {"width": 512, "height": 512, "steps": 20},
        "is_favorite": favorite
    })
}

/// Push `frame` every 50ms once the backend has accepted a generation
fn push_after_submit(
    backend: &Arc<MockBackend>,
    frame: serde_json::Value,
) -> tokio::task::JoinHandle<()> {
    let backend = Arc::clone(backend);
    tokio::spawn(async move {
        loop {
            if backend.hits("POST /generation/generate") > 0 {
                backend.push(frame.clone());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_reports_backend() {
    let harness = Harness::start().await;
    *harness.backend.state.status.lock() = json!({
        "status": "ok",
        "gpu_available": true,
        "gpu_name": "RTX 4090",
        "queue_length": 3,
        "model_loaded": "sdxl"
    });

    let output = harness.run(&["status"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let out = stdout(&output);
    assert!(out.contains(&harness.backend.base_url()));
    assert!(out.contains("RTX 4090"));
    assert!(out.contains("Model: sdxl"));
    assert!(out.contains("Queue length: 3"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_jobs_lists_active_jobs() {
    let harness = Harness::start().await;
    harness.backend.set_jobs(vec![
        json!({"job_id": "j7", "status": "running", "progress": 0.4, "prompt": "a red fox"}),
        json!({"job_id": "j8", "status": "queued", "prompt": "a blue whale"}),
    ]);

    let output = harness.run(&["jobs"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let out = stdout(&output);
    assert!(out.contains("j7"));
    assert!(out.contains("processing"));
    assert!(out.contains("40%"));
    assert!(out.contains("a blue whale"));
    // processing jobs are listed first
    assert!(out.find("j7").unwrap() < out.find("j8").unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generate_no_wait_prints_job_id() {
    let harness = Harness::start().await;

    let output = harness
        .run(&["-q", "generate", "--prompt", "a cat", "--steps", "20", "--no-wait"])
        .await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output).trim(), "j1");
    assert_eq!(harness.backend.hits("POST /generation/generate"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generate_rejects_empty_prompt() {
    let harness = Harness::start().await;

    let output = harness.run(&["generate", "--prompt", "   "]).await;
    assert!(!output.status.success());
    assert_eq!(harness.backend.hits("POST /generation/generate"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generate_waits_for_completion() {
    let harness = Harness::start().await;

    // Keep announcing the completion once the job was submitted; repeats
    // are ignored as duplicates
    let pusher = push_after_submit(
        &harness.backend,
        json!({"type": "generation_complete", "job_id": "j1", "images": ["/img/j1.png"]}),
    );

    let output = harness
        .run(&["-q", "generate", "--prompt", "a cat", "--timeout", "20"])
        .await;
    pusher.abort();

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output).trim(), "/img/j1.png");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generate_reports_failure() {
    let harness = Harness::start().await;

    let pusher = push_after_submit(
        &harness.backend,
        json!({"type": "generation_error", "job_id": "j1", "error": "CUDA out of memory"}),
    );

    let output = harness
        .run(&["-q", "generate", "--prompt", "a cat", "--timeout", "20"])
        .await;
    pusher.abort();

    assert!(!output.status.success());
    assert!(stderr(&output).contains("CUDA out of memory"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_and_clear() {
    let harness = Harness::start().await;
    harness.backend.set_jobs(vec![
        json!({"job_id": "j1", "status": "queued", "prompt": "one"}),
        json!({"job_id": "j2", "status": "queued", "prompt": "two"}),
        json!({"job_id": "j3", "status": "running", "prompt": "three"}),
    ]);

    let output = harness.run(&["cancel", "j1"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Job j1 cancelled"));

    let output = harness.run(&["cancel", "missing"]).await;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("missing"));

    let output = harness.run(&["clear"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("Cancelled 2 job(s)"));
    assert!(harness.backend.state.jobs.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_results_with_filters() {
    let harness = Harness::start().await;
    harness.backend.set_results(vec![
        result("r3", "a castle at night", true),
        result("r2", "a cat in a hat", false),
        result("r1", "a cat on a roof", true),
    ]);

    let output = harness.run(&["results"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("r1") && out.contains("r2") && out.contains("r3"));

    let output = harness.run(&["results", "--search", "cat", "--favorites"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("r1"));
    assert!(!out.contains("r2"));
    assert!(!out.contains("r3"));

    let queries = harness.backend.state.queries.lock().clone();
    assert!(queries
        .iter()
        .any(|q| q.get("search").map(String::as_str) == Some("cat")
            && q.get("favorites").map(String::as_str) == Some("true")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_favorite_and_delete() {
    let harness = Harness::start().await;
    harness
        .backend
        .set_results(vec![result("r1", "a cat", false), result("r2", "a dog", false)]);

    let output = harness.run(&["rate", "r1", "4"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let output = harness.run(&["favorite", "r2"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let output = harness.run(&["favorite", "r2", "--unset"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let patches = harness.backend.state.patches.lock().clone();
    assert_eq!(patches.len(), 3);
    assert_eq!(patches[0], ("r1".to_string(), json!({"rating": 4})));
    assert_eq!(patches[1], ("r2".to_string(), json!({"is_favorite": true})));
    assert_eq!(patches[2], ("r2".to_string(), json!({"is_favorite": false})));

    let output = harness.run(&["delete", "r1", "nope"]).await;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("nope"));
    let remaining = harness.backend.state.results.lock().clone();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["id"], "r2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_download_writes_file() {
    let harness = Harness::start().await;

    let output = harness.run(&["download", "r5"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let saved = harness.dir.path().join("r5-final.png");
    assert_eq!(std::fs::read(&saved).unwrap(), vec![0x89u8, b'P', b'N', b'G']);

    let target = harness.dir.path().join("cat.png");
    let output = harness
        .run(&["download", "r5", "-o", target.to_str().unwrap()])
        .await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(target.exists());
}
