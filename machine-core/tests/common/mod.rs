//! Shared helpers for machine-core integration tests

#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::Arc;

use machine_common::logging::{Component, Logger};
use machine_common::LoggingConfig;
use serde_json::{json, Value};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn create_test_logger(scope: &str) -> Arc<Logger> {
    LoggingConfig::for_tests().init();
    Arc::new(Logger::new_root(Component::Custom("Test"), scope))
}

/// Path inside a temp dir as the string form stores expect
pub fn path_in(dir: &tempfile::TempDir, rel: &str) -> String {
    dir.path().join(rel).to_string_lossy().into_owned()
}

/// Run blocking client code off the test runtime. The blocking HTTP client
/// and the etcd backend refuse to run on an async worker.
pub async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

/// Authority answering every POST with `status` and `body`
pub async fn fixed_authority(status: u16, body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(&server)
        .await;
    server
}

/// Request bodies received by `server`, in arrival order, with their paths
pub async fn received(server: &MockServer) -> Vec<(String, Value)> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|r| {
            let body = r.body_json::<Value>().unwrap_or(Value::Null);
            (r.url.path().to_string(), body)
        })
        .collect()
}

/// cfssl style success envelope
pub fn envelope(result: Value) -> String {
    json!({"success": true, "result": result, "errors": [], "messages": []}).to_string()
}

/// An address nothing listens on
pub fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("address");
    drop(listener);
    format!("http://{addr}")
}
