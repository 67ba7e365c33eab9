use axum::{
    middleware,
    response::Html,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth::require_api_key;
use crate::routes_models::get_models;
use crate::routes_runtime::{get_logs, get_status, post_start, post_stop};
use crate::routes_system::{get_network, get_stats, get_version};
use crate::state::SharedState;

const INDEX_HTML: &str = include_str!("../assets/index.html");

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub fn router(state: SharedState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/models", get(get_models))
        .route("/stats", get(get_stats))
        .route("/logs", get(get_logs))
        .route("/network", get(get_network))
        .route("/version", get(get_version))
        .route("/start/:model_id", post(post_start))
        .route("/stop", post(post_stop))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    use modelcfg::{LauncherConfig, ModelConfig, PathsSection, SecuritySection, ServerSection};
    use serde_json::Value;

    use crate::state::AppState;

    const KEY: &str = "test-key-0123456789";

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    fn config(llama_server: &Path, base: &Path) -> LauncherConfig {
        let mut models = BTreeMap::new();
        models.insert(
            "qwen3-30b".to_string(),
            ModelConfig {
                name: Some("Qwen3 30B".into()),
                file: "qwen3-30b.gguf".into(),
                context: 32768,
                gpu_layers: 99,
                cpu_moe: Some(12),
                temp: Some(0.7),
                top_k: None,
                top_p: None,
                min_p: None,
                extra_args: vec![],
            },
        );
        LauncherConfig {
            server: ServerSection {
                host: "127.0.0.1".into(),
                port: 0,
                llama_host: "127.0.0.1".into(),
                llama_port: free_port(),
            },
            security: SecuritySection { api_key: KEY.into() },
            paths: PathsSection {
                llama_server: llama_server.to_path_buf(),
                models_base: base.to_path_buf(),
            },
            models,
            supervisor: Default::default(),
        }
    }

    struct TestServer {
        base: String,
        client: reqwest::Client,
        state: SharedState,
        _dir: tempfile::TempDir,
    }

    impl TestServer {
        async fn spawn(script: Option<&str>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let server = dir.path().join("llama-server");
            if let Some(body) = script {
                std::fs::write(&server, format!("#!/bin/sh\n{body}\n")).unwrap();
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(&server, std::fs::Permissions::from_mode(0o755)).unwrap();
                }
            }

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let state = Arc::new(AppState::new(
                config(&server, dir.path()),
                "/nonexistent/nvidia-smi",
                port,
            ));
            let app = router(state.clone());
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            Self {
                base: format!("http://127.0.0.1:{port}"),
                client: reqwest::Client::new(),
                state,
                _dir: dir,
            }
        }

        fn get(&self, path: &str) -> reqwest::RequestBuilder {
            self.client.get(format!("{}{path}", self.base)).header("X-API-Key", KEY)
        }

        fn post(&self, path: &str) -> reqwest::RequestBuilder {
            self.client.post(format!("{}{path}", self.base)).header("X-API-Key", KEY)
        }
    }

    #[tokio::test]
    async fn test_missing_or_wrong_key_is_401() {
        let srv = TestServer::spawn(None).await;
        for path in ["/api/status", "/api/models", "/api/logs", "/api/stats"] {
            let resp = srv.client.get(format!("{}{path}", srv.base)).send().await.unwrap();
            assert_eq!(resp.status(), 401, "{path}");
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["error"], "Unauthorized");
        }

        let resp = srv
            .client
            .post(format!("{}/api/start/qwen3-30b", srv.base))
            .header("X-API-Key", "wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        // no side effect
        let status = srv.state.supervisor.status().await;
        assert_eq!(status.phase, crate::runtime::Phase::Stopped);
        assert_eq!(status.generation, 0);
    }

    #[tokio::test]
    async fn test_ui_served_without_auth() {
        let srv = TestServer::spawn(None).await;
        for path in ["/", "/index.html"] {
            let resp = srv.client.get(format!("{}{path}", srv.base)).send().await.unwrap();
            assert_eq!(resp.status(), 200);
            assert!(resp.text().await.unwrap().contains("<html"));
        }
    }

    #[tokio::test]
    async fn test_bearer_token_and_models() {
        let srv = TestServer::spawn(None).await;
        let resp = srv
            .client
            .get(format!("{}/api/models", srv.base))
            .bearer_auth(KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        let models = body["models"].as_array().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0]["id"], "qwen3-30b");
        assert_eq!(models[0]["name"], "Qwen3 30B");
        assert_eq!(models[0]["context"], 32768);
        assert_eq!(models[0]["cpu_moe"], 12);
        assert!(models[0].get("top_k").is_none());
    }

    #[tokio::test]
    async fn test_status_counts_requests() {
        let srv = TestServer::spawn(None).await;
        let a: Value = srv.get("/api/status").send().await.unwrap().json().await.unwrap();
        let b: Value = srv.get("/api/status").send().await.unwrap().json().await.unwrap();
        assert_eq!(a["phase"], "stopped");
        assert_eq!(a["running"], false);
        assert_eq!(b["request_count"].as_u64().unwrap(), a["request_count"].as_u64().unwrap() + 1);
    }

    #[tokio::test]
    async fn test_unknown_model_is_404() {
        let srv = TestServer::spawn(None).await;
        let resp = srv.post("/api/start/no-such-model").send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Unknown model: no-such-model");
    }

    #[tokio::test]
    async fn test_stop_when_idle_and_empty_logs() {
        let srv = TestServer::spawn(None).await;
        let resp = srv.post("/api/stop").send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert!(body["stopped"].is_null());

        let logs: Value = srv.get("/api/logs?lines=10").send().await.unwrap().json().await.unwrap();
        assert_eq!(logs["generation"], 0);
        assert!(logs["logs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_degrade_without_gpu() {
        let srv = TestServer::spawn(None).await;
        let body: Value = srv.get("/api/stats").send().await.unwrap().json().await.unwrap();
        assert!(body["gpu"].is_null());
        assert!(body["gpu_error"].as_str().is_some());
        assert!(body["memory"]["total_gb"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_version() {
        let srv = TestServer::spawn(None).await;
        let body: Value = srv.get("/api/version").send().await.unwrap().json().await.unwrap();
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_cors_preflight_skips_auth() {
        let srv = TestServer::spawn(None).await;
        let resp = srv
            .client
            .request(reqwest::Method::OPTIONS, format!("{}/api/status", srv.base))
            .header("Origin", "http://example.com")
            .header("Access-Control-Request-Method", "GET")
            .header("Access-Control-Request-Headers", "x-api-key")
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(resp.headers().contains_key("access-control-allow-origin"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_conflict_logs_and_stop() {
        let srv = TestServer::spawn(Some("echo \"llama server listening\"\nexec sleep 30")).await;

        let resp = srv.post("/api/start/qwen3-30b").send().await.unwrap();
        assert_eq!(resp.status(), 202);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["model"], "qwen3-30b");
        assert_eq!(body["phase"], "starting");
        assert!(body["pid"].as_u64().is_some());

        let resp = srv.post("/api/start/qwen3-30b").send().await.unwrap();
        assert_eq!(resp.status(), 409);

        let status: Value = srv.get("/api/status").send().await.unwrap().json().await.unwrap();
        assert_eq!(status["model"], "qwen3-30b");
        assert_eq!(status["name"], "Qwen3 30B");
        assert_eq!(status["running"], true);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let logs: Value = srv.get("/api/logs").send().await.unwrap().json().await.unwrap();
        let lines: Vec<&str> = logs["logs"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|e| e["line"].as_str())
            .collect();
        assert!(lines.contains(&"llama server listening"), "{lines:?}");
        assert_eq!(logs["generation"], 1);

        let resp = srv.post("/api/stop").send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["stopped"], "qwen3-30b");

        let status: Value = srv.get("/api/status").send().await.unwrap().json().await.unwrap();
        assert_eq!(status["phase"], "stopped");
        assert!(status["pid"].is_null());
    }
}
