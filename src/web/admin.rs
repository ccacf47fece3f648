use crate::channels::load_channel_list;
use crate::state::SharedState;
use crate::supervisor::UnknownChannel;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::time::Instant;

/// 注册管理 API 路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/sys/status", get(sys_status)) // 系统状态
        .route("/channels", get(list_channels)) // 通道列表
        .route("/channels/:name/relaunch", post(handle_relaunch)) // 手动重启
        .with_state(state)
}

/// 获取系统状态 API
/// 返回系统的内存和负载信息
pub async fn sys_status() -> Json<serde_json::Value> {
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
    }))
}

/// 获取通道列表 API
/// 返回每个通道的状态、窗口内失败次数和剩余暂停时间
pub async fn list_channels(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let supervisor = state.supervisor.lock().await;
    let channels = supervisor.snapshot(Instant::now());
    Json(serde_json::json!({
        "output_prefix": state.config.server.output_prefix,
        "channels": channels,
    }))
}

/// 手动重启通道 API
/// 重新读取通道列表，强制结束已绑定的进程后重新启动，列表中没有的通道返回 404
pub async fn handle_relaunch(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<String, (StatusCode, String)> {
    let channels = load_channel_list(&state.channels_path).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error: failed to reload channel list: {}", e),
        )
    })?;

    let mut supervisor = state.supervisor.lock().await;
    match supervisor.relaunch_from(&channels, &name).await {
        Ok(report) if report.killed.is_empty() => {
            Ok(format!("Channel [{}] relaunched (pid {})", name, report.pid))
        }
        Ok(report) => Ok(format!(
            "Channel [{}] relaunched (pid {}), replaced {} duplicate process(es)",
            name,
            report.pid,
            report.killed.len()
        )),
        Err(e) if e.downcast_ref::<UnknownChannel>().is_some() => {
            Err((StatusCode::NOT_FOUND, e.to_string()))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelSpec;
    use crate::config::AppConfig;
    use crate::engine::fake::{FakeInspector, RecordingSpawner};
    use crate::engine::Engine;
    use crate::logsink::LogSink;
    use crate::registry::fake::FakeRegistry;
    use crate::state::AppState;
    use crate::supervisor::Supervisor;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        spawner: Arc<RecordingSpawner>,
        channels_path: std::path::PathBuf,
    }

    fn app(dir: &tempfile::TempDir) -> Router {
        test_app(dir).router
    }

    fn test_app(dir: &tempfile::TempDir) -> TestApp {
        let mut config = AppConfig::default();
        config.server.log_dir = dir.path().to_string_lossy().to_string();
        config.server.kill_grace_ms = 0;

        let events = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(FakeRegistry::with_events(events.clone()));
        let spawner = Arc::new(RecordingSpawner::new(events));
        let engine = Engine::new(
            &config,
            Arc::new(FakeInspector::default()),
            registry.clone(),
            spawner.clone(),
        );
        let channels_path = dir.path().join("channels.txt");
        std::fs::write(&channels_path, "udp://239.0.0.1:1234|news1|encoder=cpu\n").unwrap();
        let channels = vec![ChannelSpec {
            source: "udp://239.0.0.1:1234".to_string(),
            name: "news1".to_string(),
            overrides: "encoder=cpu".to_string(),
        }];
        let supervisor = Supervisor::new(
            channels,
            &config.server.output_prefix,
            config.supervision.clone(),
            registry,
            Arc::new(engine),
            LogSink::new(&config.server.log_dir, config.log_rotation),
        );
        let router = router(Arc::new(AppState {
            config,
            channels_path: channels_path.clone(),
            supervisor: tokio::sync::Mutex::new(supervisor),
        }));
        TestApp {
            router,
            spawner,
            channels_path,
        }
    }

    fn relaunch_request(name: &str) -> Request<Body> {
        Request::post(format!("/channels/{}/relaunch", name))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn lists_channels() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(&dir)
            .oneshot(Request::get("/channels").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        let channel = &json["channels"][0];
        assert_eq!(channel["name"], "news1");
        assert_eq!(channel["state"], "launching");
        assert_eq!(channel["target"], "rtmp://127.0.0.1/live/news1");
        assert_eq!(channel["recent_failures"], 0);
    }

    #[tokio::test]
    async fn relaunch_known_channel() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(&dir)
            .oneshot(
                Request::post("/channels/news1/relaunch")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("pid 4242"));
    }

    #[tokio::test]
    async fn relaunch_unknown_channel_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(&dir)
            .oneshot(
                Request::post("/channels/ghost/relaunch")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn relaunch_reads_edited_channel_list() {
        let dir = tempfile::tempdir().unwrap();
        let test_app = test_app(&dir);
        std::fs::write(
            &test_app.channels_path,
            "udp://239.0.0.9:1234|news1|encoder=qsv\nudp://239.0.0.7:1234|sports|encoder=cpu\n",
        )
        .unwrap();

        let response = test_app
            .router
            .clone()
            .oneshot(relaunch_request("news1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = test_app
            .router
            .clone()
            .oneshot(relaunch_request("sports"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let launched = test_app.spawner.launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 2);
        assert!(launched[0].contains(&"h264_qsv".to_string()));
        assert!(launched[0]
            .iter()
            .any(|a| a.starts_with("udp://239.0.0.9:1234")));
        assert_eq!(
            launched[1].last().map(String::as_str),
            Some("rtmp://127.0.0.1/live/sports")
        );

        let response = test_app
            .router
            .oneshot(Request::get("/channels").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["channels"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn relaunch_fails_when_channel_list_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let test_app = test_app(&dir);
        std::fs::remove_file(&test_app.channels_path).unwrap();
        let response = test_app
            .router
            .oneshot(relaunch_request("news1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
