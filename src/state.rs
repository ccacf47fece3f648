use crate::config::AppConfig;
use crate::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    /// 手动重启时重新读取的通道列表
    pub channels_path: PathBuf,
    /// 巡检与手动重启共用同一把锁，同一推流目标的 "结束重复进程 + 启动" 不会交错执行
    pub supervisor: Mutex<Supervisor>,
}

pub type SharedState = Arc<AppState>;
