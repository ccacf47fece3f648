mod audio;
mod channels;
mod config;
mod engine;
mod logsink;
mod params;
mod planner;
mod probe;
mod registry;
mod state;
mod supervisor;
mod web;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::AppConfig;
use engine::Engine;
use logsink::LogSink;
use registry::{ProcessRegistry, SystemRegistry};
use state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// VTX Relay - Channel Relay Supervisor
/// 读取通道列表，启动全部转推进程，并在后台巡检、自动重启
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtx-relay.yaml")]
    config: PathBuf,

    /// 通道列表路径，覆盖配置文件中的 channels_file
    #[arg(long)]
    channels: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 重启指定通道后退出
    Relaunch {
        /// 通道名称
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let channels_path = args
        .channels
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.server.channels_file));

    // 通道列表缺失时直接失败，退出码非 0
    let channels = channels::load_channel_list(&channels_path)?;
    if channels.is_empty() {
        warn!("Channel list {} has no channels", channels_path.display());
    }

    let registry: Arc<dyn ProcessRegistry> = Arc::new(SystemRegistry::new());
    let engine = Arc::new(Engine::from_config(&config, registry.clone()));
    let logs = LogSink::new(&config.server.log_dir, config.log_rotation);
    let mut supervisor = Supervisor::new(
        channels,
        &config.server.output_prefix,
        config.supervision.clone(),
        registry,
        engine,
        logs.clone(),
    );

    if let Some(Command::Relaunch { name }) = args.command {
        let report = supervisor.relaunch(&name).await?;
        for process in &report.killed {
            info!("Replaced pid {} ({}) bound to channel [{}]", process.pid, process.name, name);
        }
        info!(
            "Channel [{}] relaunched with pid {} (state: {:?})",
            name,
            report.pid,
            supervisor.state(&name)
        );
        info!("Command line: {}", report.args.join(" "));
        info!("Channel log: {}", logs.channel(&name).path().display());
        return Ok(());
    }

    info!(
        "VTX Relay starting. Channels: {}, output prefix: {}",
        channels_path.display(),
        config.server.output_prefix
    );
    supervisor.launch_all().await;

    let interval = config.server.supervisor_interval();
    let listen = config.server.listen.clone();
    let state = Arc::new(AppState {
        config,
        channels_path,
        supervisor: Mutex::new(supervisor),
    });

    match listen {
        Some(addr) => {
            // 启动后台巡检
            tokio::spawn(supervisor::start_supervisor(state.clone(), interval));

            info!("Admin API listening on {}", addr);
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            axum::serve(listener, web::admin::router(state)).await?;
        }
        None => supervisor::start_supervisor(state, interval).await,
    }

    Ok(())
}
