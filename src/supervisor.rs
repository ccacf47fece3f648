use crate::channels::{output_target, ChannelSpec};
use crate::config::SupervisionPolicy;
use crate::engine::{ChannelLauncher, LaunchReport};
use crate::logsink::LogSink;
use crate::registry::ProcessRegistry;
use crate::state::SharedState;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 通道生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Launching,
    Running,
    /// 启动失败
    Crashed,
    /// 进程表中找不到对应进程
    Missing,
    Relaunching,
    Paused,
}

/// 单个通道的运行时状态，只由 supervisor 修改
struct ChannelRuntime {
    spec: ChannelSpec,
    target: String,
    state: ChannelState,
    /// 窗口内的失败时间点，写入时裁剪过期项
    failures: VecDeque<Instant>,
    paused_until: Option<Instant>,
    last_pid: Option<u32>,
}

impl ChannelRuntime {
    fn new(spec: ChannelSpec, output_prefix: &str) -> Self {
        Self {
            target: output_target(output_prefix, &spec.name),
            spec,
            state: ChannelState::Launching,
            failures: VecDeque::new(),
            paused_until: None,
            last_pid: None,
        }
    }

    fn record_failure(&mut self, now: Instant, window: Duration) -> usize {
        self.failures.push_back(now);
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.len()
    }

    fn recent_failures(&self, now: Instant, window: Duration) -> usize {
        self.failures
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= window)
            .count()
    }
}

/// 管理 API 使用的通道快照
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub source: String,
    pub target: String,
    pub state: ChannelState,
    pub recent_failures: usize,
    pub paused_for_sec: Option<u64>,
    pub last_pid: Option<u32>,
}

/// 一轮巡检的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub alive: Vec<String>,
    pub relaunched: Vec<String>,
    pub paused: Vec<String>,
    /// 仍在暂停期内而跳过的通道
    pub held: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("channel not found: {0}")]
pub struct UnknownChannel(pub String);

pub struct Supervisor {
    channels: Vec<ChannelRuntime>,
    output_prefix: String,
    policy: SupervisionPolicy,
    registry: Arc<dyn ProcessRegistry>,
    launcher: Arc<dyn ChannelLauncher>,
    logs: LogSink,
}

impl Supervisor {
    pub fn new(
        specs: Vec<ChannelSpec>,
        output_prefix: &str,
        policy: SupervisionPolicy,
        registry: Arc<dyn ProcessRegistry>,
        launcher: Arc<dyn ChannelLauncher>,
        logs: LogSink,
    ) -> Self {
        let channels = specs
            .into_iter()
            .map(|spec| ChannelRuntime::new(spec, output_prefix))
            .collect();
        Self {
            channels,
            output_prefix: output_prefix.to_string(),
            policy,
            registry,
            launcher,
            logs,
        }
    }

    pub fn state(&self, name: &str) -> Option<ChannelState> {
        self.channels
            .iter()
            .find(|c| c.spec.name == name)
            .map(|c| c.state)
    }

    pub fn snapshot(&self, now: Instant) -> Vec<ChannelStatus> {
        let window = self.policy.failure_window();
        self.channels
            .iter()
            .map(|c| ChannelStatus {
                name: c.spec.name.clone(),
                source: c.spec.source.clone(),
                target: c.target.clone(),
                state: c.state,
                recent_failures: c.recent_failures(now, window),
                paused_for_sec: c
                    .paused_until
                    .map(|until| until.saturating_duration_since(now).as_secs()),
                last_pid: c.last_pid,
            })
            .collect()
    }

    /// 执行启动流程并更新状态
    async fn start(&mut self, idx: usize) -> anyhow::Result<LaunchReport> {
        let launcher = self.launcher.clone();
        let channel = &mut self.channels[idx];
        let log = self.logs.channel(&channel.spec.name);

        match launcher.launch(&channel.spec).await {
            Ok(report) => {
                channel.state = ChannelState::Running;
                channel.last_pid = Some(report.pid);
                Ok(report)
            }
            Err(e) => {
                // 下一轮巡检会把它当作 Missing 处理
                channel.state = ChannelState::Crashed;
                log.error(&format!("Launch failed: {}", e));
                Err(e)
            }
        }
    }

    /// 进程启动时拉起全部通道
    pub async fn launch_all(&mut self) {
        for idx in 0..self.channels.len() {
            self.channels[idx].state = ChannelState::Launching;
            let _ = self.start(idx).await;
        }
    }

    /// 手动重启指定通道
    ///
    /// 先强制结束绑定到该推流目标的进程，再走完整启动流程。
    /// 暂停状态被清除，失败历史保留。
    pub async fn relaunch(&mut self, name: &str) -> anyhow::Result<LaunchReport> {
        let idx = self
            .channels
            .iter()
            .position(|c| c.spec.name == name)
            .ok_or_else(|| UnknownChannel(name.to_string()))?;

        let log = self.logs.channel(name);
        let target = self.channels[idx].target.clone();
        for process in self.registry.kill_bound(&target) {
            log.warn(&format!(
                "Manual relaunch: killed pid {} ({}) bound to {}",
                process.pid, process.name, target
            ));
        }

        let channel = &mut self.channels[idx];
        channel.paused_until = None;
        channel.state = ChannelState::Relaunching;
        self.start(idx).await
    }

    /// 用重新读取的通道列表中的定义重启指定通道
    ///
    /// 已有通道替换为新的定义，失败历史保留；列表中新增的通道会加入巡检。
    pub async fn relaunch_from(
        &mut self,
        specs: &[ChannelSpec],
        name: &str,
    ) -> anyhow::Result<LaunchReport> {
        let spec = specs
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| UnknownChannel(name.to_string()))?;
        self.upsert(spec);
        self.relaunch(name).await
    }

    fn upsert(&mut self, spec: ChannelSpec) {
        match self.channels.iter_mut().find(|c| c.spec.name == spec.name) {
            Some(channel) => {
                if channel.spec != spec {
                    info!(channel = %spec.name, "Channel definition changed, using reloaded entry");
                }
                channel.spec = spec;
            }
            None => {
                info!(channel = %spec.name, "New channel added to supervision");
                self.channels.push(ChannelRuntime::new(spec, &self.output_prefix));
            }
        }
    }

    /// 一轮巡检
    ///
    /// # 流程
    /// - 暂停期内的通道直接跳过
    /// - 暂停到期的通道重新进入正常流程，失败历史不清空
    /// - 进程表中存在绑定进程视为运行中
    /// - 否则记录一次失败，窗口内失败次数超过阈值则暂停，未超过则重启
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        let window = self.policy.failure_window();

        for idx in 0..self.channels.len() {
            let name = self.channels[idx].spec.name.clone();
            let log = self.logs.channel(&name);

            // --- 阶段 1: 暂停检查 ---
            if let Some(until) = self.channels[idx].paused_until {
                if now < until {
                    self.channels[idx].state = ChannelState::Paused;
                    report.held.push(name);
                    continue;
                }
                self.channels[idx].paused_until = None;
                log.info("Pause expired, resuming supervision");
            }

            // --- 阶段 2: 存活检查 ---
            let bound = self.registry.find_bound(&self.channels[idx].target);
            if let Some(process) = bound.first() {
                let channel = &mut self.channels[idx];
                channel.state = ChannelState::Running;
                channel.last_pid = Some(process.pid);
                debug!(channel = %name, pid = process.pid, "Channel alive");
                report.alive.push(name);
                continue;
            }

            // --- 阶段 3: 失败计数与退避 ---
            let channel = &mut self.channels[idx];
            channel.state = ChannelState::Missing;
            let failures = channel.record_failure(now, window);

            if failures > self.policy.max_failures {
                channel.paused_until = Some(now + self.policy.pause());
                channel.state = ChannelState::Paused;
                log.warn(&format!(
                    "Channel down {} times within {}s, pausing relaunch for {}s",
                    failures, self.policy.failure_window_sec, self.policy.pause_sec
                ));
                report.paused.push(name);
                continue;
            }

            // --- 阶段 4: 重启 ---
            log.warn(&format!(
                "Channel process missing ({}/{} failures in window), relaunching",
                failures, self.policy.max_failures
            ));
            channel.state = ChannelState::Relaunching;
            if self.start(idx).await.is_ok() {
                report.relaunched.push(name);
            }
        }

        report
    }
}

/// 启动后台巡检任务，按固定间隔检查通道存活并按需重启
///
/// 首轮巡检在一个间隔之后执行，给刚启动的进程留出时间。
pub async fn start_supervisor(state: SharedState, interval: Duration) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let mut supervisor = state.supervisor.lock().await;
        let report = supervisor.tick(Instant::now()).await;
        info!(
            "Supervisor tick: {} alive, {} relaunched, {} paused, {} held",
            report.alive.len(),
            report.relaunched.len(),
            report.paused.len(),
            report.held.len()
        );
    }
}
