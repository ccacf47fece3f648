//! 进程注册表：通过系统进程表查找绑定到某个推流目标的进程
//!
//! supervisor 不持有子进程句柄，进程可能被外部杀掉或替换，
//! 存活判断只看进程表里是否存在命令行含该目标的进程。

use std::collections::HashSet;
use sysinfo::{Pid, ProcessRefreshKind, System, UpdateKind};

/// 进程表中绑定到推流目标的一个进程
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedProcess {
    pub pid: u32,
    pub name: String,
}

pub trait ProcessRegistry: Send + Sync {
    /// 列出命令行参数中包含 `target` 的进程
    fn find_bound(&self, target: &str) -> Vec<ManagedProcess>;

    /// 强制结束进程，返回是否成功发出信号
    fn terminate(&self, pid: u32) -> bool;

    /// 结束所有绑定到 `target` 的进程，返回被结束的进程
    fn kill_bound(&self, target: &str) -> Vec<ManagedProcess> {
        self.find_bound(target)
            .into_iter()
            .filter(|p| self.terminate(p.pid))
            .collect()
    }
}

/// 基于 sysinfo 的实现，每次查询刷新一次进程表
pub struct SystemRegistry {
    self_pid: u32,
}

impl SystemRegistry {
    pub fn new() -> Self {
        Self {
            self_pid: std::process::id(),
        }
    }
}

impl Default for SystemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn is_bound(cmd: &[String], target: &str) -> bool {
    cmd.iter().any(|arg| arg == target)
}

/// 刷新进程表，命令行参数默认不加载，需要显式打开
fn process_table() -> System {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));
    sys
}

/// Linux 下每个线程也会作为独立条目出现，收集属于其他进程的线程 id
fn thread_ids(sys: &System) -> HashSet<Pid> {
    let mut threads = HashSet::new();
    for (pid, process) in sys.processes() {
        if let Some(tasks) = process.tasks() {
            threads.extend(tasks.iter().filter(|tid| *tid != pid).copied());
        }
    }
    threads
}

impl ProcessRegistry for SystemRegistry {
    fn find_bound(&self, target: &str) -> Vec<ManagedProcess> {
        let sys = process_table();
        let threads = thread_ids(&sys);

        let mut bound: Vec<ManagedProcess> = sys
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != self.self_pid && !threads.contains(*pid))
            .filter(|(_, process)| is_bound(process.cmd(), target))
            .map(|(pid, process)| ManagedProcess {
                pid: pid.as_u32(),
                name: process.name().to_string(),
            })
            .collect();
        bound.sort_by_key(|p| p.pid);
        bound
    }

    fn terminate(&self, pid: u32) -> bool {
        let mut sys = System::new();
        sys.refresh_processes();
        sys.process(Pid::from_u32(pid))
            .map(|process| process.kill())
            .unwrap_or(false)
    }
}
