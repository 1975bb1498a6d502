/*
* Lifecycle Simulator
* -------------------
* There is no hypervisor behind this service, so time itself is the hypervisor.
* Every transition that "takes a while" is a tokio task that sleeps for a fixed
* delay and then writes the next status straight into the repository.
*
* Things to keep in mind before touching this file:
*
*   - Background writes are unconditional. Whatever the task wakes up to, it
*     writes its status anyway. Last writer wins, no compare-and-swap.
*   - Failures are logged and forgotten. The HTTP request that started the
*     task already returned 202, there's nobody left to tell.
*   - Tasks are tracked, not supervised. You can ask what's in flight for a
*     VM, and shutdown can abort everything, but nothing gets retried.
*/

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::core::repository::VmRepository;
use crate::core::stats::StatsSampler;
use crate::core::vm::{VMStatus, VmStats};
use crate::errors::{VmManagerError, VmResult};

pub const PROVISION_DELAY: Duration = Duration::from_secs(2);
pub const STARTUP_DELAY: Duration = Duration::from_secs(3);
pub const SHUTDOWN_DELAY: Duration = Duration::from_secs(2);
pub const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Provision,
    Startup,
    Shutdown,
    Restart,
    StatsUpdater,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Provision => "provision",
            TaskKind::Startup => "startup",
            TaskKind::Shutdown => "shutdown",
            TaskKind::Restart => "restart",
            TaskKind::StatsUpdater => "stats_updater",
        };
        f.write_str(name)
    }
}

struct TrackedTask {
    kind: TaskKind,
    handle: JoinHandle<()>,
}

type TaskRegistry = HashMap<Uuid, Vec<TrackedTask>>;

#[derive(Clone)]
pub struct LifecycleSimulator {
    repo: Arc<dyn VmRepository>,
    sampler: StatsSampler,
    tasks: Arc<Mutex<TaskRegistry>>,
}

impl LifecycleSimulator {
    pub fn new(repo: Arc<dyn VmRepository>, sampler: StatsSampler) -> Self {
        Self {
            repo,
            sampler,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn registry(&self) -> MutexGuard<'_, TaskRegistry> {
        // The registry only holds handles, so a poisoned lock is still usable.
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track<F>(&self, vm_id: Uuid, kind: TaskKind, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = info_span!("lifecycle", vm_id = %vm_id, task = %kind);
        let handle = tokio::spawn(fut.instrument(span));

        let mut registry = self.registry();
        let entry = registry.entry(vm_id).or_default();
        entry.retain(|task| !task.handle.is_finished());
        entry.push(TrackedTask { kind, handle });
    }

    /// Kinds of the unfinished background tasks for one VM.
    pub fn in_flight(&self, vm_id: Uuid) -> Vec<TaskKind> {
        let mut registry = self.registry();
        let Some(entry) = registry.get_mut(&vm_id) else {
            return Vec::new();
        };
        entry.retain(|task| !task.handle.is_finished());
        let kinds = entry.iter().map(|task| task.kind).collect::<Vec<_>>();
        if kinds.is_empty() {
            registry.remove(&vm_id);
        }
        kinds
    }

    /// Number of unfinished background tasks across every VM.
    pub fn active_tasks(&self) -> usize {
        let mut registry = self.registry();
        registry.retain(|_, tasks| {
            tasks.retain(|task| !task.handle.is_finished());
            !tasks.is_empty()
        });
        registry.values().map(Vec::len).sum()
    }

    /// Aborts every tracked task. Used on shutdown.
    pub fn abort_all(&self) {
        let mut registry = self.registry();
        let mut aborted = 0usize;
        for (_, tasks) in registry.drain() {
            for task in tasks {
                if !task.handle.is_finished() {
                    task.handle.abort();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            info!("Aborted {} in-flight lifecycle tasks", aborted);
        }
    }

    /// `pending -> stopped` after the provisioning delay.
    pub fn provision(&self, vm_id: Uuid) {
        let repo = Arc::clone(&self.repo);
        self.track(vm_id, TaskKind::Provision, async move {
            time::sleep(PROVISION_DELAY).await;
            match repo.update_status(vm_id, VMStatus::Stopped).await {
                Ok(()) => info!("VM provisioned"),
                Err(e) => error!("Failed to update VM status after provisioning: {}", e),
            }
        });
    }

    /// `starting -> running` after the startup delay, then begins sampling stats.
    pub fn startup(&self, vm_id: Uuid) {
        let sim = self.clone();
        self.track(vm_id, TaskKind::Startup, async move {
            time::sleep(STARTUP_DELAY).await;
            if let Err(e) = sim.repo.update_status(vm_id, VMStatus::Running).await {
                error!("Failed to update VM status after startup: {}", e);
                return;
            }
            info!("VM running");
            sim.spawn_stats_updater(vm_id);
        });
    }

    /// `stopping -> stopped` after the shutdown delay.
    pub fn shutdown(&self, vm_id: Uuid) {
        let repo = Arc::clone(&self.repo);
        self.track(vm_id, TaskKind::Shutdown, async move {
            time::sleep(SHUTDOWN_DELAY).await;
            match repo.update_status(vm_id, VMStatus::Stopped).await {
                Ok(()) => info!("VM stopped"),
                Err(e) => error!("Failed to update VM status after shutdown: {}", e),
            }
        });
    }

    /// Second half of a restart. The caller has already written `stopping`.
    ///
    /// `stopping -> starting` is not a legal edge, so the chain passes through
    /// `stopped` on its way back up.
    pub fn restart(&self, vm_id: Uuid) {
        let sim = self.clone();
        self.track(vm_id, TaskKind::Restart, async move {
            time::sleep(SHUTDOWN_DELAY).await;
            for status in [VMStatus::Stopped, VMStatus::Starting] {
                if let Err(e) = sim.repo.update_status(vm_id, status).await {
                    error!("Failed to update VM status to {} during restart: {}", status, e);
                    return;
                }
            }

            time::sleep(STARTUP_DELAY).await;
            if let Err(e) = sim.repo.update_status(vm_id, VMStatus::Running).await {
                error!("Failed to update VM status after restart: {}", e);
                return;
            }
            info!("VM restarted");
            sim.spawn_stats_updater(vm_id);
        });
    }

    /// Periodic telemetry for a running VM. Exits on the first tick that finds
    /// the VM gone or no longer running. At most one updater runs per VM.
    pub fn spawn_stats_updater(&self, vm_id: Uuid) {
        if self.in_flight(vm_id).contains(&TaskKind::StatsUpdater) {
            debug!(vm_id = %vm_id, "Stats updater already running");
            return;
        }

        let sim = self.clone();
        self.track(vm_id, TaskKind::StatsUpdater, async move {
            let mut ticker = time::interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
            loop {
                ticker.tick().await;
                match sim.refresh_stats(vm_id).await {
                    Ok(Some(stats)) => debug!(
                        cpu = stats.cpu_usage_percent,
                        uptime = stats.uptime_seconds,
                        "Stats refreshed"
                    ),
                    Ok(None) => {
                        debug!("VM no longer running, stats updater exiting");
                        break;
                    }
                    Err(VmManagerError::NotFound { .. }) => {
                        debug!("VM gone, stats updater exiting");
                        break;
                    }
                    Err(e) => warn!("Failed to update VM stats: {}", e),
                }
            }
        });
    }

    /// Samples and persists fresh stats. `None` when the VM is not running.
    pub async fn refresh_stats(&self, vm_id: Uuid) -> VmResult<Option<VmStats>> {
        let vm = self.repo.get_by_id(vm_id).await?;
        if vm.status != VMStatus::Running {
            return Ok(None);
        }

        let stats = self.sampler.sample(&vm, Utc::now());
        self.repo.update_stats(vm_id, &stats).await?;
        Ok(Some(stats))
    }
}

impl fmt::Debug for LifecycleSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleSimulator")
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}
