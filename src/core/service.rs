use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::LimitsSettings;
use crate::core::lifecycle::LifecycleSimulator;
use crate::core::repository::VmRepository;
use crate::core::seed;
use crate::core::summary::ResourceSummary;
use crate::core::vm::{
    CreateVmRequest, ListOptions, Operation, Pagination, StateChangeRequest, UpdateVmRequest,
    VMStatus, VirtualMachine, VmListResponse, VmResponse, VmStats,
};
use crate::errors::{ResourceType, VmManagerError, VmResult};

/// Size of the pretend node pool VMs get scattered across.
const NODE_POOL_SIZE: u32 = 10;

/// Principal recorded when nobody authenticated.
pub const SYSTEM_PRINCIPAL: &str = "system";

/// Orchestrates VM CRUD and lifecycle operations on top of a repository.
///
/// Every state-changing request holds a per-VM lock across its
/// read-check-write, so two requests against the same VM never interleave.
/// Background lifecycle tasks do not take the lock.
pub struct VmService {
    repo: Arc<dyn VmRepository>,
    limits: LimitsSettings,
    simulator: LifecycleSimulator,
    vm_locks: VmLocks,
}

type VmLocks = Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>;

/// Holds one VM's lock. The map entry goes away with the last holder, so ids
/// that never existed do not pile up.
struct VmLockGuard<'a> {
    locks: &'a VmLocks,
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for VmLockGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Release under the map lock so the strong count below is stable.
        drop(self.guard.take());
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

impl VmService {
    pub fn new(
        repo: Arc<dyn VmRepository>,
        limits: LimitsSettings,
        simulator: LifecycleSimulator,
    ) -> Self {
        Self {
            repo,
            limits,
            simulator,
            vm_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn VmRepository> {
        &self.repo
    }

    pub fn simulator(&self) -> &LifecycleSimulator {
        &self.simulator
    }

    async fn lock_vm(&self, id: Uuid) -> VmLockGuard<'_> {
        let lock = {
            let mut locks = self
                .vm_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(id).or_default())
        };
        let guard = lock.lock_owned().await;
        VmLockGuard {
            locks: &self.vm_locks,
            id,
            guard: Some(guard),
        }
    }

    pub async fn create_vm(&self, mut req: CreateVmRequest) -> VmResult<VirtualMachine> {
        req.validate()?;
        if let Err(e) = self.validate_resource_limits(req.cpu_cores, req.ram_mb, req.disk_gb) {
            warn!(operation = "create-vm", "Resource validation failed: {}", e);
            return Err(e);
        }

        let count = self.repo.count().await?;
        if count >= self.limits.max_vms {
            return Err(VmManagerError::ResourceExceeded {
                resource: ResourceType::Vms,
                requested: count + 1,
                limit: self.limits.max_vms,
            });
        }

        if self.repo.exists_by_name(&req.name).await? {
            return Err(VmManagerError::vm_exists(req.name));
        }

        if req.created_by.is_empty() {
            req.created_by = SYSTEM_PRINCIPAL.to_string();
        }

        let vm = VirtualMachine::from_request(req, self.assign_node_id(), Utc::now());
        if let Err(e) = self.repo.create(&vm).await {
            error!(operation = "create-vm", "Failed to create VM: {}", e);
            return Err(e);
        }

        info!(
            operation = "create-vm",
            vm_id = %vm.id,
            node_id = %vm.node_id,
            "VM created successfully: {}",
            vm.name
        );
        self.simulator.provision(vm.id);
        Ok(vm)
    }

    pub async fn get_vm(&self, id: Uuid) -> VmResult<VirtualMachine> {
        self.repo.get_by_id(id).await.map_err(|e| {
            debug!(operation = "get-vm", vm_id = %id, "Failed to get VM: {}", e);
            e
        })
    }

    pub async fn get_vm_by_name(&self, name: &str) -> VmResult<VirtualMachine> {
        self.repo.get_by_name(name).await
    }

    pub async fn update_vm(&self, id: Uuid, req: UpdateVmRequest) -> VmResult<VirtualMachine> {
        let req = req.normalized();
        req.validate()?;

        let _guard = self.lock_vm(id).await;
        let mut vm = self.repo.get_by_id(id).await?;
        vm.ensure_can_perform(Operation::Update)?;

        let (cpu, ram, disk) = req.merged_resources(&vm.spec);
        self.validate_resource_limits(cpu, ram, disk)?;

        if let Some(name) = req.name.as_deref() {
            if name != vm.name && self.repo.exists_by_name(name).await? {
                return Err(VmManagerError::vm_exists(name));
            }
        }

        req.apply_to(&mut vm);
        if let Err(e) = self.repo.update(&vm).await {
            error!(operation = "update-vm", vm_id = %id, "Failed to update VM: {}", e);
            return Err(e);
        }

        info!(operation = "update-vm", vm_id = %id, "VM updated successfully: {}", vm.name);
        self.repo.get_by_id(id).await
    }

    pub async fn delete_vm(&self, id: Uuid) -> VmResult<()> {
        let _guard = self.lock_vm(id).await;
        let vm = self.repo.get_by_id(id).await?;
        vm.ensure_can_perform(Operation::Delete)?;

        if let Err(e) = self.repo.delete(id).await {
            error!(operation = "delete-vm", vm_id = %id, "Failed to delete VM: {}", e);
            return Err(e);
        }
        info!(operation = "delete-vm", vm_id = %id, "VM deleted successfully: {}", vm.name);
        Ok(())
    }

    /// One page of VMs. With `include_stats`, running VMs on the page get a
    /// synchronous stats refresh first, which costs a write per VM.
    pub async fn list_vms(&self, opts: ListOptions) -> VmResult<VmListResponse> {
        opts.validate()?;

        let (vms, total) = self.repo.list(&opts).await?;
        let now = Utc::now();

        let mut items = Vec::with_capacity(vms.len());
        for mut vm in vms {
            if opts.include_stats && vm.status == VMStatus::Running {
                match self.simulator.refresh_stats(vm.id).await {
                    Ok(Some(stats)) => vm.stats = stats,
                    Ok(None) => {}
                    Err(e) => warn!(vm_id = %vm.id, "Failed to refresh stats while listing: {}", e),
                }
            }
            items.push(VmResponse::new(vm, now));
        }

        Ok(VmListResponse {
            vms: items,
            pagination: Pagination::new(opts.page, opts.limit, total),
        })
    }

    pub async fn start_vm(&self, id: Uuid, req: &StateChangeRequest) -> VmResult<()> {
        let _guard = self.lock_vm(id).await;
        self.transition(id, Operation::Start, VMStatus::Starting, req)
            .await?;
        self.simulator.startup(id);
        Ok(())
    }

    /// Graceful stop goes through `stopping`. `force` lands in `stopped`
    /// before returning, with no background task.
    pub async fn stop_vm(&self, id: Uuid, req: &StateChangeRequest) -> VmResult<()> {
        let _guard = self.lock_vm(id).await;
        if !req.force {
            self.transition(id, Operation::Stop, VMStatus::Stopping, req)
                .await?;
            self.simulator.shutdown(id);
            return Ok(());
        }

        let vm = self.repo.get_by_id(id).await?;
        vm.ensure_can_perform(Operation::Stop)?;

        if vm.can_transition_to(VMStatus::Stopped) {
            self.repo.update_status(id, VMStatus::Stopped).await?;
        } else {
            // running has no direct edge to stopped; walk through stopping.
            vm.ensure_transition(VMStatus::Stopping)?;
            self.repo.update_status(id, VMStatus::Stopping).await?;
            self.repo.update_status(id, VMStatus::Stopped).await?;
        }

        info!(
            operation = "force-stop",
            vm_id = %id,
            reason = req.reason.as_deref().unwrap_or(""),
            "VM force-stopped: {}",
            vm.name
        );
        Ok(())
    }

    pub async fn restart_vm(&self, id: Uuid, req: &StateChangeRequest) -> VmResult<()> {
        let _guard = self.lock_vm(id).await;
        self.transition(id, Operation::Restart, VMStatus::Stopping, req)
            .await?;
        self.simulator.restart(id);
        Ok(())
    }

    pub async fn suspend_vm(&self, id: Uuid, req: &StateChangeRequest) -> VmResult<()> {
        let _guard = self.lock_vm(id).await;
        self.transition(id, Operation::Suspend, VMStatus::Suspended, req)
            .await
            .map(|_| ())
    }

    pub async fn resume_vm(&self, id: Uuid, req: &StateChangeRequest) -> VmResult<()> {
        let _guard = self.lock_vm(id).await;
        self.transition(id, Operation::Resume, VMStatus::Running, req)
            .await?;
        // The previous updater exits on its first tick after the suspend.
        self.simulator.spawn_stats_updater(id);
        Ok(())
    }

    /// Eligibility, then transition validity, then the status write.
    /// Callers must hold the VM lock.
    async fn transition(
        &self,
        id: Uuid,
        op: Operation,
        target: VMStatus,
        req: &StateChangeRequest,
    ) -> VmResult<VirtualMachine> {
        let vm = self.repo.get_by_id(id).await?;
        vm.ensure_can_perform(op)?;
        vm.ensure_transition(target)?;

        if let Err(e) = self.repo.update_status(id, target).await {
            error!(operation = %op, vm_id = %id, "Failed to update VM status: {}", e);
            return Err(e);
        }

        info!(
            operation = %op,
            vm_id = %id,
            from = %vm.status,
            to = %target,
            updated_by = req.updated_by.as_deref().unwrap_or(SYSTEM_PRINCIPAL),
            reason = req.reason.as_deref().unwrap_or(""),
            "VM {} operation initiated: {}",
            op,
            vm.name
        );
        Ok(vm)
    }

    pub async fn get_resource_summary(&self) -> VmResult<ResourceSummary> {
        let mut summary = self.repo.get_resource_summary().await.map_err(|e| {
            error!(operation = "get-resource-summary", "Failed to get resource summary: {}", e);
            e
        })?;
        summary.generated_at = Some(Utc::now());
        Ok(summary)
    }

    /// Refreshes synthetic stats for a running VM. Returns the new stats, or
    /// `None` when the VM is not running and nothing was written.
    pub async fn update_vm_stats(&self, id: Uuid) -> VmResult<Option<VmStats>> {
        self.simulator.refresh_stats(id).await
    }

    /// Restarts stats updaters for VMs persisted as running, e.g. after a reboot.
    pub async fn resume_stats_updaters(&self) -> VmResult<usize> {
        let running = self
            .repo
            .list_all()
            .await?
            .into_iter()
            .filter(|vm| vm.status == VMStatus::Running)
            .collect::<Vec<_>>();

        for vm in &running {
            self.simulator.spawn_stats_updater(vm.id);
        }
        if !running.is_empty() {
            info!("Resumed stats updaters for {} running VMs", running.len());
        }
        Ok(running.len())
    }

    /// Loads the demo fleet into an empty store. Returns how many VMs were added.
    pub async fn seed_sample_vms(&self) -> VmResult<usize> {
        if self.repo.count().await? > 0 {
            debug!("Store not empty, skipping sample data");
            return Ok(0);
        }

        let samples = seed::sample_vms(Utc::now());
        for vm in &samples {
            self.repo.create(vm).await?;
        }
        info!("Seeded {} sample VMs", samples.len());
        Ok(samples.len())
    }

    pub fn validate_resource_limits(&self, cpu: u32, ram: u32, disk: u32) -> VmResult<()> {
        let checks = [
            (ResourceType::Cpu, cpu, self.limits.max_cpu_cores),
            (ResourceType::Memory, ram, self.limits.max_ram_mb),
            (ResourceType::Storage, disk, self.limits.max_disk_gb),
        ];
        for (resource, requested, limit) in checks {
            if requested > limit {
                return Err(VmManagerError::ResourceExceeded {
                    resource,
                    requested: u64::from(requested),
                    limit: u64::from(limit),
                });
            }
        }
        Ok(())
    }

    fn assign_node_id(&self) -> String {
        let node = rand::thread_rng().gen_range(1..=NODE_POOL_SIZE);
        format!("node-{:02}", node)
    }
}
