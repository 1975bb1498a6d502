use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::settings::DatabaseSettings;
use crate::core::summary::{self, ResourceSummary};
use crate::core::vm::{ListOptions, VMStatus, VirtualMachine, VmStats};
use crate::errors::VmResult;

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryVmRepository;
pub use sqlite::SqliteVmRepository;

/// Persistence contract for VM records.
///
/// Soft-deleted rows are invisible to every method. Missing rows come back as
/// `NotFound`, driver failures as `Storage` tagged with the operation name.
#[async_trait]
pub trait VmRepository: Send + Sync {
    async fn create(&self, vm: &VirtualMachine) -> VmResult<()>;

    async fn get_by_id(&self, id: Uuid) -> VmResult<VirtualMachine>;

    async fn get_by_name(&self, name: &str) -> VmResult<VirtualMachine>;

    /// Saves every mutable column of `vm`.
    async fn update(&self, vm: &VirtualMachine) -> VmResult<()>;

    /// Soft delete.
    async fn delete(&self, id: Uuid) -> VmResult<()>;

    /// One page of matches plus the total match count.
    async fn list(&self, opts: &ListOptions) -> VmResult<(Vec<VirtualMachine>, u64)>;

    /// Unconditional status write, stamping `started_at` / `stopped_at` the
    /// same way [`VirtualMachine::apply_status`] does.
    async fn update_status(&self, id: Uuid, status: VMStatus) -> VmResult<()>;

    async fn update_stats(&self, id: Uuid, stats: &VmStats) -> VmResult<()>;

    async fn exists_by_name(&self, name: &str) -> VmResult<bool>;

    async fn count(&self) -> VmResult<u64>;

    async fn count_by_status(&self, status: VMStatus) -> VmResult<u64>;

    async fn get_by_node_id(&self, node_id: &str) -> VmResult<Vec<VirtualMachine>>;

    async fn list_all(&self) -> VmResult<Vec<VirtualMachine>>;

    async fn get_resource_summary(&self) -> VmResult<ResourceSummary> {
        let vms = self.list_all().await?;
        Ok(summary::aggregate(&vms))
    }

    /// Cheap round trip used by the readiness probe.
    async fn ping(&self) -> VmResult<()> {
        self.count().await.map(|_| ())
    }
}

/// Picks the backend from `database.url`: empty keeps everything in memory,
/// anything else goes to SQLite.
pub async fn open(settings: &DatabaseSettings) -> VmResult<Arc<dyn VmRepository>> {
    if settings.url.trim().is_empty() {
        info!("Using in-memory VM repository");
        return Ok(Arc::new(InMemoryVmRepository::new()));
    }

    let repo = SqliteVmRepository::connect(&settings.url, settings.max_connections).await?;
    Ok(Arc::new(repo))
}
