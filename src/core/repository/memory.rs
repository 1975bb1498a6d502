use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::VmRepository;
use crate::core::vm::{ListOptions, SortField, SortOrder, VMStatus, VirtualMachine, VmStats};
use crate::errors::{VmManagerError, VmResult};

/// Keeps every VM in a map. Good for tests, demos, and people who trust RAM.
#[derive(Debug, Default)]
pub struct InMemoryVmRepository {
    vms: RwLock<HashMap<Uuid, VirtualMachine>>,
}

impl InMemoryVmRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(vms: &HashMap<Uuid, VirtualMachine>) -> impl Iterator<Item = &VirtualMachine> {
        vms.values().filter(|vm| !vm.is_deleted())
    }

    fn name_taken(vms: &HashMap<Uuid, VirtualMachine>, name: &str, except: Option<Uuid>) -> bool {
        Self::live(vms).any(|vm| vm.name == name && Some(vm.id) != except)
    }
}

fn matches(vm: &VirtualMachine, opts: &ListOptions) -> bool {
    if let Some(status) = opts.status {
        if vm.status != status {
            return false;
        }
    }
    if let Some(node) = opts.node_id.as_deref().filter(|n| !n.is_empty()) {
        if vm.node_id != node {
            return false;
        }
    }
    if let Some(creator) = opts.created_by.as_deref().filter(|c| !c.is_empty()) {
        if vm.created_by != creator {
            return false;
        }
    }
    if let Some(term) = opts.search_term() {
        let term = term.to_lowercase();
        if !vm.name.to_lowercase().contains(&term)
            && !vm.description.to_lowercase().contains(&term)
        {
            return false;
        }
    }
    true
}

fn compare(a: &VirtualMachine, b: &VirtualMachine, field: SortField) -> Ordering {
    let primary = match field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortField::Name => a.name.cmp(&b.name),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
    };
    primary.then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl VmRepository for InMemoryVmRepository {
    async fn create(&self, vm: &VirtualMachine) -> VmResult<()> {
        let mut vms = self.vms.write().await;
        if Self::name_taken(&vms, &vm.name, None) {
            return Err(VmManagerError::vm_exists(&vm.name));
        }
        vms.insert(vm.id, vm.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> VmResult<VirtualMachine> {
        let vms = self.vms.read().await;
        vms.get(&id)
            .filter(|vm| !vm.is_deleted())
            .cloned()
            .ok_or_else(|| VmManagerError::vm_not_found(id))
    }

    async fn get_by_name(&self, name: &str) -> VmResult<VirtualMachine> {
        let vms = self.vms.read().await;
        let found = Self::live(&vms).find(|vm| vm.name == name).cloned();
        found.ok_or_else(|| VmManagerError::vm_not_found(name))
    }

    async fn update(&self, vm: &VirtualMachine) -> VmResult<()> {
        let mut vms = self.vms.write().await;
        if Self::name_taken(&vms, &vm.name, Some(vm.id)) {
            return Err(VmManagerError::vm_exists(&vm.name));
        }
        match vms.get_mut(&vm.id).filter(|stored| !stored.is_deleted()) {
            Some(stored) => {
                *stored = vm.clone();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => Err(VmManagerError::vm_not_found(vm.id)),
        }
    }

    async fn delete(&self, id: Uuid) -> VmResult<()> {
        let mut vms = self.vms.write().await;
        match vms.get_mut(&id).filter(|vm| !vm.is_deleted()) {
            Some(vm) => {
                vm.deleted_at = Some(Utc::now());
                Ok(())
            }
            None => Err(VmManagerError::vm_not_found(id)),
        }
    }

    async fn list(&self, opts: &ListOptions) -> VmResult<(Vec<VirtualMachine>, u64)> {
        let vms = self.vms.read().await;
        let mut found: Vec<&VirtualMachine> =
            Self::live(&vms).filter(|vm| matches(vm, opts)).collect();
        let total = found.len() as u64;

        found.sort_by(|a, b| {
            let ord = compare(a, b, opts.sort_by);
            match opts.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let page = found
            .into_iter()
            .skip(opts.offset() as usize)
            .take(opts.limit as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn update_status(&self, id: Uuid, status: VMStatus) -> VmResult<()> {
        let mut vms = self.vms.write().await;
        match vms.get_mut(&id).filter(|vm| !vm.is_deleted()) {
            Some(vm) => {
                vm.apply_status(status, Utc::now());
                Ok(())
            }
            None => Err(VmManagerError::vm_not_found(id)),
        }
    }

    async fn update_stats(&self, id: Uuid, stats: &VmStats) -> VmResult<()> {
        let mut vms = self.vms.write().await;
        match vms.get_mut(&id).filter(|vm| !vm.is_deleted()) {
            Some(vm) => {
                vm.stats = stats.clone();
                vm.updated_at = Utc::now();
                Ok(())
            }
            None => Err(VmManagerError::vm_not_found(id)),
        }
    }

    async fn exists_by_name(&self, name: &str) -> VmResult<bool> {
        let vms = self.vms.read().await;
        Ok(Self::name_taken(&vms, name, None))
    }

    async fn count(&self) -> VmResult<u64> {
        let vms = self.vms.read().await;
        Ok(Self::live(&vms).count() as u64)
    }

    async fn count_by_status(&self, status: VMStatus) -> VmResult<u64> {
        let vms = self.vms.read().await;
        Ok(Self::live(&vms).filter(|vm| vm.status == status).count() as u64)
    }

    async fn get_by_node_id(&self, node_id: &str) -> VmResult<Vec<VirtualMachine>> {
        let vms = self.vms.read().await;
        Ok(Self::live(&vms)
            .filter(|vm| vm.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> VmResult<Vec<VirtualMachine>> {
        let vms = self.vms.read().await;
        Ok(Self::live(&vms).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vm::CreateVmRequest;
    use std::collections::BTreeMap;

    fn vm(name: &str, description: &str, node: &str) -> VirtualMachine {
        let req = CreateVmRequest {
            name: name.into(),
            description: description.into(),
            cpu_cores: 2,
            ram_mb: 2048,
            disk_gb: 20,
            image_name: "ubuntu:22.04".into(),
            network_type: None,
            boot_order: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_by: "tester".into(),
        };
        VirtualMachine::from_request(req, node.into(), Utc::now())
    }

    #[tokio::test]
    async fn soft_deleted_names_can_be_reused() {
        let repo = InMemoryVmRepository::new();
        let first = vm("db-01", "", "node-01");
        repo.create(&first).await.unwrap();

        let dup = repo.create(&vm("db-01", "", "node-02")).await.unwrap_err();
        assert_eq!(dup.code(), "ALREADY_EXISTS");

        repo.delete(first.id).await.unwrap();
        assert!(!repo.exists_by_name("db-01").await.unwrap());
        assert_eq!(repo.get_by_id(first.id).await.unwrap_err().code(), "NOT_FOUND");
        repo.create(&vm("db-01", "", "node-02")).await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_sorts_and_pages() {
        let repo = InMemoryVmRepository::new();
        for (name, desc, node) in [
            ("alpha", "web frontend", "node-01"),
            ("bravo", "database", "node-02"),
            ("charlie", "WEB backend", "node-01"),
        ] {
            repo.create(&vm(name, desc, node)).await.unwrap();
        }

        let opts = ListOptions {
            search: Some("web".into()),
            sort_by: SortField::Name,
            sort_order: SortOrder::Asc,
            ..Default::default()
        };
        let (items, total) = repo.list(&opts).await.unwrap();
        assert_eq!(total, 2);
        let names: Vec<_> = items.iter().map(|vm| vm.name.as_str()).collect();
        assert_eq!(names, ["alpha", "charlie"]);

        let paged = ListOptions {
            limit: 1,
            page: 2,
            node_id: Some("node-01".into()),
            sort_by: SortField::Name,
            sort_order: SortOrder::Desc,
            ..Default::default()
        };
        let (items, total) = repo.list(&paged).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "alpha");
    }

    #[tokio::test]
    async fn update_status_stamps_timestamps() {
        let repo = InMemoryVmRepository::new();
        let created = vm("ts-vm", "", "node-01");
        repo.create(&created).await.unwrap();

        repo.update_status(created.id, VMStatus::Stopped).await.unwrap();
        let stopped = repo.get_by_id(created.id).await.unwrap();
        assert!(stopped.stopped_at.is_some());
        assert!(stopped.started_at.is_none());

        repo.update_status(created.id, VMStatus::Starting).await.unwrap();
        repo.update_status(created.id, VMStatus::Running).await.unwrap();
        let running = repo.get_by_id(created.id).await.unwrap();
        assert_eq!(running.status, VMStatus::Running);
        assert!(running.started_at.is_some());
    }

    #[tokio::test]
    async fn lookup_by_name_skips_deleted_rows() {
        let repo = InMemoryVmRepository::new();
        let first = vm("web-01", "", "node-01");
        repo.create(&first).await.unwrap();
        assert_eq!(repo.get_by_name("web-01").await.unwrap().id, first.id);

        repo.delete(first.id).await.unwrap();
        assert_eq!(repo.get_by_name("web-01").await.unwrap_err().code(), "NOT_FOUND");

        let second = vm("web-01", "", "node-02");
        repo.create(&second).await.unwrap();
        assert_eq!(repo.get_by_name("web-01").await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let repo = InMemoryVmRepository::new();
        let id = Uuid::new_v4();
        assert_eq!(repo.update_status(id, VMStatus::Running).await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(repo.update_stats(id, &VmStats::default()).await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(repo.delete(id).await.unwrap_err().code(), "NOT_FOUND");
    }
}
