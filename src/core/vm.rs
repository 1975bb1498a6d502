use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use crate::errors::{VmManagerError, VmResult};

// Every VM walks this little state machine. No shortcuts, no teleporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VMStatus {
    Pending,
    Stopped,
    Starting,
    Running,
    Stopping,
    Suspended,
    Error,
}

impl VMStatus {
    pub const ALL: [VMStatus; 7] = [
        VMStatus::Pending,
        VMStatus::Stopped,
        VMStatus::Starting,
        VMStatus::Running,
        VMStatus::Stopping,
        VMStatus::Suspended,
        VMStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VMStatus::Pending => "pending",
            VMStatus::Stopped => "stopped",
            VMStatus::Starting => "starting",
            VMStatus::Running => "running",
            VMStatus::Stopping => "stopping",
            VMStatus::Suspended => "suspended",
            VMStatus::Error => "error",
        }
    }

    /// Statuses reachable in one step from `self`.
    pub fn allowed_next(&self) -> &'static [VMStatus] {
        use VMStatus::*;
        match self {
            Pending => &[Stopped, Starting, Error],
            Stopped => &[Starting, Pending, Error],
            Starting => &[Running, Stopped, Error],
            Running => &[Stopping, Suspended, Error],
            Stopping => &[Stopped, Error, Running],
            Suspended => &[Running, Stopped, Error],
            Error => &[Stopped, Starting],
        }
    }

    pub fn can_transition_to(&self, next: VMStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl fmt::Display for VMStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VMStatus {
    type Err = VmManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VMStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| VmManagerError::validation(format!("unknown VM status '{}'", s)))
    }
}

/// Lifecycle operations a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    Stop,
    Restart,
    Suspend,
    Resume,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Restart => "restart",
            Operation::Suspend => "suspend",
            Operation::Resume => "resume",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Eligibility: the statuses a VM must be in for this operation.
    pub fn required_statuses(&self) -> &'static [VMStatus] {
        match self {
            Operation::Start => &[VMStatus::Stopped],
            Operation::Stop => &[VMStatus::Running, VMStatus::Starting],
            Operation::Restart => &[VMStatus::Running],
            Operation::Suspend => &[VMStatus::Running],
            Operation::Resume => &[VMStatus::Suspended],
            Operation::Update => &[VMStatus::Stopped],
            Operation::Delete => &[VMStatus::Stopped],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Nat,
    Bridge,
    Host,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Nat => "nat",
            NetworkType::Bridge => "bridge",
            NetworkType::Host => "host",
        }
    }
}

impl FromStr for NetworkType {
    type Err = VmManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nat" => Ok(NetworkType::Nat),
            "bridge" => Ok(NetworkType::Bridge),
            "host" => Ok(NetworkType::Host),
            other => Err(VmManagerError::validation(format!(
                "unknown network type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub cpu_cores: u32,
    pub ram_mb: u32,
    pub disk_gb: u32,
    pub image_name: String,
    pub network_type: NetworkType,
    pub boot_order: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VmStats {
    pub cpu_usage_percent: f64,
    pub ram_usage_percent: f64,
    pub disk_usage_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub uptime_seconds: u64,
    pub last_stats_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub spec: VmSpec,
    pub status: VMStatus,
    pub node_id: String,
    pub stats: VmStats,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub updated_by: String,
}

impl VirtualMachine {
    /// Fresh VM record in `pending`, ready to be persisted.
    pub fn from_request(req: CreateVmRequest, node_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: req.name,
            description: req.description,
            spec: VmSpec {
                cpu_cores: req.cpu_cores,
                ram_mb: req.ram_mb,
                disk_gb: req.disk_gb,
                image_name: req.image_name,
                network_type: req.network_type.unwrap_or_default(),
                boot_order: req.boot_order.unwrap_or_else(|| "hd".to_string()),
            },
            status: VMStatus::Pending,
            node_id,
            stats: VmStats::default(),
            labels: req.labels,
            annotations: req.annotations,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            started_at: None,
            stopped_at: None,
            updated_by: req.created_by.clone(),
            created_by: req.created_by,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn can_transition_to(&self, next: VMStatus) -> bool {
        self.status.can_transition_to(next)
    }

    pub fn can_perform(&self, op: Operation) -> bool {
        op.required_statuses().contains(&self.status)
    }

    pub fn ensure_can_perform(&self, op: Operation) -> VmResult<()> {
        if self.can_perform(op) {
            Ok(())
        } else {
            Err(VmManagerError::invalid_state(
                self.id,
                self.status,
                op.required_statuses(),
            ))
        }
    }

    pub fn ensure_transition(&self, next: VMStatus) -> VmResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(VmManagerError::invalid_state(self.id, self.status, next))
        }
    }

    /// Seconds since `started_at` while running, zero otherwise.
    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> u64 {
        match (self.status, self.started_at) {
            (VMStatus::Running, Some(started)) => (now - started).num_seconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Writes a new status along with the timestamps it implies.
    pub fn apply_status(&mut self, status: VMStatus, now: DateTime<Utc>) {
        match status {
            VMStatus::Running => {
                if self.status != VMStatus::Suspended || self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            VMStatus::Stopped => self.stopped_at = Some(now),
            _ => {}
        }
        if status != VMStatus::Running {
            self.stats.uptime_seconds = 0;
        }
        self.status = status;
        self.updated_at = now;
    }
}

/// VM as returned to clients, with the derived uptime.
#[derive(Debug, Clone, Serialize)]
pub struct VmResponse {
    #[serde(flatten)]
    pub vm: VirtualMachine,
    pub uptime_seconds: u64,
}

impl VmResponse {
    pub fn new(vm: VirtualMachine, now: DateTime<Utc>) -> Self {
        let uptime_seconds = vm.uptime_seconds(now);
        Self { vm, uptime_seconds }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateVmRequest {
    #[validate(length(min = 3, max = 63))]
    pub name: String,
    #[validate(length(max = 1000))]
    #[serde(default)]
    pub description: String,
    #[validate(range(min = 1, max = 64))]
    pub cpu_cores: u32,
    #[validate(range(min = 512, max = 524288))]
    pub ram_mb: u32,
    #[validate(range(min = 10, max = 10240))]
    pub disk_gb: u32,
    #[validate(length(min = 1, max = 255))]
    pub image_name: String,
    #[serde(default)]
    pub network_type: Option<NetworkType>,
    #[validate(length(max = 50))]
    #[serde(default)]
    pub boot_order: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub created_by: String,
}

/// Partial update. A zero or empty field means "leave as is", so there is
/// no way to set a field to zero through this request.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateVmRequest {
    #[validate(length(min = 3, max = 63))]
    pub name: Option<String>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
    #[validate(range(min = 1, max = 64))]
    pub cpu_cores: Option<u32>,
    #[validate(range(min = 512, max = 524288))]
    pub ram_mb: Option<u32>,
    #[validate(range(min = 10, max = 10240))]
    pub disk_gb: Option<u32>,
    pub labels: Option<BTreeMap<String, String>>,
    pub annotations: Option<BTreeMap<String, String>>,
    pub updated_by: Option<String>,
}

impl UpdateVmRequest {
    /// Folds zero/empty values into "not provided".
    pub fn normalized(self) -> Self {
        Self {
            name: self.name.filter(|n| !n.is_empty()),
            description: self.description.filter(|d| !d.is_empty()),
            cpu_cores: self.cpu_cores.filter(|v| *v > 0),
            ram_mb: self.ram_mb.filter(|v| *v > 0),
            disk_gb: self.disk_gb.filter(|v| *v > 0),
            labels: self.labels,
            annotations: self.annotations,
            updated_by: self.updated_by.filter(|u| !u.is_empty()),
        }
    }

    /// Spec the VM would have after this update.
    pub fn merged_resources(&self, current: &VmSpec) -> (u32, u32, u32) {
        (
            self.cpu_cores.unwrap_or(current.cpu_cores),
            self.ram_mb.unwrap_or(current.ram_mb),
            self.disk_gb.unwrap_or(current.disk_gb),
        )
    }

    pub fn apply_to(self, vm: &mut VirtualMachine) {
        if let Some(name) = self.name {
            vm.name = name;
        }
        if let Some(description) = self.description {
            vm.description = description;
        }
        if let Some(cpu) = self.cpu_cores {
            vm.spec.cpu_cores = cpu;
        }
        if let Some(ram) = self.ram_mb {
            vm.spec.ram_mb = ram;
        }
        if let Some(disk) = self.disk_gb {
            vm.spec.disk_gb = disk;
        }
        if let Some(labels) = self.labels {
            vm.labels = labels;
        }
        if let Some(annotations) = self.annotations {
            vm.annotations = annotations;
        }
        if let Some(updated_by) = self.updated_by {
            vm.updated_by = updated_by;
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateChangeRequest {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Name,
    Status,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Name => "name",
            SortField::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ListOptions {
    #[validate(range(min = 1))]
    #[serde(default = "default_page")]
    pub page: u32,
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub status: Option<VMStatus>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sort_by: SortField,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub include_stats: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
            status: None,
            node_id: None,
            created_by: None,
            search: None,
            sort_by: SortField::default(),
            sort_order: SortOrder::default(),
            include_stats: false,
        }
    }
}

impl ListOptions {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    /// Search term with empty strings treated as absent.
    pub fn search_term(&self) -> Option<&str> {
        self.search.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl Pagination {
    pub fn new(page: u32, limit: u32, total: u64) -> Self {
        let limit_wide = u64::from(limit.max(1));
        let total_pages = total.div_ceil(limit_wide);
        Self {
            page,
            limit,
            total,
            total_pages,
            has_next: u64::from(page) < total_pages,
            has_prev: page > 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VmListResponse {
    pub vms: Vec<VmResponse>,
    pub pagination: Pagination,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(name: &str) -> CreateVmRequest {
        CreateVmRequest {
            name: name.to_string(),
            description: String::new(),
            cpu_cores: 4,
            ram_mb: 8192,
            disk_gb: 100,
            image_name: "ubuntu:22.04".to_string(),
            network_type: None,
            boot_order: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_by: "tester".to_string(),
        }
    }

    fn vm_in(status: VMStatus) -> VirtualMachine {
        let mut vm = VirtualMachine::from_request(request("web-01"), "node-01".into(), Utc::now());
        vm.status = status;
        vm
    }

    #[test]
    fn transition_table_matches_lifecycle_rules() {
        use VMStatus::*;
        let expected: [(VMStatus, &[VMStatus]); 7] = [
            (Pending, &[Stopped, Starting, Error]),
            (Stopped, &[Starting, Pending, Error]),
            (Starting, &[Running, Stopped, Error]),
            (Running, &[Stopping, Suspended, Error]),
            (Stopping, &[Stopped, Error, Running]),
            (Suspended, &[Running, Stopped, Error]),
            (Error, &[Stopped, Starting]),
        ];

        for (from, allowed) in expected {
            for to in VMStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&to),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn rejected_transition_is_invalid_state() {
        let vm = vm_in(VMStatus::Running);
        let err = vm.ensure_transition(VMStatus::Stopped).unwrap_err();
        assert_eq!(err.code(), "INVALID_VM_STATE");
        assert!(vm.ensure_transition(VMStatus::Stopping).is_ok());
    }

    #[test]
    fn eligibility_matches_every_status_operation_pair() {
        use Operation::*;
        let ops = [Start, Stop, Restart, Suspend, Resume, Update, Delete];
        for status in VMStatus::ALL {
            let vm = vm_in(status);
            for op in ops {
                let expected = match op {
                    Start | Update | Delete => status == VMStatus::Stopped,
                    Stop => matches!(status, VMStatus::Running | VMStatus::Starting),
                    Restart | Suspend => status == VMStatus::Running,
                    Resume => status == VMStatus::Suspended,
                };
                assert_eq!(vm.can_perform(op), expected, "{} while {}", op, status);
            }
        }
    }

    #[test]
    fn start_while_running_is_refused_with_context() {
        let vm = vm_in(VMStatus::Running);
        match vm.ensure_can_perform(Operation::Start) {
            Err(VmManagerError::InvalidVmState { current, required, .. }) => {
                assert_eq!(current, VMStatus::Running);
                assert_eq!(required.0, vec![VMStatus::Stopped]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn uptime_only_counts_while_running() {
        let now = Utc::now();
        let mut vm = vm_in(VMStatus::Running);
        vm.started_at = Some(now - Duration::seconds(90));
        assert_eq!(vm.uptime_seconds(now), 90);

        vm.status = VMStatus::Suspended;
        assert_eq!(vm.uptime_seconds(now), 0);
    }

    #[test]
    fn apply_status_stamps_lifecycle_timestamps() {
        let t0 = Utc::now();
        let mut vm = vm_in(VMStatus::Starting);
        vm.apply_status(VMStatus::Running, t0);
        assert_eq!(vm.started_at, Some(t0));

        let t1 = t0 + Duration::seconds(10);
        vm.apply_status(VMStatus::Suspended, t1);
        vm.apply_status(VMStatus::Running, t1 + Duration::seconds(5));
        assert_eq!(vm.started_at, Some(t0), "resume keeps the original start");

        vm.apply_status(VMStatus::Stopping, t1);
        vm.apply_status(VMStatus::Stopped, t1);
        assert_eq!(vm.stopped_at, Some(t1));
        assert_eq!(vm.updated_at, t1);
    }

    #[test]
    fn update_request_treats_zero_as_unchanged() {
        let req = UpdateVmRequest {
            cpu_cores: Some(0),
            ram_mb: Some(16384),
            name: Some(String::new()),
            ..Default::default()
        }
        .normalized();
        assert!(req.validate().is_ok());

        let mut vm = vm_in(VMStatus::Stopped);
        assert_eq!(req.merged_resources(&vm.spec), (4, 16384, 100));
        req.apply_to(&mut vm);
        assert_eq!(vm.spec.cpu_cores, 4);
        assert_eq!(vm.spec.ram_mb, 16384);
        assert_eq!(vm.name, "web-01");
    }

    #[test]
    fn create_request_bounds() {
        assert!(request("web").validate().is_ok());
        assert!(request("ab").validate().is_err());

        let mut too_many = request("web-01");
        too_many.cpu_cores = 65;
        assert!(too_many.validate().is_err());

        let mut tiny_ram = request("web-01");
        tiny_ram.ram_mb = 511;
        assert!(tiny_ram.validate().is_err());
    }

    #[test]
    fn pagination_math() {
        let p = Pagination::new(1, 20, 45);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_next);
        assert!(!p.has_prev);

        let last = Pagination::new(3, 20, 45);
        assert!(!last.has_next);
        assert!(last.has_prev);

        let empty = Pagination::new(1, 20, 0);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);

        let exact = Pagination::new(2, 10, 20);
        assert_eq!(exact.total_pages, 2);
        assert!(!exact.has_next);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in VMStatus::ALL {
            assert_eq!(status.as_str().parse::<VMStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<VMStatus>().is_err());
    }
}
