use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::core::vm::{VMStatus, VirtualMachine};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSummary {
    pub vms: VmCounts,
    pub resources: Resources,
    pub nodes: NodeCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VmCounts {
    pub total: u64,
    pub running: u64,
    pub stopped: u64,
    pub error: u64,
    pub suspended: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Resources {
    pub cpu: ResourceUsage,
    pub ram_mb: ResourceUsage,
    pub disk_gb: ResourceUsage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub usage_percent: f64,
}

impl ResourceUsage {
    fn new(total: u64, used: u64) -> Self {
        Self {
            total,
            used,
            available: total.saturating_sub(used),
            usage_percent: usage_percent(used, total),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounts {
    pub total: u64,
    // No liveness signal exists, so this mirrors `total`.
    pub active: u64,
}

/// Percentage rounded to two decimals; zero when there is nothing to divide by.
pub fn usage_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = used as f64 / total as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

/// Fleet-wide counts and utilization. "Used" only counts running VMs.
pub fn aggregate<'a, I>(vms: I) -> ResourceSummary
where
    I: IntoIterator<Item = &'a VirtualMachine>,
{
    let mut counts = VmCounts::default();
    let (mut cpu_total, mut cpu_used) = (0u64, 0u64);
    let (mut ram_total, mut ram_used) = (0u64, 0u64);
    let (mut disk_total, mut disk_used) = (0u64, 0u64);
    let mut nodes = BTreeSet::new();

    for vm in vms.into_iter().filter(|vm| !vm.is_deleted()) {
        counts.total += 1;
        match vm.status {
            VMStatus::Running => counts.running += 1,
            VMStatus::Stopped => counts.stopped += 1,
            VMStatus::Error => counts.error += 1,
            VMStatus::Suspended => counts.suspended += 1,
            _ => {}
        }

        let (cpu, ram, disk) = (
            u64::from(vm.spec.cpu_cores),
            u64::from(vm.spec.ram_mb),
            u64::from(vm.spec.disk_gb),
        );
        cpu_total += cpu;
        ram_total += ram;
        disk_total += disk;
        if vm.status == VMStatus::Running {
            cpu_used += cpu;
            ram_used += ram;
            disk_used += disk;
        }

        if !vm.node_id.is_empty() {
            nodes.insert(vm.node_id.as_str());
        }
    }

    let node_count = nodes.len() as u64;
    ResourceSummary {
        vms: counts,
        resources: Resources {
            cpu: ResourceUsage::new(cpu_total, cpu_used),
            ram_mb: ResourceUsage::new(ram_total, ram_used),
            disk_gb: ResourceUsage::new(disk_total, disk_used),
        },
        nodes: NodeCounts {
            total: node_count,
            active: node_count,
        },
        generated_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vm::CreateVmRequest;
    use std::collections::BTreeMap;

    fn vm(name: &str, cpu: u32, status: VMStatus, node: &str) -> VirtualMachine {
        let req = CreateVmRequest {
            name: name.into(),
            description: String::new(),
            cpu_cores: cpu,
            ram_mb: 1024 * cpu,
            disk_gb: 10 * cpu,
            image_name: "debian:12".into(),
            network_type: None,
            boot_order: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            created_by: "tester".into(),
        };
        let mut vm = VirtualMachine::from_request(req, node.into(), Utc::now());
        vm.status = status;
        vm
    }

    #[test]
    fn only_running_vms_count_as_used() {
        let vms = [
            vm("small", 2, VMStatus::Stopped, "node-01"),
            vm("large", 4, VMStatus::Running, "node-02"),
        ];
        let summary = aggregate(&vms);

        assert_eq!(summary.resources.cpu.total, 6);
        assert_eq!(summary.resources.cpu.used, 4);
        assert_eq!(summary.resources.cpu.available, 2);
        assert!((summary.resources.cpu.usage_percent - 66.67).abs() < 0.01);
        assert_eq!(summary.resources.ram_mb.total, 6 * 1024);
        assert_eq!(summary.vms.running, 1);
        assert_eq!(summary.vms.stopped, 1);
        assert_eq!(summary.vms.total, 2);
    }

    #[test]
    fn empty_fleet_has_zero_usage() {
        let summary = aggregate(std::iter::empty());
        assert_eq!(summary.resources.cpu.usage_percent, 0.0);
        assert_eq!(summary.resources.disk_gb.usage_percent, 0.0);
        assert_eq!(summary.nodes.total, 0);
    }

    #[test]
    fn deleted_vms_and_blank_nodes_are_ignored() {
        let mut gone = vm("gone", 8, VMStatus::Stopped, "node-03");
        gone.deleted_at = Some(Utc::now());
        let vms = [
            vm("a", 1, VMStatus::Pending, "node-01"),
            vm("b", 1, VMStatus::Suspended, "node-01"),
            vm("c", 1, VMStatus::Error, ""),
            gone,
        ];
        let summary = aggregate(&vms);

        assert_eq!(summary.vms.total, 3);
        assert_eq!(summary.vms.suspended, 1);
        assert_eq!(summary.vms.error, 1);
        assert_eq!(summary.resources.cpu.total, 3);
        assert_eq!(summary.nodes.total, 1);
        assert_eq!(summary.nodes.active, summary.nodes.total);
    }
}
