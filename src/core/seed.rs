use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::vm::{NetworkType, VMStatus, VirtualMachine, VmSpec, VmStats};

struct Sample {
    name: &'static str,
    description: &'static str,
    cpu_cores: u32,
    ram_mb: u32,
    disk_gb: u32,
    image: &'static str,
    status: VMStatus,
    node: &'static str,
    owner: &'static str,
}

const SAMPLES: &[Sample] = &[
    Sample {
        name: "web-server-01",
        description: "Production web server for main application",
        cpu_cores: 4,
        ram_mb: 8192,
        disk_gb: 100,
        image: "ubuntu:22.04",
        status: VMStatus::Running,
        node: "node-01",
        owner: "system",
    },
    Sample {
        name: "database-primary",
        description: "Primary PostgreSQL database server",
        cpu_cores: 8,
        ram_mb: 16384,
        disk_gb: 500,
        image: "postgres:15",
        status: VMStatus::Running,
        node: "node-02",
        owner: "system",
    },
    Sample {
        name: "cache-server",
        description: "Redis cache server",
        cpu_cores: 2,
        ram_mb: 4096,
        disk_gb: 50,
        image: "redis:7",
        status: VMStatus::Running,
        node: "node-01",
        owner: "system",
    },
    Sample {
        name: "api-server-01",
        description: "REST API server instance 1",
        cpu_cores: 2,
        ram_mb: 4096,
        disk_gb: 50,
        image: "golang:1.21-alpine",
        status: VMStatus::Stopped,
        node: "node-03",
        owner: "system",
    },
    Sample {
        name: "monitoring-server",
        description: "Prometheus monitoring server",
        cpu_cores: 4,
        ram_mb: 8192,
        disk_gb: 200,
        image: "prom/prometheus:latest",
        status: VMStatus::Stopped,
        node: "node-04",
        owner: "system",
    },
    Sample {
        name: "test-environment",
        description: "Development and testing environment",
        cpu_cores: 1,
        ram_mb: 2048,
        disk_gb: 30,
        image: "alpine:latest",
        status: VMStatus::Stopped,
        node: "node-01",
        owner: "developer",
    },
];

/// Demo fleet for fresh development databases. Running samples pretend they
/// have been up for an hour.
pub fn sample_vms(now: DateTime<Utc>) -> Vec<VirtualMachine> {
    SAMPLES
        .iter()
        .map(|sample| {
            let running = sample.status == VMStatus::Running;
            VirtualMachine {
                id: Uuid::new_v4(),
                name: sample.name.to_string(),
                description: sample.description.to_string(),
                spec: VmSpec {
                    cpu_cores: sample.cpu_cores,
                    ram_mb: sample.ram_mb,
                    disk_gb: sample.disk_gb,
                    image_name: sample.image.to_string(),
                    network_type: NetworkType::Nat,
                    boot_order: "hd".to_string(),
                },
                status: sample.status,
                node_id: sample.node.to_string(),
                stats: VmStats {
                    uptime_seconds: if running { 3600 } else { 0 },
                    last_stats_update: running.then_some(now),
                    ..VmStats::default()
                },
                labels: BTreeMap::from([("seeded".to_string(), "true".to_string())]),
                annotations: BTreeMap::new(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
                started_at: running.then(|| now - Duration::hours(1)),
                stopped_at: None,
                created_by: sample.owner.to_string(),
                updated_by: sample.owner.to_string(),
            }
        })
        .collect()
}
