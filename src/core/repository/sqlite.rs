use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::VmRepository;
use crate::core::vm::{ListOptions, VMStatus, VirtualMachine, VmSpec, VmStats};
use crate::errors::{VmManagerError, VmResult};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS virtual_machines (
        id                 TEXT PRIMARY KEY NOT NULL,
        name               TEXT NOT NULL,
        description        TEXT NOT NULL DEFAULT '',
        cpu_cores          INTEGER NOT NULL,
        ram_mb             INTEGER NOT NULL,
        disk_gb            INTEGER NOT NULL,
        image_name         TEXT NOT NULL,
        network_type       TEXT NOT NULL DEFAULT 'nat',
        boot_order         TEXT NOT NULL DEFAULT 'hd',
        status             TEXT NOT NULL DEFAULT 'pending',
        node_id            TEXT NOT NULL DEFAULT '',
        cpu_usage_percent  REAL NOT NULL DEFAULT 0,
        ram_usage_percent  REAL NOT NULL DEFAULT 0,
        disk_usage_percent REAL NOT NULL DEFAULT 0,
        network_rx_bytes   INTEGER NOT NULL DEFAULT 0,
        network_tx_bytes   INTEGER NOT NULL DEFAULT 0,
        uptime_seconds     INTEGER NOT NULL DEFAULT 0,
        last_stats_update  TEXT,
        labels             TEXT NOT NULL DEFAULT '{}',
        annotations        TEXT NOT NULL DEFAULT '{}',
        created_at         TEXT NOT NULL,
        updated_at         TEXT NOT NULL,
        deleted_at         TEXT,
        started_at         TEXT,
        stopped_at         TEXT,
        created_by         TEXT NOT NULL DEFAULT '',
        updated_by         TEXT NOT NULL DEFAULT ''
    )
    "#,
    // Soft-deleted rows must not block a name from being reused.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_vms_live_name ON virtual_machines(name) WHERE deleted_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_vms_status ON virtual_machines(status)",
    "CREATE INDEX IF NOT EXISTS idx_vms_node_id ON virtual_machines(node_id)",
    "CREATE INDEX IF NOT EXISTS idx_vms_deleted_at ON virtual_machines(deleted_at)",
];

const SELECT_VM: &str = "SELECT * FROM virtual_machines";

/// sqlx-backed repository. Works with any `sqlite:` URL, including
/// `sqlite::memory:` for throwaway runs.
#[derive(Debug, Clone)]
pub struct SqliteVmRepository {
    pool: SqlitePool,
}

impl SqliteVmRepository {
    pub async fn connect(url: &str, max_connections: u32) -> VmResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| VmManagerError::storage("parse database url", e))?
            .create_if_missing(true);

        // Every connection to :memory: gets its own database, so pin one and never recycle it.
        let in_memory = url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| VmManagerError::storage("connect", e))?;

        let repo = Self { pool };
        repo.migrate().await?;
        info!("SQLite repository ready (in_memory: {})", in_memory);
        Ok(repo)
    }

    async fn migrate(&self) -> VmResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| VmManagerError::storage("migrate schema", e))?;
        }
        debug!("Schema migrated");
        Ok(())
    }

    async fn fetch_one_where(
        &self,
        operation: &'static str,
        clause: &str,
        value: String,
    ) -> VmResult<Option<VirtualMachine>> {
        let sql = format!("{} WHERE {} AND deleted_at IS NULL", SELECT_VM, clause);
        let row = sqlx::query_as::<Sqlite, VmRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VmManagerError::storage(operation, e))?;
        row.map(VmRow::into_vm).transpose()
    }

    async fn fetch_many_where(
        &self,
        operation: &'static str,
        clause: &str,
        value: Option<String>,
    ) -> VmResult<Vec<VirtualMachine>> {
        let sql = format!("{} WHERE {} AND deleted_at IS NULL", SELECT_VM, clause);
        let mut query = sqlx::query_as::<Sqlite, VmRow>(&sql);
        if let Some(value) = value {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VmManagerError::storage(operation, e))?;
        rows.into_iter().map(VmRow::into_vm).collect()
    }

    async fn count_where(&self, operation: &'static str, clause: &str, value: Option<String>) -> VmResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM virtual_machines WHERE {} AND deleted_at IS NULL",
            clause
        );
        let mut query = sqlx::query_scalar::<Sqlite, i64>(&sql);
        if let Some(value) = value {
            query = query.bind(value);
        }
        let count = query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| VmManagerError::storage(operation, e))?;
        Ok(count.max(0) as u64)
    }
}

/// Maps a unique index hit to `AlreadyExists`, everything else to `Storage`.
fn write_error(operation: &'static str, name: &str, err: sqlx::Error) -> VmManagerError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => VmManagerError::vm_exists(name),
        _ => VmManagerError::storage(operation, err),
    }
}

fn encode_map(operation: &'static str, map: &BTreeMap<String, String>) -> VmResult<String> {
    serde_json::to_string(map).map_err(|e| VmManagerError::storage(operation, e))
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, opts: &ListOptions) {
    qb.push(" WHERE deleted_at IS NULL");
    if let Some(status) = opts.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(node) = opts.node_id.clone().filter(|n| !n.is_empty()) {
        qb.push(" AND node_id = ").push_bind(node);
    }
    if let Some(creator) = opts.created_by.clone().filter(|c| !c.is_empty()) {
        qb.push(" AND created_by = ").push_bind(creator);
    }
    if let Some(term) = opts.search_term() {
        let pattern = format!("%{}%", escape_like(&term.to_lowercase()));
        qb.push(" AND (LOWER(name) LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR LOWER(description) LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl VmRepository for SqliteVmRepository {
    async fn create(&self, vm: &VirtualMachine) -> VmResult<()> {
        let labels = encode_map("create VM", &vm.labels)?;
        let annotations = encode_map("create VM", &vm.annotations)?;

        sqlx::query(
            r#"
            INSERT INTO virtual_machines (
                id, name, description, cpu_cores, ram_mb, disk_gb, image_name,
                network_type, boot_order, status, node_id,
                cpu_usage_percent, ram_usage_percent, disk_usage_percent,
                network_rx_bytes, network_tx_bytes, uptime_seconds, last_stats_update,
                labels, annotations, created_at, updated_at, deleted_at,
                started_at, stopped_at, created_by, updated_by
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(vm.id.to_string())
        .bind(&vm.name)
        .bind(&vm.description)
        .bind(i64::from(vm.spec.cpu_cores))
        .bind(i64::from(vm.spec.ram_mb))
        .bind(i64::from(vm.spec.disk_gb))
        .bind(&vm.spec.image_name)
        .bind(vm.spec.network_type.as_str())
        .bind(&vm.spec.boot_order)
        .bind(vm.status.as_str())
        .bind(&vm.node_id)
        .bind(vm.stats.cpu_usage_percent)
        .bind(vm.stats.ram_usage_percent)
        .bind(vm.stats.disk_usage_percent)
        .bind(clamp_i64(vm.stats.network_rx_bytes))
        .bind(clamp_i64(vm.stats.network_tx_bytes))
        .bind(clamp_i64(vm.stats.uptime_seconds))
        .bind(vm.stats.last_stats_update)
        .bind(labels)
        .bind(annotations)
        .bind(vm.created_at)
        .bind(vm.updated_at)
        .bind(vm.deleted_at)
        .bind(vm.started_at)
        .bind(vm.stopped_at)
        .bind(&vm.created_by)
        .bind(&vm.updated_by)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("create VM", &vm.name, e))?;

        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> VmResult<VirtualMachine> {
        self.fetch_one_where("get VM by ID", "id = ?", id.to_string())
            .await?
            .ok_or_else(|| VmManagerError::vm_not_found(id))
    }

    async fn get_by_name(&self, name: &str) -> VmResult<VirtualMachine> {
        self.fetch_one_where("get VM by name", "name = ?", name.to_string())
            .await?
            .ok_or_else(|| VmManagerError::vm_not_found(name))
    }

    async fn update(&self, vm: &VirtualMachine) -> VmResult<()> {
        let labels = encode_map("update VM", &vm.labels)?;
        let annotations = encode_map("update VM", &vm.annotations)?;

        let result = sqlx::query(
            r#"
            UPDATE virtual_machines SET
                name = ?, description = ?, cpu_cores = ?, ram_mb = ?, disk_gb = ?,
                image_name = ?, network_type = ?, boot_order = ?, status = ?, node_id = ?,
                cpu_usage_percent = ?, ram_usage_percent = ?, disk_usage_percent = ?,
                network_rx_bytes = ?, network_tx_bytes = ?, uptime_seconds = ?,
                last_stats_update = ?, labels = ?, annotations = ?, updated_at = ?,
                started_at = ?, stopped_at = ?, updated_by = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&vm.name)
        .bind(&vm.description)
        .bind(i64::from(vm.spec.cpu_cores))
        .bind(i64::from(vm.spec.ram_mb))
        .bind(i64::from(vm.spec.disk_gb))
        .bind(&vm.spec.image_name)
        .bind(vm.spec.network_type.as_str())
        .bind(&vm.spec.boot_order)
        .bind(vm.status.as_str())
        .bind(&vm.node_id)
        .bind(vm.stats.cpu_usage_percent)
        .bind(vm.stats.ram_usage_percent)
        .bind(vm.stats.disk_usage_percent)
        .bind(clamp_i64(vm.stats.network_rx_bytes))
        .bind(clamp_i64(vm.stats.network_tx_bytes))
        .bind(clamp_i64(vm.stats.uptime_seconds))
        .bind(vm.stats.last_stats_update)
        .bind(labels)
        .bind(annotations)
        .bind(Utc::now())
        .bind(vm.started_at)
        .bind(vm.stopped_at)
        .bind(&vm.updated_by)
        .bind(vm.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| write_error("update VM", &vm.name, e))?;

        if result.rows_affected() == 0 {
            return Err(VmManagerError::vm_not_found(vm.id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> VmResult<()> {
        let result = sqlx::query(
            "UPDATE virtual_machines SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| VmManagerError::storage("delete VM", e))?;

        if result.rows_affected() == 0 {
            return Err(VmManagerError::vm_not_found(id));
        }
        Ok(())
    }

    async fn list(&self, opts: &ListOptions) -> VmResult<(Vec<VirtualMachine>, u64)> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM virtual_machines");
        push_filters(&mut count_qb, opts);
        let total: i64 = count_qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| VmManagerError::storage("count VMs", e))?;

        let mut qb = QueryBuilder::<Sqlite>::new(SELECT_VM);
        push_filters(&mut qb, opts);
        // Column and direction come from closed enums, never from user text.
        qb.push(format!(
            " ORDER BY {col} {dir}, id {dir} LIMIT ",
            col = opts.sort_by.column(),
            dir = opts.sort_order.sql()
        ));
        qb.push_bind(i64::from(opts.limit))
            .push(" OFFSET ")
            .push_bind(clamp_i64(opts.offset()));

        let rows = qb
            .build_query_as::<VmRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VmManagerError::storage("list VMs", e))?;

        let vms = rows
            .into_iter()
            .map(VmRow::into_vm)
            .collect::<VmResult<Vec<_>>>()?;
        Ok((vms, total.max(0) as u64))
    }

    async fn update_status(&self, id: Uuid, status: VMStatus) -> VmResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE virtual_machines SET
                started_at = CASE
                    WHEN ? = 'running' AND (status != 'suspended' OR started_at IS NULL) THEN ?
                    ELSE started_at END,
                stopped_at = CASE WHEN ? = 'stopped' THEN ? ELSE stopped_at END,
                uptime_seconds = CASE WHEN ? = 'running' THEN uptime_seconds ELSE 0 END,
                status = ?,
                updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(status.as_str())
        .bind(now)
        .bind(status.as_str())
        .bind(status.as_str())
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| VmManagerError::storage("update VM status", e))?;

        if result.rows_affected() == 0 {
            return Err(VmManagerError::vm_not_found(id));
        }
        Ok(())
    }

    async fn update_stats(&self, id: Uuid, stats: &VmStats) -> VmResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE virtual_machines SET
                cpu_usage_percent = ?, ram_usage_percent = ?, disk_usage_percent = ?,
                network_rx_bytes = ?, network_tx_bytes = ?, uptime_seconds = ?,
                last_stats_update = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(stats.cpu_usage_percent)
        .bind(stats.ram_usage_percent)
        .bind(stats.disk_usage_percent)
        .bind(clamp_i64(stats.network_rx_bytes))
        .bind(clamp_i64(stats.network_tx_bytes))
        .bind(clamp_i64(stats.uptime_seconds))
        .bind(stats.last_stats_update)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| VmManagerError::storage("update VM stats", e))?;

        if result.rows_affected() == 0 {
            return Err(VmManagerError::vm_not_found(id));
        }
        Ok(())
    }

    async fn exists_by_name(&self, name: &str) -> VmResult<bool> {
        let count = self
            .count_where("check VM name", "name = ?", Some(name.to_string()))
            .await?;
        Ok(count > 0)
    }

    async fn count(&self) -> VmResult<u64> {
        self.count_where("count VMs", "1 = 1", None).await
    }

    async fn count_by_status(&self, status: VMStatus) -> VmResult<u64> {
        self.count_where(
            "count VMs by status",
            "status = ?",
            Some(status.as_str().to_string()),
        )
        .await
    }

    async fn get_by_node_id(&self, node_id: &str) -> VmResult<Vec<VirtualMachine>> {
        self.fetch_many_where("get VMs by node", "node_id = ?", Some(node_id.to_string()))
            .await
    }

    async fn list_all(&self) -> VmResult<Vec<VirtualMachine>> {
        self.fetch_many_where("list all VMs", "1 = 1", None).await
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VmRow {
    id: String,
    name: String,
    description: String,
    cpu_cores: i64,
    ram_mb: i64,
    disk_gb: i64,
    image_name: String,
    network_type: String,
    boot_order: String,
    status: String,
    node_id: String,
    cpu_usage_percent: f64,
    ram_usage_percent: f64,
    disk_usage_percent: f64,
    network_rx_bytes: i64,
    network_tx_bytes: i64,
    uptime_seconds: i64,
    last_stats_update: Option<DateTime<Utc>>,
    labels: String,
    annotations: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    created_by: String,
    updated_by: String,
}

fn corrupt(column: &'static str) -> impl Fn(String) -> VmManagerError {
    move |detail| {
        VmManagerError::storage(
            "decode VM row",
            format!("column {}: {}", column, detail),
        )
    }
}

fn to_u32(column: &'static str, value: i64) -> VmResult<u32> {
    u32::try_from(value).map_err(|e| corrupt(column)(e.to_string()))
}

fn decode_map(column: &'static str, raw: &str) -> VmResult<BTreeMap<String, String>> {
    if raw.is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(raw).map_err(|e| corrupt(column)(e.to_string()))
}

impl VmRow {
    fn into_vm(self) -> VmResult<VirtualMachine> {
        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt("id")(e.to_string()))?;
        let status = self
            .status
            .parse::<VMStatus>()
            .map_err(|e| corrupt("status")(e.to_string()))?;
        let network_type = self
            .network_type
            .parse()
            .map_err(|e: VmManagerError| corrupt("network_type")(e.to_string()))?;

        Ok(VirtualMachine {
            id,
            name: self.name,
            description: self.description,
            spec: VmSpec {
                cpu_cores: to_u32("cpu_cores", self.cpu_cores)?,
                ram_mb: to_u32("ram_mb", self.ram_mb)?,
                disk_gb: to_u32("disk_gb", self.disk_gb)?,
                image_name: self.image_name,
                network_type,
                boot_order: self.boot_order,
            },
            status,
            node_id: self.node_id,
            stats: VmStats {
                cpu_usage_percent: self.cpu_usage_percent,
                ram_usage_percent: self.ram_usage_percent,
                disk_usage_percent: self.disk_usage_percent,
                network_rx_bytes: self.network_rx_bytes.max(0) as u64,
                network_tx_bytes: self.network_tx_bytes.max(0) as u64,
                uptime_seconds: self.uptime_seconds.max(0) as u64,
                last_stats_update: self.last_stats_update,
            },
            labels: decode_map("labels", &self.labels)?,
            annotations: decode_map("annotations", &self.annotations)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            created_by: self.created_by,
            updated_by: self.updated_by,
        })
    }
}
