pub mod lifecycle;
pub mod repository;
pub mod seed;
pub mod service;
pub mod stats;
pub mod summary;
pub mod vm;

// exports for lazy devs like us
pub use lifecycle::{LifecycleSimulator, TaskKind};
pub use repository::{InMemoryVmRepository, SqliteVmRepository, VmRepository};
pub use service::VmService;
pub use stats::StatsSampler;
pub use summary::ResourceSummary;
pub use vm::{VMStatus, VirtualMachine};
