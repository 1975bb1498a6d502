use std::fmt;
use thiserror::Error;

use crate::core::vm::VMStatus;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum VmManagerError {
    #[error("Validation failed: {details}")]
    ValidationFailed {
        details: String,
    },

    #[error("{resource} '{name}' already exists")]
    AlreadyExists {
        resource: &'static str,
        name: String,
    },

    #[error("{resource} '{id}' not found")]
    NotFound {
        resource: &'static str,
        id: String,
    },

    #[error("VM {vm_id} is in state {current}, but operation requires {required}")]
    InvalidVmState {
        vm_id: String,
        current: VMStatus,
        required: RequiredState,
    },

    #[error("Requested {resource} ({requested}) exceeds limit ({limit})")]
    ResourceExceeded {
        resource: ResourceType,
        requested: u64,
        limit: u64,
    },

    #[error("Database error during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// What an operation needed when it was refused: either a set of eligible
/// statuses or a single transition target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredState(pub Vec<VMStatus>);

impl From<VMStatus> for RequiredState {
    fn from(status: VMStatus) -> Self {
        RequiredState(vec![status])
    }
}

impl From<&[VMStatus]> for RequiredState {
    fn from(statuses: &[VMStatus]) -> Self {
        RequiredState(statuses.to_vec())
    }
}

impl fmt::Display for RequiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|s| s.as_str()).collect();
        write!(f, "{}", names.join(" or "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Cpu,
    Memory,
    Storage,
    Vms,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cpu => write!(f, "CPU cores"),
            ResourceType::Memory => write!(f, "RAM MB"),
            ResourceType::Storage => write!(f, "Disk GB"),
            ResourceType::Vms => write!(f, "VMs"),
        }
    }
}

impl VmManagerError {
    pub fn validation(details: impl Into<String>) -> Self {
        VmManagerError::ValidationFailed {
            details: details.into(),
        }
    }

    pub fn vm_not_found(id: impl ToString) -> Self {
        VmManagerError::NotFound {
            resource: "VM",
            id: id.to_string(),
        }
    }

    pub fn vm_exists(name: impl Into<String>) -> Self {
        VmManagerError::AlreadyExists {
            resource: "VM",
            name: name.into(),
        }
    }

    pub fn invalid_state(
        vm_id: impl ToString,
        current: VMStatus,
        required: impl Into<RequiredState>,
    ) -> Self {
        VmManagerError::InvalidVmState {
            vm_id: vm_id.to_string(),
            current,
            required: required.into(),
        }
    }

    pub fn storage<E>(operation: &'static str, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        VmManagerError::Storage {
            operation,
            source: source.into(),
        }
    }

    /// Stable machine-readable code shown to clients.
    pub fn code(&self) -> &'static str {
        match self {
            VmManagerError::ValidationFailed { .. } => "VALIDATION_FAILED",
            VmManagerError::AlreadyExists { .. } => "ALREADY_EXISTS",
            VmManagerError::NotFound { .. } => "NOT_FOUND",
            VmManagerError::InvalidVmState { .. } => "INVALID_VM_STATE",
            VmManagerError::ResourceExceeded { .. } => "RESOURCE_EXCEEDED",
            VmManagerError::Storage { .. } => "DATABASE_ERROR",
            VmManagerError::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    /// True for failures whose text may leak driver internals.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            VmManagerError::Storage { .. } | VmManagerError::Unknown(_)
        )
    }
}

impl From<validator::ValidationErrors> for VmManagerError {
    fn from(errors: validator::ValidationErrors) -> Self {
        VmManagerError::validation(errors.to_string())
    }
}

pub type VmResult<T> = Result<T, VmManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_reports_current_and_required() {
        let err = VmManagerError::invalid_state("vm-1", VMStatus::Running, VMStatus::Stopped);
        assert_eq!(err.code(), "INVALID_VM_STATE");
        assert_eq!(
            err.to_string(),
            "VM vm-1 is in state running, but operation requires stopped"
        );
    }

    #[test]
    fn required_state_lists_alternatives() {
        let required = RequiredState::from(&[VMStatus::Running, VMStatus::Starting][..]);
        assert_eq!(required.to_string(), "running or starting");
    }

    #[test]
    fn storage_errors_are_internal() {
        let err = VmManagerError::storage("get VM by ID", "disk on fire");
        assert!(err.is_internal());
        assert_eq!(err.code(), "DATABASE_ERROR");
        assert!(!VmManagerError::vm_not_found("x").is_internal());
    }

    #[test]
    fn resource_error_message() {
        let err = VmManagerError::ResourceExceeded {
            resource: ResourceType::Cpu,
            requested: 65,
            limit: 64,
        };
        assert_eq!(err.to_string(), "Requested CPU cores (65) exceeds limit (64)");
    }
}
