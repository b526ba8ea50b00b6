// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for the types that cross the import workflow's persistence
//! boundary: the request record describing what to import, the status record
//! the engine mutates on every invocation, and the resource shapes exchanged
//! with the target cluster.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Recognized durable annotation keys.
///
/// Annotations carry state written by one phase and consumed by a later one,
/// possibly many invocations apart. Only the keys listed here are ever
/// written by the engine.
pub mod keys {
    /// Power state of the source VM before the import powered it off.
    /// Written at most once per import; read during compensation to decide
    /// whether the source must be started back up.
    pub const SOURCE_VM_INITIAL_STATE: &str =
        "import.gangplank.io/source-vm-initial-state";

    /// Label stamped on every resource created on behalf of an import so
    /// rollback can find what it owns.
    pub const IMPORT_TRACKER: &str = "import.gangplank.io/tracked-by";
}

/// A single step of an import itinerary.
///
/// The serialized name of each variant is stable; it is what the persisted
/// status record and the itinerary pipelines are written in terms of.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    PartialEq,
    Serialize,
    JsonSchema,
    strum::EnumIter,
)]
pub enum Phase {
    Created,
    Started,
    Prepare,
    PowerOffSource,
    CreateVM,
    CreateDataVolumes,
    ImportDisks,
    ConvertGuest,
    CleanUp,
    ImportFailed,
    RestoreInitialVMState,
    CleanUpAfterFailure,
    Completed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Created => "Created",
            Phase::Started => "Started",
            Phase::Prepare => "Prepare",
            Phase::PowerOffSource => "PowerOffSource",
            Phase::CreateVM => "CreateVM",
            Phase::CreateDataVolumes => "CreateDataVolumes",
            Phase::ImportDisks => "ImportDisks",
            Phase::ConvertGuest => "ConvertGuest",
            Phase::CleanUp => "CleanUp",
            Phase::ImportFailed => "ImportFailed",
            Phase::RestoreInitialVMState => "RestoreInitialVMState",
            Phase::CleanUpAfterFailure => "CleanUpAfterFailure",
            Phase::Completed => "Completed",
        };

        write!(f, "{}", s)
    }
}

/// Power state of a source VM as reported by its hypervisor.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Up,
    Down,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Up => write!(f, "up"),
            PowerState::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Error)]
#[error("unrecognized power state {0:?}")]
pub struct UnknownPowerState(pub String);

impl FromStr for PowerState {
    type Err = UnknownPowerState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(PowerState::Up),
            "down" => Ok(PowerState::Down),
            other => Err(UnknownPowerState(other.to_string())),
        }
    }
}

/// How the source VM is taken across: a cold import stops the source before
/// copying its disks, a warm import copies while the source keeps running.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
    JsonSchema,
)]
pub enum MigrationMode {
    #[default]
    Cold,
    Warm,
}

/// The kind of hypervisor an import reads from, declared on the request and
/// used to choose a provider implementation.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Ovirt,
    Vmware,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Ovirt => write!(f, "ovirt"),
            SourceType::Vmware => write!(f, "vmware"),
        }
    }
}

#[derive(Debug, Error)]
#[error("unrecognized source type {0:?} (expected \"ovirt\" or \"vmware\")")]
pub struct UnknownSourceType(pub String);

impl FromStr for SourceType {
    type Err = UnknownSourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ovirt" => Ok(SourceType::Ovirt),
            "vmware" => Ok(SourceType::Vmware),
            other => Err(UnknownSourceType(other.to_string())),
        }
    }
}

/// Identifies the VM to import on the source hypervisor. At least one of the
/// fields must be set; which combinations are valid is up to the provider.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
pub struct SourceVmSpec {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// User-declared translation of source identifiers to target equivalents,
/// handed to the provider before mapping begins.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
pub struct ResourceMapping {
    /// Source network identifier to target network name.
    pub networks: BTreeMap<String, String>,
    /// Source storage domain/datastore identifier to target storage class.
    pub storage: BTreeMap<String, String>,
}

/// The immutable description of one requested import.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
pub struct ImportRequest {
    /// Unique identifier for this import instance.
    pub id: Uuid,
    /// Human-readable name of the import instance.
    pub name: String,
    /// Namespace the created target resources live in.
    pub namespace: String,
    pub source_type: SourceType,
    pub source_vm: SourceVmSpec,
    /// Requested name for the created VM. When absent, the name is resolved
    /// from the source VM or the processed template.
    pub target_vm_name: Option<String>,
    #[serde(default)]
    pub mode: MigrationMode,
    #[serde(default)]
    pub resource_mapping: Option<ResourceMapping>,
}

impl ImportRequest {
    /// Ownership link stamped on every resource created for this import.
    pub fn owner_ref(&self) -> OwnerRef {
        OwnerRef { name: self.name.clone(), uid: self.id }
    }

    /// Value of the tracker label for this import.
    pub fn tracker_value(&self) -> String {
        self.id.to_string()
    }
}

/// Link from a created resource back to the import instance that owns it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
pub struct OwnerRef {
    pub name: String,
    pub uid: Uuid,
}

/// The target VM resource the import builds up and eventually creates.
///
/// Providers and mappers fill in the machine shape; the engine only stamps
/// identity (owner, labels) and registers transfer volumes.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
pub struct TargetVmSpec {
    pub name: String,
    pub namespace: String,
    pub cpus: u8,
    pub memory_mib: u64,
    /// Name of the template this spec was processed from, if any.
    pub template: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerRef>,
    /// Names of the transfer resources attached as disks, in attach order.
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// Lifecycle of one disk transfer as reported by the target cluster.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
pub enum TransferPhase {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

/// What one disk transfer should copy.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
pub struct TransferSpec {
    /// Identifier of the disk on the source hypervisor.
    pub source_disk_id: String,
    pub size_bytes: u64,
    pub storage_class: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub owner: Option<OwnerRef>,
}

/// Point-in-time view of a transfer's progress.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
pub struct TransferState {
    pub phase: TransferPhase,
    /// Percentage copied, when the transfer machinery reports one.
    pub progress_percent: Option<u8>,
}

/// The worker carrying out a transfer. Only its identity and restart count
/// are visible to the engine; a worker restarting past the configured
/// tolerance is treated as a crash loop.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
pub struct WorkerInfo {
    pub name: String,
    pub restart_count: u32,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema,
)]
pub enum ConditionType {
    Succeeded,
    Failed,
    Validating,
    MappingRulesVerified,
    Processing,
}

/// A typed, timestamped marker on the status record. At most one condition
/// of each type is present; the `Failed` condition is what routes the
/// workflow onto the compensation itinerary.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(condition_type: ConditionType, status: bool) -> Self {
        Self {
            condition_type,
            status,
            reason: None,
            message: None,
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// The persisted progress record of one import.
///
/// The engine mutates this on every invocation; the surrounding driver is
/// responsible for persisting it and for re-invoking the engine. The error
/// list is append-only and survives itinerary switches, so it reads as a
/// full audit trail of everything that went wrong across retries.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
pub struct ImportStatus {
    pub phase: Phase,
    /// Name of the itinerary the phase belongs to. `None` until the engine
    /// first runs.
    pub itinerary: Option<String>,
    /// Name of the created target VM, recorded by the CreateVM phase.
    pub target_vm_name: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Default for ImportStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Created,
            itinerary: None,
            target_vm_name: None,
            errors: Vec::new(),
            annotations: BTreeMap::new(),
            conditions: Vec::new(),
        }
    }
}

impl ImportStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message to the error log. Entries are never removed.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Writes an annotation unless the key is already present, returning
    /// whether a write happened. Keys are write-once so that a retried phase
    /// cannot clobber state captured by an earlier attempt.
    pub fn set_annotation_if_absent(
        &mut self,
        key: &str,
        value: impl Into<String>,
    ) -> bool {
        if self.annotations.contains_key(key) {
            return false;
        }
        self.annotations.insert(key.to_string(), value.into());
        true
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.condition_type == condition_type)
    }

    /// Whether a condition of the given type is present and affirmative.
    pub fn has_condition(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type).map(|c| c.status).unwrap_or(false)
    }

    /// Inserts or replaces the condition of the same type. The transition
    /// timestamp is carried over from the previous entry unless the status
    /// value actually changed.
    pub fn set_condition(&mut self, mut condition: Condition) {
        if let Some(pos) = self
            .conditions
            .iter()
            .position(|c| c.condition_type == condition.condition_type)
        {
            if self.conditions[pos].status == condition.status {
                condition.last_transition_time =
                    self.conditions[pos].last_transition_time;
            }
            self.conditions[pos] = condition;
        } else {
            self.conditions.push(condition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_are_write_once() {
        let mut status = ImportStatus::new();
        assert!(status.set_annotation_if_absent(
            keys::SOURCE_VM_INITIAL_STATE,
            PowerState::Up.to_string()
        ));

        // A retried phase must not overwrite the captured value.
        assert!(!status.set_annotation_if_absent(
            keys::SOURCE_VM_INITIAL_STATE,
            PowerState::Down.to_string()
        ));
        assert_eq!(
            status.annotation(keys::SOURCE_VM_INITIAL_STATE),
            Some("up")
        );
    }

    #[test]
    fn set_condition_replaces_entry_of_same_type() {
        let mut status = ImportStatus::new();
        status.set_condition(
            Condition::new(ConditionType::Processing, true)
                .with_reason("CopyingDisks"),
        );
        status.set_condition(
            Condition::new(ConditionType::Processing, true)
                .with_reason("ConvertingGuest"),
        );

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(
            status.condition(ConditionType::Processing).unwrap().reason,
            Some("ConvertingGuest".to_string())
        );
    }

    #[test]
    fn condition_transition_time_moves_only_on_status_change() {
        let mut status = ImportStatus::new();
        status.set_condition(Condition::new(ConditionType::Processing, true));
        let first = status
            .condition(ConditionType::Processing)
            .unwrap()
            .last_transition_time;

        // Same status value: the original transition time sticks.
        status.set_condition(Condition::new(ConditionType::Processing, true));
        assert_eq!(
            status
                .condition(ConditionType::Processing)
                .unwrap()
                .last_transition_time,
            first
        );

        // Flipping the status refreshes it.
        status.set_condition(Condition::new(ConditionType::Processing, false));
        assert!(
            status
                .condition(ConditionType::Processing)
                .unwrap()
                .last_transition_time
                >= first
        );
    }

    #[test]
    fn has_condition_requires_affirmative_status() {
        let mut status = ImportStatus::new();
        assert!(!status.has_condition(ConditionType::Failed));

        status.set_condition(Condition::new(ConditionType::Failed, false));
        assert!(!status.has_condition(ConditionType::Failed));

        status.set_condition(Condition::new(ConditionType::Failed, true));
        assert!(status.has_condition(ConditionType::Failed));
    }

    #[test]
    fn power_state_round_trips_through_annotation_form() {
        for state in [PowerState::Up, PowerState::Down] {
            assert_eq!(state.to_string().parse::<PowerState>().unwrap(), state);
        }
        assert!("suspended".parse::<PowerState>().is_err());
    }

    #[test]
    fn status_round_trips_through_json() {
        let mut status = ImportStatus::new();
        status.phase = Phase::ImportDisks;
        status.itinerary = Some("ColdImport".to_string());
        status.target_vm_name = Some("imported-vm".to_string());
        status.record_error("transfer disk-1 entered the Failed phase");
        status.set_annotation_if_absent(keys::SOURCE_VM_INITIAL_STATE, "up");
        status.set_condition(
            Condition::new(ConditionType::Processing, true)
                .with_reason("CopyingDisks"),
        );

        let json = serde_json::to_string(&status).unwrap();
        let back: ImportStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
