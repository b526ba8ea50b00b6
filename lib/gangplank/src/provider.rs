// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability traits for the source-hypervisor side of an import.
//!
//! The engine never talks to a hypervisor directly. Everything it needs from
//! the source — power control, disk enumeration, template processing — comes
//! through [`Provider`] and [`Mapper`], implemented once per supported
//! hypervisor kind and selected through [`ProviderFactory`] at
//! workflow-creation time. The traits are abstracted so they can be mocked
//! out while testing the engine.

use std::collections::BTreeMap;

use gangplank_api_types::{
    Condition, PowerState, ResourceMapping, SourceType, SourceVmSpec,
    TargetVmSpec, TransferSpec,
};

/// Error type surfaced by collaborator implementations. Implementations may
/// use whatever concrete errors they like; the engine only renders these
/// into log and status messages.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// Credentials for a source hypervisor's control plane.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub endpoint: String,
    pub username: String,
    pub password: String,
}

/// A VM template on the target platform matching the source VM's guest
/// profile.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TemplateRef {
    pub name: String,
    pub namespace: Option<String>,
}

/// Control-plane operations of one specific source hypervisor.
///
/// The connection-management half (`init` through `validate`) is driven by
/// the surrounding reconciliation scaffolding before the engine runs; the
/// engine itself only uses the per-phase operations below it.
#[cfg_attr(test, mockall::automock)]
pub trait Provider {
    fn init(&mut self, credentials: &Credentials)
        -> Result<(), ProviderError>;

    fn test_connection(&self) -> Result<(), ProviderError>;

    /// Loads the source VM named by the request so later calls can operate
    /// on it.
    fn load_source_vm(
        &mut self,
        vm: &SourceVmSpec,
    ) -> Result<(), ProviderError>;

    fn prepare_resource_mapping(
        &mut self,
        mapping: &ResourceMapping,
        vm: &SourceVmSpec,
    );

    /// Checks that the loaded VM is importable, returning condition
    /// fragments for the driver to merge into the status record.
    fn validate(&self) -> Result<Vec<Condition>, ProviderError>;

    /// Whether the given source disk is in a state that allows transfer.
    fn validate_disk_status(&self, disk_id: &str)
        -> Result<bool, ProviderError>;

    fn stop_vm(&self) -> Result<(), ProviderError>;

    fn start_vm(&self) -> Result<(), ProviderError>;

    fn vm_status(&self) -> Result<PowerState, ProviderError>;

    fn vm_name(&self) -> Result<String, ProviderError>;

    /// Removes transient per-import material (secrets, config) held for
    /// this import. `failed` distinguishes the compensation path, where
    /// implementations may have additional teardown of their own.
    fn clean_up(&self, failed: bool) -> Result<(), ProviderError>;

    /// Looks for a template matching the source VM. `Ok(None)` means no
    /// template matched; an error means the lookup itself failed.
    fn find_template(&self) -> Result<Option<TemplateRef>, ProviderError>;

    /// Instantiates a template into a target VM spec. `name` is the
    /// requested VM name when one was given; a template is free to generate
    /// a name when it is absent.
    fn process_template<'a>(
        &self,
        template: &TemplateRef,
        name: Option<&'a str>,
        namespace: &str,
    ) -> Result<TargetVmSpec, ProviderError>;

    fn create_mapper(&self) -> Result<Box<dyn Mapper>, ProviderError>;

    fn close(&mut self);
}

/// Translates attributes of the loaded source VM into target spec fragments
/// and the set of disk transfers the import requires.
#[cfg_attr(test, mockall::automock)]
pub trait Mapper {
    /// Resolves the name for the created VM, normalizing the requested name
    /// or deriving one from the source VM. `None` when no name can be
    /// derived, in which case a processed template must supply one.
    fn resolve_vm_name<'a>(&self, requested: Option<&'a str>)
        -> Option<String>;

    /// A minimal runnable spec with no template backing.
    fn create_empty_vm(&self, name: &str) -> TargetVmSpec;

    /// Maps the source VM's attributes onto `spec`.
    fn map_vm(
        &self,
        target_name: &str,
        spec: TargetVmSpec,
    ) -> Result<TargetVmSpec, ProviderError>;

    /// The disk transfers this import requires, keyed by the name each
    /// transfer resource is created under. The key set is stable across
    /// calls for one loaded VM.
    fn map_data_volumes(
        &self,
        target_name: &str,
    ) -> Result<BTreeMap<String, TransferSpec>, ProviderError>;

    /// Registers a transfer as a disk of the target VM.
    fn map_disk(
        &self,
        spec: &mut TargetVmSpec,
        transfer_name: &str,
        transfer: &TransferSpec,
    );
}

/// Extension point for guest conversion between the disk import and
/// cleanup. `Ok(true)` means conversion is finished, `Ok(false)` means it is
/// still running and the phase should be polled again.
#[cfg_attr(test, mockall::automock)]
pub trait GuestConverter {
    fn convert(&self, vm_name: &str) -> Result<bool, ProviderError>;
}

/// Chooses a provider implementation from the source type declared on an
/// import request.
#[cfg_attr(test, mockall::automock)]
pub trait ProviderFactory {
    fn create(
        &self,
        source_type: SourceType,
    ) -> Result<Box<dyn Provider>, ProviderError>;
}
