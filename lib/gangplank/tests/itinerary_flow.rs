// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Whole-itinerary runs of the import engine against the simulated source
//! and target, the way a driver would invoke it: construct a task, run it,
//! persist nothing but the status record, repeat until no requeue is asked
//! for.

use std::collections::BTreeMap;

use uuid::Uuid;

use gangplank::provider::{Credentials, GuestConverter, Provider};
use gangplank::sim::{SimCluster, SimConverter, SimDisk, SimFaults, SimSource};
use gangplank::target::TargetCluster;
use gangplank::types::{
    keys, Condition, ConditionType, ImportRequest, ImportStatus,
    MigrationMode, Phase, PowerState, ResourceMapping, SourceType,
    SourceVmSpec,
};
use gangplank::{Task, TaskOptions};

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn request(vm_name: &str, target_name: Option<&str>) -> ImportRequest {
    ImportRequest {
        id: Uuid::new_v4(),
        name: format!("import-{}", target_name.unwrap_or("unnamed")),
        namespace: "migrations".to_string(),
        source_type: SourceType::Ovirt,
        source_vm: SourceVmSpec {
            id: Some("11111111-aaaa".to_string()),
            name: Some(vm_name.to_string()),
        },
        target_vm_name: target_name.map(str::to_string),
        mode: MigrationMode::Cold,
        resource_mapping: Some(ResourceMapping {
            networks: BTreeMap::new(),
            storage: BTreeMap::from([(
                "default".to_string(),
                "standard".to_string(),
            )]),
        }),
    }
}

/// The connect/load/validate sequence a driver performs before the first
/// engine invocation.
fn prepare(
    source: &mut SimSource,
    request: &ImportRequest,
    status: &mut ImportStatus,
) {
    source
        .init(&Credentials {
            endpoint: "sim://localhost".to_string(),
            username: "admin".to_string(),
            password: "swordfish".to_string(),
        })
        .unwrap();
    source.load_source_vm(&request.source_vm).unwrap();
    if let Some(mapping) = &request.resource_mapping {
        source.prepare_resource_mapping(mapping, &request.source_vm);
    }
    for condition in source.validate().unwrap() {
        status.set_condition(condition);
    }
}

/// Runs the engine until it stops asking to be requeued, returning the
/// phase observed after each invocation. Hard failures are recorded in the
/// status by the engine itself, so they do not end the loop.
fn run_to_terminal(
    request: &ImportRequest,
    status: &mut ImportStatus,
    provider: &dyn Provider,
    target: &dyn TargetCluster,
    converter: Option<&dyn GuestConverter>,
    options: TaskOptions,
) -> Vec<Phase> {
    let log = test_logger();
    let mut trail = Vec::new();
    for _ in 0..100 {
        let terminal = {
            let mut task =
                Task::new(log.clone(), request, status, provider, target, options);
            if let Some(converter) = converter {
                task = task.with_converter(converter);
            }
            let _ = task.run();
            task.requeue().is_none()
        };
        trail.push(status.phase);
        if terminal {
            return trail;
        }
    }
    panic!("the workflow never reached a terminal phase; trail: {:?}", trail);
}

/// Runs the engine until the status record sits at the given phase.
fn run_until(
    request: &ImportRequest,
    status: &mut ImportStatus,
    provider: &dyn Provider,
    target: &dyn TargetCluster,
    stop_at: Phase,
) {
    let log = test_logger();
    for _ in 0..100 {
        if status.phase == stop_at {
            return;
        }
        let mut task = Task::new(
            log.clone(),
            request,
            status,
            provider,
            target,
            TaskOptions::default(),
        );
        let _ = task.run();
        if task.requeue().is_none() {
            break;
        }
    }
    panic!("the workflow never reached {}", stop_at);
}

#[test]
fn cold_import_runs_to_completion() {
    let request = request("Legacy_DB", Some("imported-db"));
    let mut status = ImportStatus::new();
    let mut source = SimSource::new("Legacy_DB", PowerState::Up)
        .with_disks(vec![SimDisk::new("disk-1", 10 << 30)]);
    prepare(&mut source, &request, &mut status);
    let cluster = SimCluster::new();

    let trail = run_to_terminal(
        &request,
        &mut status,
        &source,
        &cluster,
        None,
        TaskOptions::default(),
    );

    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.itinerary.as_deref(), Some("ColdImport"));
    assert!(status.errors.is_empty(), "unexpected errors: {:?}", status.errors);
    assert!(status.has_condition(ConditionType::Succeeded));
    assert!(!status.has_condition(ConditionType::Failed));

    // The source was stopped exactly once and its prior state captured.
    assert_eq!(source.power_state(), PowerState::Down);
    assert_eq!(source.stop_calls(), 1);
    assert_eq!(status.annotation(keys::SOURCE_VM_INITIAL_STATE), Some("up"));
    assert!(source.cleaned_up());

    // The created VM carries the import's identity and its copied disk.
    let vm = cluster.vm("imported-db").expect("the target VM exists");
    assert_eq!(vm.namespace, "migrations");
    assert_eq!(vm.owner.as_ref().map(|o| o.uid), Some(request.id));
    assert_eq!(
        vm.labels.get(keys::IMPORT_TRACKER),
        Some(&request.tracker_value())
    );
    assert_eq!(vm.volumes, vec!["imported-db-disk-1".to_string()]);

    // Storage mapping flowed through to the transfer.
    let transfer = cluster.transfer_spec("imported-db-disk-1").unwrap();
    assert_eq!(transfer.storage_class.as_deref(), Some("standard"));
    assert_eq!(transfer.owner.as_ref().map(|o| o.uid), Some(request.id));

    // Copying is the slow part: the disk phase was polled more than once.
    let polls =
        trail.iter().filter(|p| **p == Phase::ImportDisks).count();
    assert!(polls > 1, "expected repeated disk polling, trail: {:?}", trail);
    assert!(!trail.contains(&Phase::ImportFailed));
}

#[test]
fn warm_import_never_touches_source_power() {
    let mut request = request("Busy_App", Some("busy-app"));
    request.mode = MigrationMode::Warm;
    let mut status = ImportStatus::new();
    let mut source = SimSource::new("Busy_App", PowerState::Up)
        .with_disks(vec![SimDisk::new("disk-1", 1 << 30)]);
    prepare(&mut source, &request, &mut status);
    let cluster = SimCluster::new();

    let trail = run_to_terminal(
        &request,
        &mut status,
        &source,
        &cluster,
        None,
        TaskOptions::default(),
    );

    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.itinerary.as_deref(), Some("WarmImport"));
    assert!(!trail.contains(&Phase::PowerOffSource));

    // The source kept running throughout.
    assert_eq!(source.power_state(), PowerState::Up);
    assert_eq!(source.stop_calls(), 0);
    assert!(status.annotation(keys::SOURCE_VM_INITIAL_STATE).is_none());
    assert!(cluster.vm("busy-app").is_some());
}

#[test]
fn failed_warm_import_compensates_without_touching_source_power() {
    let mut request = request("Flaky_App", Some("flaky-app"));
    request.mode = MigrationMode::Warm;
    let mut status = ImportStatus::new();
    let mut source = SimSource::new("Flaky_App", PowerState::Up)
        .with_disks(vec![SimDisk::new("disk-1", 2 << 30)]);
    prepare(&mut source, &request, &mut status);

    let cluster = SimCluster::new();
    cluster.fail_transfer("flaky-app-disk-1");

    run_to_terminal(
        &request,
        &mut status,
        &source,
        &cluster,
        None,
        TaskOptions::default(),
    );

    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.itinerary.as_deref(), Some("Failed"));
    assert!(
        status.errors.iter().any(|e| e.contains("entered the Failed phase")),
        "errors: {:?}",
        status.errors
    );

    // The source was never powered off, so compensation has nothing to
    // restore: no power calls, and no complaint about a missing capture.
    assert!(
        !status.errors.iter().any(|e| e.contains("never captured")),
        "errors: {:?}",
        status.errors
    );
    assert!(status.annotation(keys::SOURCE_VM_INITIAL_STATE).is_none());
    assert_eq!(source.stop_calls(), 0);
    assert_eq!(source.start_calls(), 0);
    assert_eq!(source.power_state(), PowerState::Up);
    assert!(cluster.is_empty());
}

#[test]
fn crash_looping_worker_fails_the_import_and_compensates() {
    let request = request("Billing_VM", Some("billing"));
    let mut status = ImportStatus::new();
    let mut source = SimSource::new("Billing_VM", PowerState::Up)
        .with_disks(vec![SimDisk::new("disk-1", 20 << 30)]);
    prepare(&mut source, &request, &mut status);

    let cluster = SimCluster::new();
    // Five restarts against the default tolerance of three.
    cluster.set_worker_restarts("billing-disk-1", 5);

    run_to_terminal(
        &request,
        &mut status,
        &source,
        &cluster,
        None,
        TaskOptions::default(),
    );

    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.itinerary.as_deref(), Some("Failed"));
    assert!(status.has_condition(ConditionType::Failed));
    assert!(!status.has_condition(ConditionType::Succeeded));
    assert!(
        status.errors.iter().any(|e| e.contains("crash looping")),
        "errors: {:?}",
        status.errors
    );
    let failed = status.condition(ConditionType::Failed).unwrap();
    assert_eq!(failed.reason.as_deref(), Some("DiskTransferCrashLoop"));

    // The source was powered back on exactly once, and everything created
    // on the target was torn down.
    assert_eq!(source.power_state(), PowerState::Up);
    assert_eq!(source.start_calls(), 1);
    assert!(cluster.is_empty(), "rollback left resources behind");
}

#[test]
fn failed_transfer_leaves_a_down_source_down() {
    let request = request("Archived_VM", Some("archived"));
    let mut status = ImportStatus::new();
    let mut source = SimSource::new("Archived_VM", PowerState::Down)
        .with_disks(vec![SimDisk::new("disk-1", 5 << 30)]);
    prepare(&mut source, &request, &mut status);

    let cluster = SimCluster::new();
    cluster.fail_transfer("archived-disk-1");

    run_to_terminal(
        &request,
        &mut status,
        &source,
        &cluster,
        None,
        TaskOptions::default(),
    );

    assert_eq!(status.itinerary.as_deref(), Some("Failed"));
    assert!(
        status.errors.iter().any(|e| e.contains("entered the Failed phase")),
        "errors: {:?}",
        status.errors
    );

    // The capture said "down", so compensation must not start the source.
    assert_eq!(status.annotation(keys::SOURCE_VM_INITIAL_STATE), Some("down"));
    assert_eq!(source.start_calls(), 0);
    assert_eq!(source.power_state(), PowerState::Down);
    assert!(cluster.is_empty());
}

#[test]
fn stop_failure_still_restores_from_the_prior_capture() {
    let request = request("Fragile_VM", Some("fragile"));
    let mut status = ImportStatus::new();
    let mut source = SimSource::new("Fragile_VM", PowerState::Up)
        .with_disks(vec![SimDisk::new("disk-1", 1 << 30)])
        .with_faults(SimFaults { fail_stop_vm: true, ..Default::default() });
    prepare(&mut source, &request, &mut status);
    let cluster = SimCluster::new();

    run_to_terminal(
        &request,
        &mut status,
        &source,
        &cluster,
        None,
        TaskOptions::default(),
    );

    // The capture lands before the stop attempt, so even a failed stop
    // leaves compensation with a state to restore.
    assert!(
        status.errors.iter().any(|e| e.contains("injected stop failure")),
        "errors: {:?}",
        status.errors
    );
    assert_eq!(status.annotation(keys::SOURCE_VM_INITIAL_STATE), Some("up"));
    assert_eq!(source.start_calls(), 1);
    assert_eq!(source.power_state(), PowerState::Up);
}

#[test]
fn externally_failed_import_compensates_from_wherever_it_was() {
    let request = request("Doomed_VM", Some("doomed"));
    let mut status = ImportStatus::new();
    let mut source = SimSource::new("Doomed_VM", PowerState::Up)
        .with_disks(vec![SimDisk::new("disk-1", 50 << 30)]);
    prepare(&mut source, &request, &mut status);
    let cluster = SimCluster::new();

    run_until(&request, &mut status, &source, &cluster, Phase::ImportDisks);
    assert!(cluster.vm("doomed").is_some());

    // Someone outside the engine cancels the import.
    status.set_condition(
        Condition::new(ConditionType::Failed, true)
            .with_reason("ImportCancelled"),
    );

    run_to_terminal(
        &request,
        &mut status,
        &source,
        &cluster,
        None,
        TaskOptions::default(),
    );

    assert_eq!(status.phase, Phase::Completed);
    assert_eq!(status.itinerary.as_deref(), Some("Failed"));
    assert!(cluster.is_empty());
    assert_eq!(source.start_calls(), 1);
    assert_eq!(source.power_state(), PowerState::Up);
}

#[test]
fn rerunning_interrupted_phases_changes_nothing() {
    let request = request("Replayed_VM", Some("replayed"));
    let mut status = ImportStatus::new();
    let mut source = SimSource::new("Replayed_VM", PowerState::Up)
        .with_disks(vec![SimDisk::new("disk-1", 1 << 30)]);
    prepare(&mut source, &request, &mut status);
    let cluster = SimCluster::new();

    // Creation ran, but pretend the advance was never persisted.
    run_until(&request, &mut status, &source, &cluster, Phase::CreateDataVolumes);
    status.phase = Phase::CreateVM;

    // Same again for the disk setup.
    run_until(&request, &mut status, &source, &cluster, Phase::ImportDisks);
    status.phase = Phase::CreateDataVolumes;

    run_to_terminal(
        &request,
        &mut status,
        &source,
        &cluster,
        None,
        TaskOptions::default(),
    );

    assert_eq!(status.phase, Phase::Completed);
    assert!(status.errors.is_empty(), "replays recorded errors: {:?}", status.errors);
    assert!(status.has_condition(ConditionType::Succeeded));

    // Exactly one VM with exactly one attached volume.
    let vm = cluster.vm("replayed").unwrap();
    assert_eq!(vm.volumes, vec!["replayed-disk-1".to_string()]);
    assert_eq!(cluster.transfer_names(), vec!["replayed-disk-1".to_string()]);
    assert_eq!(source.stop_calls(), 1);
}

#[test]
fn templateless_source_imports_under_the_feature_gate() {
    let request = request("No_Template_VM", None);
    let mut status = ImportStatus::new();
    let mut source = SimSource::new("No_Template_VM", PowerState::Down)
        .with_disks(vec![SimDisk::new("disk-1", 1 << 30)])
        .with_faults(SimFaults { no_template: true, ..Default::default() });
    prepare(&mut source, &request, &mut status);
    let cluster = SimCluster::new();

    let options =
        TaskOptions { import_without_template: true, ..Default::default() };
    run_to_terminal(&request, &mut status, &source, &cluster, None, options);

    assert_eq!(status.phase, Phase::Completed);
    assert!(status.has_condition(ConditionType::Succeeded));

    // No name was requested: the target VM is named after the source, and
    // the spec is the bare fallback shape rather than a template's.
    assert_eq!(status.target_vm_name.as_deref(), Some("no-template-vm"));
    let vm = cluster.vm("no-template-vm").unwrap();
    assert_eq!(vm.cpus, 1);
    assert!(vm.template.is_none());
}

#[test]
fn guest_conversion_is_polled_until_done() {
    let request = request("Converted_VM", Some("converted"));
    let mut status = ImportStatus::new();
    let mut source = SimSource::new("Converted_VM", PowerState::Up)
        .with_disks(vec![SimDisk::new("disk-1", 1 << 30)]);
    prepare(&mut source, &request, &mut status);
    let cluster = SimCluster::new();
    let converter = SimConverter::new(2);

    let trail = run_to_terminal(
        &request,
        &mut status,
        &source,
        &cluster,
        Some(&converter),
        TaskOptions::default(),
    );

    assert_eq!(status.phase, Phase::Completed);
    assert!(status.has_condition(ConditionType::Succeeded));
    // Two polls came back unfinished before the conversion completed.
    let conversion_runs =
        trail.iter().filter(|p| **p == Phase::ConvertGuest).count();
    assert_eq!(conversion_runs, 3);
}
