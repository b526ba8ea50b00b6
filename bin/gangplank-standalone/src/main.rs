// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs one import end to end against simulated endpoints, driving the
//! engine the way a controller would: run, persist nothing but the status,
//! sleep for the requested delay, run again. Handy for watching an
//! itinerary unfold and for poking at fault handling from the shell.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;

use anyhow::Context;
use clap::Parser;
use slog::{info, o, Drain};
use uuid::Uuid;

use gangplank::provider::{Credentials, Provider, ProviderFactory};
use gangplank::sim::{SimCluster, SimDisk, SimFactory, SimFault, SimFaults};
use gangplank::types::{
    ConditionType, ImportRequest, ImportStatus, MigrationMode, PowerState,
    ResourceMapping, SourceType, SourceVmSpec,
};
use gangplank::{Task, TaskOptions};

#[derive(clap::Parser)]
/// Command-line harness that runs a simulated VM import to completion.
struct Args {
    /// Path to a TOML file with feature gates and import tuning.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Name of the VM on the simulated source hypervisor.
    #[clap(long, default_value = "demo_vm")]
    vm: String,

    /// Name for the created VM; derived from the source when omitted.
    #[clap(long)]
    target_name: Option<String>,

    /// Source hypervisor flavor to simulate (ovirt or vmware).
    #[clap(long, default_value = "ovirt")]
    source_type: SourceType,

    /// Number of disks on the simulated VM.
    #[clap(long, default_value_t = 2)]
    disks: u32,

    /// Size of each simulated disk, in GiB.
    #[clap(long, default_value_t = 10)]
    disk_gib: u64,

    /// Run a warm import instead of a cold one.
    #[clap(long, action)]
    warm: bool,

    /// Inject a fault; may be given more than once. Known faults: stop-vm,
    /// start-vm, no-template, template-processing, map-vm, invalid-disk,
    /// transfer-failure, crash-looping-worker.
    #[clap(long = "fault")]
    faults: Vec<SimFault>,
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

fn resolve_options(config: Option<&PathBuf>) -> anyhow::Result<TaskOptions> {
    match config {
        Some(path) => {
            let config = gangplank_config_toml::parse(path).with_context(
                || format!("loading config from {}", path.display()),
            )?;
            Ok(TaskOptions {
                import_without_template: config
                    .features
                    .import_without_template,
                worker_restart_tolerance: config
                    .import
                    .worker_restart_tolerance,
            })
        }
        None => Ok(TaskOptions::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (log, _log_async_guard) = build_log();

    let options = resolve_options(args.config.as_ref())?;

    let mut source_faults = SimFaults::default();
    let mut invalid_disk = false;
    let mut transfer_failure = false;
    let mut crash_looping_worker = false;
    for fault in &args.faults {
        match fault {
            SimFault::StopVm => source_faults.fail_stop_vm = true,
            SimFault::StartVm => source_faults.fail_start_vm = true,
            SimFault::NoTemplate => source_faults.no_template = true,
            SimFault::TemplateProcessing => {
                source_faults.fail_template_processing = true;
            }
            SimFault::MapVm => source_faults.fail_map_vm = true,
            SimFault::InvalidDisk => invalid_disk = true,
            SimFault::TransferFailure => transfer_failure = true,
            SimFault::CrashLoopingWorker => crash_looping_worker = true,
        }
    }

    let disks = (0..args.disks)
        .map(|i| {
            let disk =
                SimDisk::new(&format!("disk-{}", i), args.disk_gib << 30);
            if invalid_disk && i == 0 {
                disk.invalid()
            } else {
                disk
            }
        })
        .collect::<Vec<_>>();

    let request = ImportRequest {
        id: Uuid::new_v4(),
        name: format!("import-{}", args.vm.to_lowercase()),
        namespace: "migrations".to_string(),
        source_type: args.source_type,
        source_vm: SourceVmSpec { id: None, name: Some(args.vm.clone()) },
        target_vm_name: args.target_name.clone(),
        mode: if args.warm { MigrationMode::Warm } else { MigrationMode::Cold },
        resource_mapping: Some(ResourceMapping {
            networks: BTreeMap::new(),
            storage: BTreeMap::from([(
                "default".to_string(),
                "standard".to_string(),
            )]),
        }),
    };

    let factory = SimFactory {
        vm_name: args.vm.clone(),
        power: PowerState::Up,
        disks,
        faults: source_faults,
    };
    let mut provider = factory
        .create(args.source_type)
        .map_err(|e| anyhow::anyhow!(e))
        .context("building the source provider")?;
    let cluster = SimCluster::new();

    provider
        .init(&Credentials {
            endpoint: format!("sim://{}", args.source_type),
            username: "admin".to_string(),
            password: "swordfish".to_string(),
        })
        .map_err(|e| anyhow::anyhow!(e))
        .context("connecting to the simulated source")?;
    provider
        .test_connection()
        .map_err(|e| anyhow::anyhow!(e))
        .context("checking the source connection")?;
    provider
        .load_source_vm(&request.source_vm)
        .map_err(|e| anyhow::anyhow!(e))
        .context("loading the source VM")?;
    let source_name = provider
        .vm_name()
        .map_err(|e| anyhow::anyhow!(e))
        .context("reading the source VM name")?;
    info!(log, "loaded source VM"; "name" => &source_name);
    if let Some(mapping) = &request.resource_mapping {
        provider.prepare_resource_mapping(mapping, &request.source_vm);
    }

    let mut status = ImportStatus::new();
    let conditions = provider
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("validating the import")?;
    for condition in conditions {
        status.set_condition(condition);
    }

    info!(log, "starting import";
        "vm" => &args.vm,
        "source_type" => %args.source_type,
        "mode" => ?request.mode);

    let mut runs = 0u32;
    loop {
        runs += 1;
        anyhow::ensure!(runs <= 1000, "no terminal phase after {} runs", runs);

        // Transfer-level faults attach to transfer names, which exist only
        // once the engine has created them; reapplying is harmless.
        if transfer_failure || crash_looping_worker {
            for name in cluster.transfer_names() {
                if transfer_failure {
                    cluster.fail_transfer(&name);
                }
                if crash_looping_worker {
                    cluster.set_worker_restarts(
                        &name,
                        options.worker_restart_tolerance + 2,
                    );
                }
            }
        }

        let delay = {
            let mut task = Task::new(
                log.clone(),
                &request,
                &mut status,
                provider.as_ref(),
                &cluster,
                options,
            );
            // Hard failures are recorded in the status and logged by the
            // engine; the driver just keeps requeueing.
            let _ = task.run();
            task.requeue()
        };
        match delay {
            Some(delay) => thread::sleep(delay),
            None => break,
        }
    }
    provider.close();

    info!(log, "import finished";
        "phase" => %status.phase,
        "runs" => runs,
        "errors" => status.errors.len());

    println!(
        "{}",
        serde_json::to_string_pretty(&status)
            .context("rendering the final status")?
    );

    anyhow::ensure!(
        !status.has_condition(ConditionType::Failed),
        "the import failed; see the status above"
    );
    Ok(())
}
