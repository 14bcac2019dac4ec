use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use steward_controller::{Collaborators, WorkloadController, WorkloadControllerConfig};
use steward_core::{LogEvents, ManagementIntent, OperatorStatus, StateObserver, SyncContext};
use steward_ops::{parse_manifest, render_manifest, DeploymentDelegate, KubeNamespaces, KubeNodes, KubePods, Placement};
use steward_placement::NodeCounter;
use steward_store::{MemoryStatusStore, VersionRecorder, WorkQueue};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "stewardctl", version, about = "Steward workload controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile continuously, driven by watches and a resync ticker, until Ctrl-C
    Run {
        #[command(flatten)]
        controller: ControllerArgs,
        /// Work queue capacity
        #[arg(long = "queue-cap", env = "STEWARD_QUEUE_CAP", default_value_t = 1024)]
        queue_cap: usize,
        /// Periodic resync interval in seconds (0 disables)
        #[arg(long = "resync-secs", env = "STEWARD_RESYNC_SECS", default_value_t = 600)]
        resync_secs: u64,
    },
    /// Run a single reconciliation pass and print the resulting status
    Once {
        #[command(flatten)]
        controller: ControllerArgs,
    },
    /// Print the manifest as it would be applied
    Render {
        #[command(flatten)]
        controller: ControllerArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct ControllerArgs {
    /// Deployment manifest (YAML)
    #[arg(long = "manifest", env = "STEWARD_MANIFEST")]
    manifest: PathBuf,
    /// Namespace the workload lives in
    #[arg(short = 'n', long = "namespace", env = "STEWARD_TARGET_NAMESPACE")]
    namespace: String,
    /// Controller name; suffixed with `WorkloadController`
    #[arg(long = "name", env = "STEWARD_NAME", default_value = "Steward")]
    name: String,
    /// Version reported once the rollout has fully landed
    #[arg(long = "operand-version", env = "STEWARD_OPERAND_VERSION", default_value = "0.0.0")]
    operand_version: String,
    /// Prefix of the recorded operand name (defaults to the namespace)
    #[arg(long = "operand-prefix", env = "STEWARD_OPERAND_PREFIX")]
    operand_prefix: Option<String>,
    /// Prefix of every condition type
    #[arg(long = "conditions-prefix", env = "STEWARD_CONDITIONS_PREFIX", default_value = "")]
    conditions_prefix: String,
    /// Managed, Unmanaged or Removed
    #[arg(long = "management-state", env = "STEWARD_MANAGEMENT_STATE", default_value = "Managed")]
    management_state: String,
    /// Allow at most one pod of this component per node
    #[arg(long = "anti-affinity-component")]
    anti_affinity_component: Option<String>,
    /// Run one replica per node matching --node-selector
    #[arg(long = "size-to-nodes", action = ArgAction::SetTrue)]
    size_to_nodes: bool,
    /// Node label selector entry `key=value` (repeatable)
    #[arg(long = "node-selector", value_parser = parse_label)]
    node_selector: Vec<(String, String)>,
    /// Field manager for server-side apply
    #[arg(long = "field-manager", env = "STEWARD_FIELD_MANAGER", default_value = "steward")]
    field_manager: String,
}

impl ControllerArgs {
    fn config(&self) -> WorkloadControllerConfig {
        WorkloadControllerConfig {
            name: self.name.clone(),
            target_namespace: self.namespace.clone(),
            target_operand_version: self.operand_version.clone(),
            operand_name_prefix: self.operand_prefix.clone().unwrap_or_else(|| self.namespace.clone()),
            conditions_prefix: self.conditions_prefix.clone(),
        }
    }

    fn placement(&self) -> Placement {
        Placement {
            anti_affinity_component: self.anti_affinity_component.clone(),
            size_to_nodes: self.size_to_nodes,
            node_selector: self.node_selector.iter().cloned().collect(),
        }
    }
}

/// `key=value`, or a bare `key` meaning an empty value.
fn parse_label(s: &str) -> Result<(String, String), String> {
    let (k, v) = s.split_once('=').unwrap_or((s, ""));
    if k.is_empty() {
        return Err(format!("invalid label selector entry: {:?}", s));
    }
    Ok((k.to_string(), v.to_string()))
}

const LOG_ENV: &str = "STEWARD_LOG";
const METRICS_ADDR_ENV: &str = "STEWARD_METRICS_ADDR";

/// Unset or unparsable directives fall back to `info`.
fn log_filter(directives: Option<&str>) -> tracing_subscriber::EnvFilter {
    directives
        .and_then(|d| tracing_subscriber::EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"))
}

fn init_tracing() {
    let directives = std::env::var(LOG_ENV).ok();
    tracing_subscriber::fmt().with_env_filter(log_filter(directives.as_deref())).with_target(true).init();
}

fn init_metrics() {
    let Ok(raw) = std::env::var(METRICS_ADDR_ENV) else { return };
    let Ok(addr) = raw.parse::<SocketAddr>() else {
        warn!(addr = %raw, "invalid {}; expected host:port", METRICS_ADDR_ENV);
        return;
    };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => info!(%addr, "prometheus exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

struct Wired {
    controller: Arc<WorkloadController>,
    store: Arc<MemoryStatusStore>,
    versions: Arc<VersionRecorder>,
    client: kube::Client,
}

async fn wire(args: &ControllerArgs) -> Result<Wired> {
    let yaml = std::fs::read_to_string(&args.manifest)
        .with_context(|| format!("reading manifest {}", args.manifest.display()))?;
    let manifest = parse_manifest(&yaml)?;
    let client = steward_kubehub::get_kube_client().await?;
    let intent = ManagementIntent::parse(&args.management_state);
    let store = Arc::new(MemoryStatusStore::new(intent));
    let versions = Arc::new(VersionRecorder::new());
    let delegate = DeploymentDelegate::new(
        client.clone(),
        args.namespace.clone(),
        manifest,
        args.placement(),
        KubeNodes::new(client.clone()),
        args.field_manager.clone(),
    );
    let collaborators = Collaborators {
        observer: store.clone(),
        status: store.clone(),
        namespaces: Arc::new(KubeNamespaces::new(client.clone())),
        delegate: Arc::new(delegate),
        versions: versions.clone(),
        pods: Arc::new(KubePods::new(client.clone())),
        events: Arc::new(LogEvents),
    };
    let controller = Arc::new(WorkloadController::new(args.config(), collaborators));
    info!(controller = %controller.name(), namespace = %args.namespace, "controller wired");
    Ok(Wired { controller, store, versions, client })
}

#[derive(Serialize)]
struct Report<'a> {
    controller: &'a str,
    status: &'a OperatorStatus,
    versions: BTreeMap<String, String>,
}

fn print_report(output: Output, controller: &str, status: &OperatorStatus, versions: BTreeMap<String, String>) -> Result<()> {
    match output {
        Output::Json => {
            let report = Report { controller, status, versions };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Output::Human => {
            println!("{}", controller);
            for c in &status.conditions {
                println!("  {:<40} {:<8} {:<26} {}", c.r#type, format!("{:?}", c.status), c.reason, c.message);
            }
            for g in &status.generations {
                println!("  generation {}/{} {}/{} = {}", g.group, g.resource, g.namespace, g.name, g.last_generation);
            }
            for (k, v) in versions {
                println!("  version {} = {}", k, v);
            }
        }
    }
    Ok(())
}

async fn worker_loop(controller: Arc<WorkloadController>, queue: WorkQueue, cancel: CancellationToken) {
    while let Some(key) = queue.next().await {
        let ctx = SyncContext::with_token(key.clone(), cancel.child_token());
        match controller.sync(&ctx).await {
            Ok(()) => queue.forget(&key),
            Err(e) => {
                warn!(controller = %controller.name(), key = %key, requeues = queue.num_requeues(&key), error = %e, "sync failed; requeueing");
                queue.add_rate_limited(&key);
            }
        }
        queue.done(&key);
    }
    info!(controller = %controller.name(), "worker stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { controller: args, queue_cap, resync_secs } => {
            let wired = wire(&args).await?;
            let name = wired.controller.name().to_string();
            let queue = WorkQueue::with_capacity(name.clone(), queue_cap);
            let cancel = CancellationToken::new();
            let triggers = steward_kubehub::spawn_triggers(
                wired.client.clone(),
                &args.namespace,
                &queue,
                &name,
                Duration::from_secs(resync_secs),
                &cancel,
            );
            queue.add(&name);
            let worker = tokio::spawn(worker_loop(wired.controller.clone(), queue.clone(), cancel.clone()));
            info!(controller = %name, queue_cap, resync_secs, "running");

            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; shutting down");
            cancel.cancel();
            queue.shut_down();
            for t in triggers {
                let _ = t.await;
            }
            if let Err(e) = worker.await {
                error!(error = %e, "worker task failed");
            }
            if queue.dropped() > 0 {
                warn!(dropped = queue.dropped(), "work queue dropped keys while full");
            }
            print_report(cli.output, &name, &wired.store.current_status(), wired.versions.snapshot())?;
        }
        Commands::Once { controller: args } => {
            let wired = wire(&args).await?;
            let name = wired.controller.name().to_string();
            let res = wired.controller.sync(&SyncContext::new(name.clone())).await;
            print_report(cli.output, &name, &wired.store.current_status(), wired.versions.snapshot())?;
            res?;
        }
        Commands::Render { controller: args } => {
            let yaml = std::fs::read_to_string(&args.manifest)
                .with_context(|| format!("reading manifest {}", args.manifest.display()))?;
            let manifest = parse_manifest(&yaml)?;
            let placement = args.placement();
            let node_count = if placement.size_to_nodes {
                let client = steward_kubehub::get_kube_client().await?;
                let ctx = SyncContext::new("render");
                Some(NodeCounter::new(KubeNodes::new(client)).count(&ctx, &placement.node_selector).await?)
            } else {
                None
            };
            let rendered = render_manifest(&manifest, &args.namespace, &placement, node_count)?;
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&rendered)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&rendered)?),
            }
        }
    }
    Ok(())
}
