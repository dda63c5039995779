use std::{env, io, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use kube_client::Api;
use kube_core::DynamicObject;
use kube_runtime::watcher;

use broker_ingress::cluster::{ClusterConfig, ClusterError};
use broker_ingress::controller::exporter::ExporterOptions;
use broker_ingress::controller::level::install_logger;
use broker_ingress::controller::{
    AtomicLevel, LogController, MetricsExporterController, TracePublisherController,
};
use broker_ingress::env::{EnvError, EnvironmentConfig};
use broker_ingress::informer::{InformerCoordinator, ReflectorInformer};
use broker_ingress::ingress::defaulting::DEFAULT_TTL;
use broker_ingress::ingress::{
    BrokerStore, ConnectionArgs, HttpIngress, StatsReporter, TransportClient, TtlDefaulter,
};
use broker_ingress::lifecycle::{Components, LifecycleController, LifecycleError};
use broker_ingress::watcher::{backend, ConfigSnapshot, ConfigSourceWatcher, KubeBackend};

/// Name under which this process reports logs and metrics.
const COMPONENT: &str = "mt_broker_ingress";

/// Multi-tenant broker ingress.
#[derive(Parser)]
#[command(name = "broker-ingress", version, about)]
struct Cli {
    /// The address of the Kubernetes API server. Overrides any value in kubeconfig.
    #[arg(long)]
    master: Option<String>,

    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
enum Fatal {
    #[error("cannot install signal handlers: {0}")]
    Signals(#[source] io::Error),
    #[error("failed to process environment: {0}")]
    Env(#[from] EnvError),
    #[error("cannot reach the cluster: {0}")]
    Cluster(#[from] ClusterError),
    #[error("cannot load logging configuration: {0}")]
    Logging(#[source] backend::Error),
    #[error("cannot create event transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = AtomicLevel::default();
    if let Err(err) = install_logger(level.clone()) {
        eprintln!("cannot install logger: {err}");
        return ExitCode::FAILURE;
    }

    match run(cli, level).await {
        Ok(()) => {
            log::info!("Exiting");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("{err}");
            log::logger().flush();
            ExitCode::FAILURE
        }
    }
}

/// Name of the copy of a system configuration object propagated by the eventing controller.
fn propagated(name: &str) -> String {
    format!("eventing-{name}")
}

/// Delivered while the object does not exist, so every controller falls back to its defaults.
fn empty_source(name: String) -> ConfigSnapshot {
    ConfigSnapshot {
        name,
        ..ConfigSnapshot::default()
    }
}

async fn run(cli: Cli, level: AtomicLevel) -> Result<(), Fatal> {
    run_with(cli, level, |key| env::var(key).ok()).await
}

/// Brings the ingress up with the environment read through `lookup`.
///
/// Nothing is spawned and the cluster is not contacted until the environment is valid.
async fn run_with(
    cli: Cli,
    level: AtomicLevel,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), Fatal> {
    let env = EnvironmentConfig::from_lookup(lookup)?;

    let lifecycle = LifecycleController::new();
    lifecycle.listen_for_signals().map_err(Fatal::Signals)?;

    let cluster = ClusterConfig {
        master_url: cli.master,
        kubeconfig: cli.kubeconfig,
    };
    let client = cluster.client().await?;
    let backend = KubeBackend::new(client.clone(), &env.system_namespace);

    let logging = Arc::new(LogController::new(level, COMPONENT));
    let logging_source = propagated("config-logging");
    let cancel = lifecycle.cancel_token();
    tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        loaded = logging.preload(&backend, &logging_source) => {
            loaded.map_err(Fatal::Logging)?;
        }
    }
    log::info!("Starting the broker ingress in pod {}", env.pod_name);

    let metrics = Arc::new(MetricsExporterController::new(ExporterOptions::new(COMPONENT)));
    let tracing = Arc::new(TracePublisherController::new(format!(
        "cluster-broker-ingress.{}",
        env.system_namespace
    )));

    let mut watcher = ConfigSourceWatcher::new(backend);
    watcher.watch_with_default(empty_source(propagated("config-observability")), {
        let metrics = Arc::clone(&metrics);
        move |snapshot| metrics.apply_update(snapshot)
    });
    watcher.watch_with_default(empty_source(logging_source), {
        let logging = Arc::clone(&logging);
        move |snapshot| logging.apply_update(snapshot)
    });
    watcher.watch_with_default(empty_source(propagated("config-tracing")), {
        let tracing = Arc::clone(&tracing);
        move |snapshot| tracing.apply_update(snapshot)
    });

    let resource = BrokerStore::broker_resource();
    let brokers = ReflectorInformer::with(
        "brokers",
        Api::<DynamicObject>::all_with(client, &resource),
        watcher::Config::default(),
        resource.clone(),
    );
    let broker_store = BrokerStore::new(brokers.store(), resource);
    let mut informers = InformerCoordinator::new();
    informers.register(brokers);

    let ingress = HttpIngress::new(
        env.port,
        broker_store,
        TransportClient::new(ConnectionArgs::default())?,
        TtlDefaulter::new(DEFAULT_TTL),
        StatsReporter::new(env.container_name.clone(), &env.pod_name, Arc::clone(&metrics)),
        Arc::clone(&tracing),
    );

    lifecycle
        .run(Components {
            watcher,
            informers,
            ingress,
            metrics,
            tracing,
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn environment_is_validated_before_the_cluster_is_contacted() {
        let cli = Cli {
            master: None,
            kubeconfig: Some(PathBuf::from("/nonexistent/kubeconfig")),
        };

        let err = run_with(cli, AtomicLevel::default(), |_| None)
            .await
            .unwrap_err();
        assert!(matches!(err, Fatal::Env(EnvError::Missing("POD_NAME"))), "{err}");
    }

    #[tokio::test]
    async fn unreadable_kubeconfig_is_fatal_once_environment_is_valid() {
        let cli = Cli {
            master: None,
            kubeconfig: Some(PathBuf::from("/nonexistent/kubeconfig")),
        };
        let lookup = |key: &str| match key {
            "POD_NAME" => Some("ingress-0".to_owned()),
            "CONTAINER_NAME" => Some("ingress".to_owned()),
            _ => None,
        };

        let err = run_with(cli, AtomicLevel::default(), lookup)
            .await
            .unwrap_err();
        assert!(matches!(err, Fatal::Cluster(_)), "{err}");
    }

    #[test]
    fn flags_are_optional() {
        let cli = Cli::try_parse_from(["broker-ingress", "--master", "https://10.0.0.1"]).unwrap();
        assert_eq!(cli.master.as_deref(), Some("https://10.0.0.1"));
    }
}
