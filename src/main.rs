use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use fast_sandbox::agent_control::{AgentControlConfig, AgentControlLoop};
use fast_sandbox::agent_rpc::HttpAgentRpc;
use fast_sandbox::cluster::ClusterApi;
use fast_sandbox::config::Config;
use fast_sandbox::container_runtime::DockerContainerRuntime;
use fast_sandbox::fastpath::{self, FastPathConfig, FastPathServer};
use fast_sandbox::janitor::{Janitor, JanitorConfig};
use fast_sandbox::model::ConsistencyMode;
use fast_sandbox::reconcile::{pool, sandbox};
use fast_sandbox::registry::Registry;

#[derive(Parser)]
#[command(name = "fast-sandbox")]
#[command(about = "Control-plane nucleus for sub-50ms container sandbox creation")]
#[command(version)]
struct Cli {
    /// Path to fast-sandbox.toml (defaults built in if absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane: Fast-Path server, reconcilers, Agent-Control
    /// Loop, and Node Janitor, until interrupted.
    Run,
    /// Print the Sandbox and Pool CRD manifests to stdout.
    Crds,
    /// Parse and validate a config file, printing the resolved values.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Crds => {
            let (sandbox_crd, pool_crd) = generate_crds()?;
            println!("{sandbox_crd}\n---\n{pool_crd}");
        }
        Commands::CheckConfig => {
            println!("{config:#?}");
        }
        Commands::Run => {
            run_control_plane(config).await?;
        }
    }

    Ok(())
}

#[cfg(feature = "kubernetes")]
fn generate_crds() -> Result<(String, String)> {
    fast_sandbox::cluster::generate_crd_manifests()
}

#[cfg(not(feature = "kubernetes"))]
fn generate_crds() -> Result<(String, String)> {
    bail!("the `kubernetes` feature is disabled; rebuild with --features kubernetes to emit CRD manifests")
}

#[cfg(feature = "kubernetes")]
async fn build_cluster_api() -> Result<Arc<dyn ClusterApi>> {
    let client = kube::Client::try_default()
        .await
        .context("failed to build a Kubernetes client from the ambient kubeconfig/in-cluster config")?;
    Ok(Arc::new(fast_sandbox::cluster::KubeClusterApi::new(client)))
}

#[cfg(not(feature = "kubernetes"))]
async fn build_cluster_api() -> Result<Arc<dyn ClusterApi>> {
    bail!("the `kubernetes` feature is disabled; no cluster backend is available")
}

async fn run_control_plane(config: Config) -> Result<()> {
    let cluster = build_cluster_api().await?;
    let registry = Arc::new(Registry::new());
    let agent_rpc = Arc::new(HttpAgentRpc::new());
    let shutdown = CancellationToken::new();

    let consistency_mode = match config.fastpath.fastpath_consistency_mode.as_str() {
        "STRONG" => ConsistencyMode::Strong,
        "FAST" => ConsistencyMode::Fast,
        other => bail!("invalid fastpath.fastpath_consistency_mode: {other} (expected FAST or STRONG)"),
    };

    let fastpath_server = Arc::new(FastPathServer::new(
        registry.clone(),
        cluster.clone(),
        agent_rpc.clone(),
        FastPathConfig {
            default_consistency_mode: consistency_mode,
            agent_timeout: Duration::from_secs(config.agent_control.per_agent_timeout_secs),
            durable_write_window: Duration::from_secs(config.fastpath.fastpath_orphan_timeout_secs),
            default_recovery_timeout_seconds: config.agent_control.recovery_timeout_seconds,
        },
    ));

    let sandbox_ctx = Arc::new(sandbox::ReconcileContext {
        registry: registry.clone(),
        cluster: cluster.clone(),
        agent_rpc: agent_rpc.clone(),
        config: sandbox::SandboxReconcileConfig {
            agent_timeout: Duration::from_secs(config.agent_control.per_agent_timeout_secs),
            ..Default::default()
        },
    });
    let sandbox_tick = sandbox_ctx.config.requeue_interval;

    let pool_ctx = Arc::new(pool::PoolReconcileContext {
        registry: registry.clone(),
        cluster: cluster.clone(),
        config: pool::PoolReconcileConfig::default(),
    });
    let pool_tick = pool_ctx.config.requeue_interval;

    let agent_control = Arc::new(AgentControlLoop::new(
        registry.clone(),
        cluster.clone(),
        agent_rpc.clone(),
        AgentControlConfig {
            tick: Duration::from_secs(config.agent_control.agent_control_interval_secs),
            per_agent_timeout: Duration::from_secs(config.agent_control.per_agent_timeout_secs),
            stale_agent_timeout: Duration::from_secs(config.agent_control.stale_agent_timeout_secs),
            agent_port: config.agent.agent_port,
        },
    ));

    let container_runtime = Arc::new(DockerContainerRuntime::new(config.janitor.container_runtime_bin.clone()));
    let janitor = Arc::new(Janitor::new(
        cluster.clone(),
        container_runtime,
        JanitorConfig {
            scan_interval: Duration::from_secs(config.janitor.scan_interval_secs),
            orphan_timeout: Duration::from_secs(config.fastpath.fastpath_orphan_timeout_secs),
        },
    ));

    let addr: SocketAddr = config.fastpath.listen_addr.parse().context("invalid fastpath.listen_addr")?;

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move { fastpath::serve(addr, fastpath_server, shutdown).await }
    });
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move {
            sandbox::run(sandbox_ctx, sandbox_tick, shutdown).await;
            Ok(())
        }
    });
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move {
            pool::run(pool_ctx, pool_tick, shutdown).await;
            Ok(())
        }
    });
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move {
            agent_control.run(shutdown).await;
            Ok(())
        }
    });
    tasks.spawn({
        let shutdown = shutdown.clone();
        async move {
            janitor.run(shutdown).await;
            Ok(())
        }
    });

    info!(addr = %addr, "fast-sandbox control plane running");

    tokio::signal::ctrl_c().await.ok();
    info!("received shutdown signal");
    shutdown.cancel();

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                tracing::error!(error = %e, "a control-plane task panicked");
            }
        }
    }

    Ok(())
}
