use anyhow::Context;
use clap::Parser;
use labgpu::agent::sampler::{NvmlSampler, ProcessSampler};
use labgpu::agent::Agent;
use labgpu::core::policy::load_policy;
use labgpu::core::scheduler::Scheduler;
use labgpu::master::MasterBuilder;
use labgpu::runtime::{Runtime, RuntimeSettings};
use tracing_appender::non_blocking::WorkerGuard;

mod cli;

#[cfg(target_arch = "x86_64")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Console (stderr) plus a daily rolling file under `<data_dir>/logs`.
fn init_tracing(labgpud: &cli::LabGpud) -> anyhow::Result<WorkerGuard> {
    let log_dir = labgpu::core::get_data_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("daemon")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&log_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(tracing_subscriber::filter::LevelFilter::from(
            labgpud.verbosity,
        ))
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let labgpud = cli::LabGpud::parse();
    let _guard = init_tracing(&labgpud)?;

    let config = labgpu::config::load_config(labgpud.config.as_ref())?;
    let mut policy = config.scheduler_policy()?;
    if let Some(path) = &labgpud.policy {
        match load_policy(path)? {
            Some(overrides) => policy.apply(&overrides)?,
            None => tracing::warn!("Policy file {} not found, using defaults", path.display()),
        }
    }
    tracing::info!("Scheduling policy: {:?}", policy);

    let mut agent = Agent::new();
    if let Some(profile) = &config.daemon.conda_profile {
        agent = agent.with_conda_profile(profile.clone());
    }

    let mut master = MasterBuilder::new()
        .with_scheduler(Scheduler::new(policy))
        .with_agent(agent)
        .with_history_capacity(config.daemon.history_capacity)
        .build();

    for registration in config.nodes.iter().cloned() {
        let name = master.register_request(registration);
        tracing::info!("Registered node {}", name);
    }

    let mut sampler: Option<Box<dyn ProcessSampler>> = None;
    if config.daemon.discover_local_gpus {
        match NvmlSampler::init() {
            Ok(nvml) => {
                let node = nvml.discover_node(
                    config.daemon.node_name(),
                    config.daemon.gpu_type.as_deref(),
                )?;
                tracing::info!("Discovered {} local GPU(s) on {}", node.gpus.len(), node.name);
                master.register_node(node);
                sampler = Some(Box::new(nvml));
            }
            Err(e) => tracing::warn!("Local GPU discovery disabled: {:#}", e),
        }
    }

    if master.nodes().is_empty() {
        tracing::warn!("No nodes registered; tasks will stay pending");
    }

    let settings = RuntimeSettings::from_config(&config.daemon)?;
    tracing::info!("Task logs go to {}", settings.log_root.display());
    let (runtime, events) = Runtime::new(master, settings);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    };
    runtime.run(events, sampler, shutdown).await;

    let drained = runtime
        .drain(config.daemon.soft_timeout(), config.daemon.term_timeout())
        .await;
    if drained > 0 {
        tracing::info!("Preempted {} running task(s) before exit", drained);
    }
    Ok(())
}
