//! thing-jobs CLI: run the jobs agent for one thing, or list its pending jobs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thing_jobs::agent::{CiVerdict, JobsAgent};
use thing_jobs::config::{AgentConfig, Config};
use thing_jobs::service::{JobsFile, SimulatedJobsService};
use thing_jobs::shutdown::install_signal_handler;
use thing_jobs::slot::{CommandExecutor, JobExecutor, SleepExecutor};
use thing_jobs::telemetry::{TelemetryConfig, init_telemetry};
use thing_jobs::transport::Transport;
use thing_jobs::transport::memory::MemoryBroker;
use thing_jobs::transport::mqtt::MqttTransport;

#[derive(Parser)]
#[command(name = "thing-jobs", about = "Single-flight job agent for IoT things")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Target {
    /// Thing whose jobs to process
    #[arg(long)]
    thing_name: String,
    /// Use an in-process jobs service instead of an MQTT broker
    #[arg(long)]
    simulate: bool,
    /// TOML file with jobs to seed the simulated service with
    #[arg(long, requires = "simulate")]
    jobs_file: Option<PathBuf>,
    /// Deadline for directly awaited responses, in seconds
    #[arg(long, default_value_t = 10.0)]
    response_timeout: f64,
}

#[derive(Subcommand)]
enum Command {
    /// Process jobs until interrupted (or until idle)
    Run {
        #[command(flatten)]
        target: Target,
        /// Seconds of emulated work per job
        #[arg(long, default_value_t = 5.0)]
        job_time: f64,
        /// List pending jobs and exit: 0 if any are pending, 1 otherwise
        #[arg(long)]
        ci: bool,
        /// Exit once the service reports no pending job
        #[arg(long)]
        exit_when_idle: bool,
        /// Run `{"operation": "run", "command": ...}` documents as processes
        #[arg(long)]
        command_jobs: bool,
    },
    /// Print the pending jobs of a thing
    List {
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "thing-jobs".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let code = match cli.command {
        Command::Run {
            target,
            job_time,
            ci,
            exit_when_idle,
            command_jobs,
        } => {
            let agent_config = AgentConfig::new(&target.thing_name)
                .job_time(seconds(job_time)?)
                .ci(ci)
                .exit_when_idle(exit_when_idle)
                .response_timeout(seconds(target.response_timeout)?);
            if command_jobs {
                cmd_run(&config, &target, agent_config, CommandExecutor::new(&target.thing_name))
                    .await?
            } else {
                let executor = SleepExecutor::new(agent_config.job_time);
                cmd_run(&config, &target, agent_config, executor).await?
            }
        }
        Command::List { target } => cmd_list(&config, &target).await?,
    };

    guard.force_flush();
    drop(guard);
    std::process::exit(code);
}

fn seconds(value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|e| anyhow::anyhow!("invalid duration {value}: {e}"))
}

async fn cmd_run<E: JobExecutor>(
    config: &Config,
    target: &Target,
    agent_config: AgentConfig,
    executor: E,
) -> anyhow::Result<i32> {
    if target.simulate {
        let broker = MemoryBroker::new();
        let _service = start_simulator(&broker, target).await?;
        let transport = Arc::new(broker.connect(&config.client_id));
        Ok(drive(transport, executor, agent_config).await)
    } else {
        let transport = Arc::new(MqttTransport::connect(config.mqtt_settings()?).await?);
        Ok(drive(transport, executor, agent_config).await)
    }
}

async fn drive<T: Transport, E: JobExecutor>(
    transport: Arc<T>,
    executor: E,
    config: AgentConfig,
) -> i32 {
    let ci = config.ci;
    let agent = JobsAgent::new(transport, executor, config);
    install_signal_handler(agent.shutdown().clone());

    if ci {
        let verdict = agent.run_ci().await;
        if let CiVerdict::Error(ref reason) = verdict {
            eprintln!("error: {reason}");
        }
        return verdict.exit_code();
    }

    let outcome = agent.run().await;
    if let Some(ref e) = outcome.disconnect_error {
        eprintln!("warning: disconnect failed: {e}");
    }
    if outcome.reason.is_error() {
        eprintln!("error: {}", outcome.reason);
        1
    } else {
        0
    }
}

async fn start_simulator(broker: &MemoryBroker, target: &Target) -> anyhow::Result<SimulatedJobsService> {
    let file = match target.jobs_file {
        Some(ref path) => JobsFile::load(path)?,
        None => demo_jobs()?,
    };
    Ok(SimulatedJobsService::start_seeded(broker, &target.thing_name, &file).await?)
}

fn demo_jobs() -> anyhow::Result<JobsFile> {
    Ok(JobsFile::parse(
        r#"
        [[job]]
        id = "demo-1"
        document = { operation = "run", command = "true" }

        [[job]]
        id = "demo-2"
        document = { operation = "run", command = "echo", args = ["hello from demo-2"] }
        "#,
    )?)
}

async fn cmd_list(config: &Config, target: &Target) -> anyhow::Result<i32> {
    let agent_config =
        AgentConfig::new(&target.thing_name).response_timeout(seconds(target.response_timeout)?);
    if target.simulate {
        let broker = MemoryBroker::new();
        let _service = start_simulator(&broker, target).await?;
        let transport = Arc::new(broker.connect(&config.client_id));
        list(transport, agent_config).await
    } else {
        let transport = Arc::new(MqttTransport::connect(config.mqtt_settings()?).await?);
        list(transport, agent_config).await
    }
}

async fn list<T: Transport>(transport: Arc<T>, config: AgentConfig) -> anyhow::Result<i32> {
    let thing = config.thing_name.clone();
    let timeout = config.response_timeout;
    let agent = JobsAgent::new(Arc::clone(&transport), SleepExecutor::new(config.job_time), config);
    let pending = agent.client().get_pending_job_executions(timeout).await;
    transport.disconnect().await.ok();
    let pending = pending?;

    if pending.is_empty() {
        println!("No pending jobs for {thing}.");
        return Ok(0);
    }

    println!("{:<36}  {:<12}  {:<8}  LAST UPDATED", "JOB ID", "STATUS", "VERSION");
    println!("{}", "-".repeat(80));
    let rows = pending
        .in_progress_jobs
        .iter()
        .map(|j| (j, "IN_PROGRESS"))
        .chain(pending.queued_jobs.iter().map(|j| (j, "QUEUED")));
    for (job, status) in rows {
        println!(
            "{:<36}  {:<12}  {:<8}  {}",
            job.job_id.as_str(),
            status,
            job.version_number
                .map(|n| n.to_string())
                .unwrap_or("-".to_string()),
            job.last_updated_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or("-".to_string())
        );
    }
    println!("\n{} job(s)", pending.len());
    Ok(0)
}
