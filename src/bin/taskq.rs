//! taskq CLI: operator interface to a queue.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;
use taskq::backend::RedisBackend;
use taskq::config::{Config, Timeout};
use taskq::telemetry::{TelemetryConfig, init_telemetry};
use taskq::{Client, Priority, TaskId, TaskOutput};

#[derive(Parser)]
#[command(name = "taskq", about = "Submit and inspect tasks on a taskq queue")]
struct Cli {
    /// TOML config file. Without it, configuration comes from the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Queue name, overriding the configured one
    #[arg(long, global = true)]
    queue: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a task and print its id
    Submit {
        /// JSON input
        input: String,
        /// high, medium or low
        #[arg(long)]
        priority: Option<Priority>,
    },
    /// Show a task's status and output
    Status {
        /// Task id
        id: String,
    },
    /// Submit a task and wait for its output
    Await {
        /// JSON input
        input: String,
        /// high, medium or low
        #[arg(long)]
        priority: Option<Priority>,
        /// Milliseconds, or "unlimited"
        #[arg(long)]
        timeout: Option<Timeout>,
    },
    /// Cancel a task that has not been taken yet
    Cancel {
        /// Task id
        id: String,
    },
    /// Show how many tasks wait in each priority lane
    Queue,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    let _guard = init_telemetry(
        TelemetryConfig::new("taskq-cli")
            .with_endpoint(config.otel_endpoint.clone())
            .with_default_filter("warn"),
    )?;

    let mut client_config = config.client;
    if let Some(name) = cli.queue {
        client_config.queue.name = name;
    }
    if let Command::Await {
        timeout: Some(timeout),
        ..
    } = &cli.command
    {
        client_config.timeout = *timeout;
    }
    let client: Client<Value, Value, RedisBackend> = Client::connect(client_config).await?;

    let result = match cli.command {
        Command::Submit { input, priority } => cmd_submit(&client, &input, priority).await,
        Command::Status { id } => cmd_status(&client, id).await,
        Command::Await {
            input, priority, ..
        } => cmd_await(&client, &input, priority).await,
        Command::Cancel { id } => cmd_cancel(&client, id).await,
        Command::Queue => cmd_queue(&client).await,
    };

    client.dispose().await?;
    result
}

fn parse_input(input: &str) -> anyhow::Result<Value> {
    serde_json::from_str(input).map_err(|e| anyhow::anyhow!("input is not valid JSON: {e}"))
}

async fn cmd_submit(
    client: &Client<Value, Value>,
    input: &str,
    priority: Option<Priority>,
) -> anyhow::Result<()> {
    let id = client.create_task(parse_input(input)?, priority).await?;
    println!("{id}");
    Ok(())
}

async fn cmd_status(client: &Client<Value, Value>, id: String) -> anyhow::Result<()> {
    let id = TaskId::from(id);
    let task = client.get_task(&id).await?;

    println!("ID:      {id}");
    println!("Status:  {}", task.status);
    match task.output {
        Some(TaskOutput::Data(data)) => {
            println!("Output:  {}", serde_json::to_string_pretty(&data)?);
        }
        Some(TaskOutput::Error(err)) => {
            println!("Error:   {}", err.message);
            for field in &err.fields {
                println!("  {field}");
            }
        }
        None => {}
    }
    Ok(())
}

async fn cmd_await(
    client: &Client<Value, Value>,
    input: &str,
    priority: Option<Priority>,
) -> anyhow::Result<()> {
    let output = client.await_task(parse_input(input)?, priority).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn cmd_cancel(client: &Client<Value, Value>, id: String) -> anyhow::Result<()> {
    let id = TaskId::from(id);
    client.cancel_task(&id).await?;
    println!("Canceled: {id}");
    Ok(())
}

async fn cmd_queue(client: &Client<Value, Value>) -> anyhow::Result<()> {
    let store = client.store();
    println!("Queue: {}", store.name());
    println!("{:<8}  PENDING", "PRIORITY");
    println!("{}", "-".repeat(18));
    for priority in Priority::ALL {
        println!("{:<8}  {}", priority.as_str(), store.pending(priority).await?);
    }
    Ok(())
}
