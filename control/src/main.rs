use anyhow::Result;
use clap::Parser;

mod app;
mod args;
mod auth;
mod cli;
mod client;
mod db;
mod metrics;
mod models;
mod orchestrator;
mod queue;
mod registration;
mod registry;
mod relay;
mod selector;
mod server;
mod telemetry;
mod workflow;

pub mod proto {
    pub mod relay {
        tonic::include_proto!("relay");
    }
}

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tessera_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => {
            tessera_common::metrics::maybe_spawn_metrics_server();
            server::run_server(args).await
        }
        Commands::Bootstrap(args) => cli::run_bootstrap(args).await,
        Commands::RegisterAgent(args) => cli::run_register_agent(args).await,
        Commands::Agents(args) => cli::run_agents(args).await,
        Commands::Execute(args) => cli::run_execute(args).await,
        Commands::GetExecution(args) => cli::run_get_execution(args).await,
        Commands::Queues(args) => cli::run_queues(args).await,
        Commands::Peek(args) => cli::run_peek(args).await,
        Commands::DrainCluster(args) => cli::run_drain_cluster(args).await,
        Commands::Health(args) => cli::run_health(args).await,
    }
}
