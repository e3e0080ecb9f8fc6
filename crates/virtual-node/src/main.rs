use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use utils::logging;
use utils::version;
use virtual_node::config::AgentConfig;
use virtual_node::config::Cli;
use virtual_node::config::Commands;
use virtual_node::config::RunArgs;
use virtual_node::provider::ProviderRegistry;
use virtual_node::Orchestrator;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(run_args) => run_agent(*run_args).await,
        Commands::Providers => {
            for name in ProviderRegistry::with_builtin().names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

async fn run_agent(run_args: RunArgs) -> Result<()> {
    let _guard = logging::init(run_args.log_dir.clone());

    tracing::info!("Starting virtual node agent {}", &**version::VERSION);

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    let orchestrator = Orchestrator::new(AgentConfig::from(&run_args));
    if let Err(report) = orchestrator
        .run_with_registry(token, &ProviderRegistry::with_builtin(), None)
        .await
    {
        tracing::error!("Virtual node agent failed: {report:?}");
        return Err(anyhow::anyhow!("{report:?}"));
    }

    tracing::info!("Virtual node agent stopped");
    Ok(())
}

/// Cancels `token` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
            }
            token.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {e}");
                return;
            }
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            token.cancel();
        });
    }
    Ok(())
}
