use clap::Parser;
use clap::Subcommand;

use super::run::RunArgs;

#[derive(Parser)]
#[command(
    about = "Virtual node agent",
    long_about = "Registers a virtual node with a Kubernetes cluster and runs the pods scheduled onto it through a pluggable provider.",
    version = &**utils::version::VERSION
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register the node and reconcile its pods until interrupted
    Run(Box<RunArgs>),
    /// List the providers built into this binary
    Providers,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn providers_subcommand_parses() {
        let cli = Cli::try_parse_from(["virtual-node", "providers"]).unwrap();
        assert!(matches!(cli.command, Commands::Providers));
    }
}
