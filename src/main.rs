use anyhow::Result;
use clap::Parser;
use sandvm::cli::Commands;
use sandvm::{cli, commands, paths};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = cli::Cli::parse();

    // Initialize base directory from CLI argument (must be done before any path access)
    paths::init_base_dir(cli.base_dir.as_deref());

    // Only use colors when outputting to a TTY (not when piped to file)
    let use_color = atty::is(atty::Stream::Stdout);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(true)
        .with_ansi(use_color)
        .init();

    let config = cli.config.as_deref();
    let result = match cli.cmd {
        Commands::Run(args) => commands::cmd_run(args, config).await,
        Commands::Console(args) => commands::cmd_console(args).await,
        Commands::Destroy(args) => commands::cmd_destroy(args, config).await,
        Commands::Ls(args) => commands::cmd_ls(args).await,
        Commands::Config(args) => commands::cmd_config(args),
        Commands::Completions(args) => {
            commands::cmd_completions(args);
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}
