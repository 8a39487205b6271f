use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sandvm",
    version,
    about = "Disposable Debian sandbox VMs driven through VirtualBox"
)]
pub struct Cli {
    /// Base directory for state and console sockets
    #[arg(long, global = true)]
    pub base_dir: Option<String>,

    /// Config file (default: search user and system locations)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create and boot a sandbox, then tear it down
    Run(RunArgs),
    /// Read a serial console socket until a signature appears
    Console(ConsoleArgs),
    /// Destroy a sandbox left behind by a previous run
    Destroy(NameArgs),
    /// List recorded sandboxes
    Ls(LsArgs),
    /// Write the default config file
    Config(ConfigArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Boot disk image (VDI/VMDK)
    #[arg(long)]
    pub image: PathBuf,

    /// Guest architecture: x86 | amd64
    #[arg(long, default_value = "amd64")]
    pub arch: String,

    /// Debian release codename or version (e.g. bullseye, 11)
    #[arg(long)]
    pub release: String,

    /// Sandbox name (default: generated)
    #[arg(long)]
    pub name: Option<String>,

    /// Keep the sandbox running until interrupted
    #[arg(long)]
    pub hold: bool,

    /// Print the boot console transcript
    #[arg(long)]
    pub print_console: bool,

    /// Override the boot timeout from the config
    #[arg(long)]
    pub boot_timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct ConsoleArgs {
    /// Console socket path
    #[arg(long)]
    pub path: PathBuf,

    /// Text to wait for
    #[arg(long)]
    pub signature: String,

    /// Seconds to wait before giving up
    #[arg(long, default_value_t = 120)]
    pub timeout: u64,

    #[arg(long, default_value_t = 500)]
    pub poll_interval_ms: u64,
}

#[derive(Args, Debug)]
pub struct NameArgs {
    /// Sandbox name
    #[arg(long, short)]
    pub name: String,
}

#[derive(Args, Debug)]
pub struct LsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}
