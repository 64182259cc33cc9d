use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod client;
mod commands;
mod format;

use client::Client;

#[derive(Parser)]
#[command(name = "mmvmmctl")]
#[command(about = "Control client for mmvmmd", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (table or json)
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Path to the control socket. Defaults to `$SOCKET_DIR/control.sock`.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new VM from a JSON description file
    New { description: PathBuf },
    /// Delete a stopped VM
    Delete { name: String },
    /// List all VMs
    List,
    /// Show one VM's details
    Show { name: String },
    /// Print "running" or "stopped" for one VM
    IsRunning { name: String },
    /// Start a VM
    Start { name: String },
    /// Gracefully power off a running VM
    Poweroff { name: String },
    /// Reset a running VM
    Reset { name: String },
    /// Terminate a VM, optionally forcefully
    Terminate {
        name: String,
        #[arg(long)]
        kill: bool,
    },
    /// Pause a running VM (QMP stop)
    Pause { name: String },
    /// Resume a paused VM (QMP cont)
    Resume { name: String },
    /// Toggle whether a VM autostarts with the daemon
    SetAutostart { name: String, autostart: bool },
    /// Hot-add a NIC to a stopped VM
    AddNic {
        name: String,
        #[arg(long)]
        mac: String,
        #[arg(long)]
        master: String,
        #[arg(long, default_value_t = 1500)]
        mtu: u32,
    },
    /// Hot-remove a NIC from a stopped VM
    DelNic { name: String, nic_id: i64 },
    /// Attach a media device to a stopped VM
    AddMedia {
        name: String,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        path: String,
        #[arg(long, default_value = "raw")]
        format: String,
        #[arg(long)]
        readonly: bool,
    },
    /// Detach a media device from a stopped VM
    DelMedia { name: String, media_id: i64 },
    /// Replace a stopped VM's hardware description from a JSON file
    UpdateHardware { name: String, description: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = cli.socket.unwrap_or_else(client::default_socket_path);
    let client = Client::new(socket_path);

    match cli.command {
        Commands::New { description } => commands::lifecycle::new(&client, &description).await,
        Commands::Delete { name } => commands::lifecycle::delete(&client, name).await,
        Commands::List => commands::list::execute(&client, &cli.format).await,
        Commands::Show { name } => commands::show::execute(&client, name, &cli.format).await,
        Commands::IsRunning { name } => commands::show::is_running(&client, name).await,
        Commands::Start { name } => commands::lifecycle::start(&client, name).await,
        Commands::Poweroff { name } => commands::lifecycle::poweroff(&client, name).await,
        Commands::Reset { name } => commands::lifecycle::reset(&client, name).await,
        Commands::Terminate { name, kill } => commands::lifecycle::terminate(&client, name, kill).await,
        Commands::Pause { name } => commands::lifecycle::pause(&client, name).await,
        Commands::Resume { name } => commands::lifecycle::resume(&client, name).await,
        Commands::SetAutostart { name, autostart } => {
            commands::lifecycle::set_autostart(&client, name, autostart).await
        }
        Commands::AddNic { name, mac, master, mtu } => {
            commands::hardware::add_nic(&client, name, mac, master, mtu).await
        }
        Commands::DelNic { name, nic_id } => commands::hardware::del_nic(&client, name, nic_id).await,
        Commands::AddMedia {
            name,
            kind,
            path,
            format,
            readonly,
        } => commands::hardware::add_media(&client, name, kind, path, format, readonly).await,
        Commands::DelMedia { name, media_id } => commands::hardware::del_media(&client, name, media_id).await,
        Commands::UpdateHardware { name, description } => {
            commands::hardware::update_hardware(&client, name, description).await
        }
    }
}
