//! `hadir`: command-line client for the hadird attendance daemon.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hadir_core::Descriptor;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hadir")]
#[command(version)]
#[command(about = "Face attendance: register people, inspect attendance, daemon status", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Talk to a daemon on the session bus (development mode)
    #[arg(long, global = true)]
    session: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what the kiosk is currently displaying
    Status,

    /// Show attendance totals and the most recent records
    Stats,

    /// List registered users
    Users,

    /// Show attendance history for one label
    History {
        label: String,
    },

    /// Register a person from a precomputed face descriptor
    Register {
        /// Unique identifier, e.g. a student number
        #[arg(long)]
        label: String,

        /// Display name
        #[arg(long)]
        name: String,

        /// JSON file holding the 128-float descriptor ('-' reads stdin)
        #[arg(long)]
        descriptor: PathBuf,
    },

    /// Remove a registered user by ID
    Remove {
        id: String,
    },
}

#[zbus::proxy(
    interface = "org.hadir.Attendance1",
    default_service = "org.hadir.Attendance1",
    default_path = "/org/hadir/Attendance1"
)]
trait Attendance {
    fn register(&self, label: &str, name: &str, descriptor_json: &str) -> zbus::Result<String>;
    fn remove_user(&self, id: &str) -> zbus::Result<bool>;
    fn list_users(&self) -> zbus::Result<String>;
    fn history(&self, label: &str) -> zbus::Result<String>;
    fn stats(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

/// Read and validate a descriptor before it crosses the bus.
fn read_descriptor(path: &Path) -> Result<String> {
    let raw = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read descriptor from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?
    };
    let descriptor = Descriptor::from_json(raw.trim())
        .with_context(|| format!("invalid descriptor in {}", path.display()))?;
    serde_json::to_string(&descriptor).context("failed to encode descriptor")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("hadird is not reachable; is the daemon running?")?;

    match cli.command {
        Commands::Status => print_json(&proxy.status().await?),
        Commands::Stats => print_json(&proxy.stats().await?),
        Commands::Users => print_json(&proxy.list_users().await?),
        Commands::History { label } => print_json(&proxy.history(&label).await?),
        Commands::Register {
            label,
            name,
            descriptor,
        } => {
            let descriptor_json = read_descriptor(&descriptor)?;
            tracing::debug!(label = %label, "registering");
            let id = proxy.register(&label, &name, &descriptor_json).await?;
            println!("registered {name} ({label}) as {id}");
            Ok(())
        }
        Commands::Remove { id } => {
            if !proxy.remove_user(&id).await? {
                bail!("no user with id {id}");
            }
            println!("removed {id}");
            Ok(())
        }
    }
}
