use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.attendance.Recognition1",
    default_service = "org.attendance.Recognition1",
    default_path = "/org/attendance/Recognition1"
)]
trait Recognition {
    async fn start_session(&self) -> zbus::Result<bool>;
    async fn stop_session(&self) -> zbus::Result<bool>;
    async fn invalidate_identity_cache(&self) -> zbus::Result<()>;
    async fn submit_frame(&self, payload: &str) -> zbus::Result<u64>;
    async fn enroll(
        &self,
        name: &str,
        roll_number: &str,
        department: &str,
        role: &str,
        encoding_json: &str,
    ) -> zbus::Result<String>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<bool>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "attendance", about = "Attendance daemon client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an attendance session
    Start,
    /// Stop the running session
    Stop,
    /// Reload enrolled identities on the next frame
    Reload,
    /// Show daemon status
    Status,
    /// List enrolled identities
    List,
    /// Enroll a new identity
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        roll_number: String,
        #[arg(short, long)]
        department: String,
        /// Teacher or Student
        #[arg(long, default_value = "Student")]
        role: String,
        /// JSON file: an encoding array, or an encoded frame with exactly one face
        #[arg(short, long)]
        encoding: PathBuf,
    },
    /// Remove an enrolled identity
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Submit one encoded frame (JSON) for recognition
    Submit {
        /// Frame file; reads stdin when omitted
        file: Option<PathBuf>,
    },
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = RecognitionProxy::new(&conn)
        .await
        .context("attendanced is not reachable")?;

    match cli.command {
        Commands::Start => {
            if proxy.start_session().await? {
                println!("Session started");
            } else {
                println!("Session was already running; presence reset");
            }
        }
        Commands::Stop => {
            if proxy.stop_session().await? {
                println!("Session stopped");
            } else {
                println!("No session was running");
            }
        }
        Commands::Reload => {
            proxy.invalidate_identity_cache().await?;
            println!("Identities will reload on the next frame");
        }
        Commands::Status => {
            println!("{}", pretty(&proxy.status().await?));
        }
        Commands::List => {
            println!("{}", pretty(&proxy.list_identities().await?));
        }
        Commands::Enroll {
            name,
            roll_number,
            department,
            role,
            encoding,
        } => {
            let encoding_json = std::fs::read_to_string(&encoding)
                .with_context(|| format!("reading {}", encoding.display()))?;
            let id = proxy
                .enroll(&name, &roll_number, &department, &role, encoding_json.trim())
                .await?;
            println!("Enrolled {name} as {id}");
        }
        Commands::Remove { id } => {
            if proxy.remove_identity(&id).await? {
                println!("Removed {id}");
            } else {
                println!("No identity with id {id}");
            }
        }
        Commands::Submit { file } => {
            let payload = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => std::io::read_to_string(std::io::stdin()).context("reading stdin")?,
            };
            let seq = proxy.submit_frame(payload.trim()).await?;
            tracing::debug!(seq, "frame submitted");
            println!("Frame {seq} submitted");
        }
    }

    Ok(())
}
