use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use votegate_core::{SqliteStore, DEFAULT_DESCRIPTOR_DIM};

#[zbus::proxy(
    interface = "org.votegate.Kiosk1",
    default_service = "org.votegate.Kiosk1",
    default_path = "/org/votegate/Kiosk1"
)]
trait Kiosk {
    async fn start_session(&self) -> zbus::Result<()>;
    async fn stop_session(&self) -> zbus::Result<()>;
    async fn submit(&self, name: &str, voter_id: &str, candidate_id: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn candidates(&self) -> zbus::Result<String>;
    async fn tally(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "votegate", about = "votegate kiosk operator CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the capture session
    Start,
    /// Stop the capture session
    Stop,
    /// Show daemon and session status
    Status,
    /// Submit a ballot for the face currently in front of the camera
    Submit {
        #[arg(long)]
        name: String,
        #[arg(long)]
        voter_id: String,
        /// Candidate ID (see `votegate candidates`)
        #[arg(long)]
        candidate: Option<String>,
    },
    /// List the ballot's candidates
    Candidates,
    /// Show votes per candidate
    Tally,
    /// Check the ledger store for inconsistencies (offline)
    Audit {
        #[arg(long, env = "VOTEGATE_DB_PATH")]
        db: Option<PathBuf>,
        /// Expected descriptor length
        #[arg(long, env = "VOTEGATE_DESCRIPTOR_DIM", default_value_t = DEFAULT_DESCRIPTOR_DIM)]
        dim: usize,
    },
    /// List recorded voters (offline)
    Voters {
        #[arg(long, env = "VOTEGATE_DB_PATH")]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            kiosk(cli.session_bus).await?.start_session().await?;
            println!("Session started");
        }
        Commands::Stop => {
            kiosk(cli.session_bus).await?.stop_session().await?;
            println!("Session stopped");
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&kiosk(cli.session_bus).await?.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Submit {
            name,
            voter_id,
            candidate,
        } => {
            let reply = kiosk(cli.session_bus)
                .await?
                .submit(&name, &voter_id, candidate.as_deref().unwrap_or(""))
                .await?;
            print_submit_reply(&serde_json::from_str(&reply)?);
        }
        Commands::Candidates => {
            let candidates: Value = serde_json::from_str(&kiosk(cli.session_bus).await?.candidates().await?)?;
            for c in candidates.as_array().into_iter().flatten() {
                println!("{:<10} {}", c["id"].as_str().unwrap_or("?"), c["name"].as_str().unwrap_or(""));
            }
        }
        Commands::Tally => {
            let rows: Value = serde_json::from_str(&kiosk(cli.session_bus).await?.tally().await?)?;
            for row in rows.as_array().into_iter().flatten() {
                println!(
                    "{:<10} {:<24} {}",
                    row["id"].as_str().unwrap_or("?"),
                    row["name"].as_str().unwrap_or(""),
                    row["votes"].as_u64().unwrap_or(0)
                );
            }
        }
        Commands::Audit { db, dim } => audit(&open_store(db)?, dim)?,
        Commands::Voters { db } => voters(&open_store(db)?)?,
    }

    Ok(())
}

/// Connect to the daemon. Uses a method timeout so a stuck daemon cannot hang the CLI.
async fn kiosk(session_bus: bool) -> Result<KioskProxy<'static>> {
    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(10))
        .build()
        .await
        .context("failed to connect to D-Bus")?;
    KioskProxy::new(&conn)
        .await
        .context("failed to reach votegated; is it running?")
}

fn print_submit_reply(reply: &Value) {
    let message = reply["message"].as_str().unwrap_or("");
    let outcome = &reply["outcome"];
    if let Some(receipt) = outcome.get("Accepted") {
        println!(
            "Vote accepted for {} (receipt {})",
            receipt["voter_id"].as_str().unwrap_or("?"),
            receipt["receipt_id"].as_str().unwrap_or("?")
        );
    } else if outcome.get("Rejected").is_some() {
        println!("Vote rejected: {message}");
    } else {
        println!("Submission blocked: {message}");
    }
}

fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("votegate/ledger.db")
}

/// Open an existing store; offline commands never create one.
fn open_store(db: Option<PathBuf>) -> Result<SqliteStore> {
    let path = db.unwrap_or_else(default_db_path);
    if !Path::new(&path).exists() {
        bail!("no ledger store at {}", path.display());
    }
    Ok(SqliteStore::open(&path)?)
}

fn audit(store: &SqliteStore, dim: usize) -> Result<()> {
    let report = store.audit(dim)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        bail!("audit found inconsistencies");
    }
    println!("Audit clean: {} voters, {} enrolled faces", report.voters, report.enrolled);
    Ok(())
}

fn voters(store: &SqliteStore) -> Result<()> {
    let records = store.load_ledger()?;
    if records.is_empty() {
        println!("No votes recorded");
        return Ok(());
    }
    for record in &records {
        let Some(ballot) = record.ballot() else {
            continue;
        };
        println!(
            "{:<12} {:<24} {:<10} {} {}",
            record.identity.voter_id.as_str(),
            record.identity.name,
            ballot.candidate.as_str(),
            ballot.cast_at.to_rfc3339(),
            ballot.receipt_id
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_submit_args() {
        let cli = Cli::try_parse_from([
            "votegate", "submit", "--name", "Ada", "--voter-id", "A123", "--candidate", "C1",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit { name, voter_id, candidate } => {
                assert_eq!((name.as_str(), voter_id.as_str()), ("Ada", "A123"));
                assert_eq!(candidate.as_deref(), Some("C1"));
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn test_open_store_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_store(Some(dir.path().join("missing.db"))).is_err());
    }
}
