use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use votegate_core::{
    DimensionChecked, FaceGallery, GalleryJournal, LedgerJournal, SqliteStore, VoterLedger,
    VotingSession,
};
use zbus::object_server::SignalEmitter;

mod capture;
mod config;
mod dbus_interface;
mod engine;
mod extractor;
mod runner;

use capture::SpoolCapture;
use config::Config;
use dbus_interface::{KioskService, BUS_NAME, OBJECT_PATH};
use extractor::CommandExtractor;
use runner::KioskRuntime;

/// Slack on top of the extractor's own timeout before the runtime gives up on a probe.
const ENGINE_GRACE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "votegated starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        spool = %config.spool_dir.display(),
        threshold = config.match_threshold,
        dim = config.descriptor_dim,
        candidates = config.candidates.len(),
        "configuration loaded"
    );

    // Fail fast: the kiosk must not take votes without a working extractor.
    let command = config
        .extractor_cmd
        .as_deref()
        .context("no extractor configured; set extractor_cmd or VOTEGATE_EXTRACTOR_CMD")?;
    let command = CommandExtractor::new(command, config.extractor_timeout())?;
    tracing::info!(program = command.program(), "extractor configured");
    let extractor = DimensionChecked::new(command, config.descriptor_dim);

    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let ledger_journal: Arc<dyn LedgerJournal> = store.clone();
    let gallery_journal: Arc<dyn GalleryJournal> = store.clone();
    let ledger = Arc::new(VoterLedger::restore(store.load_ledger()?, Some(ledger_journal))?);
    let gallery = Arc::new(FaceGallery::restore(
        config.descriptor_dim,
        store.load_gallery()?,
        Some(gallery_journal),
    )?);

    let audit = store.audit(config.descriptor_dim)?;
    if !audit.is_clean() {
        tracing::warn!(
            voters_without_face = audit.voters_without_face.len(),
            faces_without_vote = audit.faces_without_vote.len(),
            bad_descriptor_dim = audit.bad_descriptor_dim.len(),
            "stored data failed audit; run `votegate audit` for details"
        );
    }
    tracing::info!(voters = ledger.len(), enrolled = gallery.len(), "state restored");

    let engine = engine::spawn_engine(extractor, config.extractor_timeout() + ENGINE_GRACE)?;
    let session = VotingSession::new(config.match_threshold, config.candidate_ids());
    let runtime = Arc::new(KioskRuntime::new(
        session,
        gallery,
        ledger,
        engine,
        config.candidates.clone(),
    ));

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, KioskService::new(runtime.clone()))?
        .build()
        .await
        .context("failed to register on D-Bus")?;
    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?;
    tokio::spawn(dbus_interface::forward_events(emitter, runtime.subscribe()));

    let capture = SpoolCapture::new(&config.spool_dir, config.stale_frame_after());
    tokio::spawn(runtime.clone().run_capture_loop(capture, config.probe_interval()));

    if config.autostart {
        runtime.start_session();
    }

    tracing::info!("votegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("votegated shutting down");
    runtime.stop_session();

    Ok(())
}
