use cam_motion_common::config::Config;
use cam_motion_detector::session::{SessionStatus, StreamSession};
use cam_motion_detector::snapshots::SnapshotStore;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let source_arg = args.next();

    let (config, defaulted) = match Config::load_or_default(&config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    if defaulted {
        info!(path = %config_path.display(), "config file not found, using defaults");
    }

    // An explicit URI always starts; the configured one only with auto_start.
    let source = source_arg.or_else(|| {
        config
            .source
            .uri
            .clone()
            .filter(|_| config.source.auto_start)
    });
    info!(
        decoder = config.decoder.program,
        width = config.decoder.width,
        height = config.decoder.height,
        fps = config.decoder.fps,
        score_threshold = config.motion.score_threshold,
        cooldown_ms = config.motion.cooldown_ms,
        "starting cam-motion"
    );

    let mut session = StreamSession::new(config.clone());

    if config.snapshots.enabled {
        let store = SnapshotStore::new(&config.snapshots.dir);
        if let Err(e) = store.ensure_dir().await {
            error!(error = %e, dir = config.snapshots.dir, "failed to create snapshot directory");
            std::process::exit(1);
        }
        match store.list().await {
            Ok(existing) => info!(
                dir = config.snapshots.dir,
                existing = existing.len(),
                "snapshot store ready"
            ),
            Err(e) => warn!(error = %e, "failed to list existing snapshots"),
        }
        tokio::spawn(run_snapshot_writer(store, session.motion_events()));
    }
    tokio::spawn(run_frame_counter(session.frames()));

    let Some(source) = source else {
        error!("no source to start: pass a URI or set source.uri with auto_start = true");
        std::process::exit(1);
    };

    if let Err(e) = session.start(&source).await {
        error!(error = %e, "failed to start stream");
        std::process::exit(1);
    }

    let mut status = session.status();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = terminated() => info!("terminated, shutting down"),
        _ = status.wait_for(|s| !matches!(s, SessionStatus::Running { .. })) => {
            let status = session.status().borrow().clone();
            match status {
                SessionStatus::Failed { reason } => error!(reason, "stream failed"),
                other => info!(status = ?other, "stream finished"),
            }
        }
    }

    session.stop().await;
}

/// Resolves on SIGTERM, as sent by process managers and container runtimes.
#[cfg(unix)]
async fn terminated() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminated() {
    std::future::pending::<()>().await;
}

/// Persist the triggering frame of every motion event.
async fn run_snapshot_writer(
    store: SnapshotStore,
    mut events: tokio::sync::broadcast::Receiver<cam_motion_common::frame::MotionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(e) = store.save(&event).await {
                    error!(error = %e, "failed to save motion snapshot");
                }
            }
            Err(RecvError::Lagged(missed)) => warn!(missed, "snapshot writer fell behind"),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn run_frame_counter(
    mut frames: tokio::sync::broadcast::Receiver<cam_motion_common::frame::Frame>,
) {
    let mut total: u64 = 0;
    loop {
        match frames.recv().await {
            Ok(frame) => {
                total += 1;
                if total % 100 == 0 {
                    debug!(total, seq = frame.seq, bytes = frame.len(), "frames received");
                }
            }
            Err(RecvError::Lagged(missed)) => debug!(missed, "frame observer lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}
