use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use lib_transport::core::{LocalPersistence, StaticSession};
use lib_transport::loggers::setup_logging;
use lib_transport::quality::ConnectivityEvent;
use lib_transport::{MediaLoadState, MediaProgress, TransportEngine, TransportEvent};

mod node_logic;
use node_logic::commands::{self, Command};
use node_logic::config;

/// Persistence that only records where downloaded media landed.
struct LoggingPersistence;

#[async_trait]
impl LocalPersistence for LoggingPersistence {
    async fn update_local_media_path(&self, item_id: u64, path: &Path) -> Result<()> {
        info!(item_id, path = %path.display(), "Media stored locally");
        Ok(())
    }
}

fn print_event(event: &TransportEvent) {
    match event {
        TransportEvent::Message(message) => println!(
            "<< #{} from {} to {:?} via {:?}: {}{}",
            message.id,
            message.from_id,
            message.target,
            message.via,
            message.body,
            message
                .media_url
                .as_deref()
                .map(|url| format!(" [{url}]"))
                .unwrap_or_default()
        ),
        TransportEvent::ModeChanged(mode) => println!("-- transport mode: {mode:?}"),
        TransportEvent::QualityChanged(state) => println!(
            "-- quality: {:?} ({:?}, media {:?})",
            state.quality(),
            state.smoothed_latency(),
            state.media_load_mode()
        ),
        TransportEvent::Error(message) => println!("!! {message}"),
        other => println!("-- {other:?}"),
    }
}

/// Logs a media request until it settles.
async fn follow_progress(mut rx: watch::Receiver<MediaProgress>) {
    let mut started = false;
    loop {
        let progress = rx.borrow_and_update().clone();
        match progress.state {
            MediaLoadState::ThumbnailReady | MediaLoadState::FullReady => {
                let path = progress.full_path.or(progress.thumbnail_path);
                println!("-- media {} ready: {:?}", progress.item_id, path);
                return;
            }
            MediaLoadState::Error => {
                println!(
                    "!! media {} failed: {}",
                    progress.item_id,
                    progress.error.unwrap_or_default()
                );
                return;
            }
            MediaLoadState::Idle if started => {
                println!("-- media {} cancelled", progress.item_id);
                return;
            }
            MediaLoadState::Idle => {}
            _ => {
                started = true;
                println!("-- media {}: {:?} {}%", progress.item_id, progress.state, progress.progress);
            }
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Runs one operator command. `Ok(false)` ends the session.
async fn execute(engine: &TransportEngine, command: Command) -> Result<bool> {
    let coordinator = engine.coordinator();
    let media = engine.media();
    match command {
        Command::Send { recipient_id, text } => {
            let route = coordinator.send_message(recipient_id, &text, None).await?;
            println!("-- sent via {route:?}");
        }
        Command::SendMedia {
            recipient_id,
            media_url,
            text,
        } => {
            let route = coordinator.send_message(recipient_id, &text, Some(media_url)).await?;
            println!("-- sent via {route:?}");
        }
        Command::Group { group_id, text } => coordinator.send_group_message(group_id, &text).await?,
        Command::Typing { recipient_id, is_typing } => coordinator.send_typing(recipient_id, is_typing).await?,
        Command::Seen { message_id, sender_id } => coordinator.mark_seen(message_id, sender_id).await?,
        Command::Thumbnail { item_id, url, priority } => {
            let rx = media.fetch_thumbnail(item_id, &url, priority).await?;
            tokio::spawn(follow_progress(rx));
        }
        Command::Full { item_id, url, priority } => {
            let rx = media.fetch_full(item_id, &url, priority).await?;
            tokio::spawn(follow_progress(rx));
        }
        Command::Cancel { item_id } => {
            let cancelled = media.cancel_download(item_id);
            println!("-- cancel {item_id}: {}", if cancelled { "ok" } else { "nothing pending" });
        }
        Command::Status => println!(
            "-- mode {:?} | {} | batch {} | watermark {} | switches {} | media queued {}",
            coordinator.mode(),
            coordinator.quality_description(),
            coordinator.recommended_batch_size(),
            coordinator.watermark(),
            coordinator.switch_count(),
            media.pending()
        ),
        Command::Check => {
            let state = engine.sampler().sample_once().await;
            println!("-- sampled {:?} ({:?})", state.quality(), state.smoothed_latency());
        }
        Command::Link { up } => engine.notify_connectivity(if up {
            ConnectivityEvent::LinkAvailable
        } else {
            ConnectivityEvent::LinkLost
        }),
        Command::ClearThumbnails => println!("-- removed {} thumbnails", media.clear_thumbnail_cache().await?),
        Command::ClearCache => println!("-- removed {} files", media.clear_all_cache().await?),
        Command::CacheSize => println!("-- cache holds {} bytes", media.cache_size().await?),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

async fn operator_loop(engine: &TransportEngine) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", commands::HELP);
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("stdin closed, initiating shutdown.");
                return;
            }
            Err(e) => {
                error!("Failed to read stdin: {e}");
                return;
            }
        };
        if line.trim().eq_ignore_ascii_case("help") {
            println!("{}", commands::HELP);
            continue;
        }
        let command = match commands::parse(&line) {
            Ok(command) => command,
            Err(commands::ParseError::Empty) => continue,
            Err(e) => {
                println!("!! {e}");
                continue;
            }
        };
        match execute(engine, command).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => println!("!! {e}"),
        }
    }
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    let _guard = setup_logging(&config.log_dir(), "transport_node", &config.log_level())?;
    let transport = config.transport()?;
    info!("{transport}");

    let session = Arc::new(match config.credentials() {
        Some((token, user_id)) => StaticSession::new(token, user_id),
        None => {
            warn!("No credentials configured; the channel and polling stay idle until login.");
            StaticSession::anonymous()
        }
    });

    let engine = TransportEngine::build(transport, session, Arc::new(LoggingPersistence)).await?;
    let printer = engine.take_events().map(|mut events| {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
        })
    });
    engine.start();

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate_signal() => {}
        _ = operator_loop(&engine) => {}
    }

    engine.cleanup().await;
    if let Some(printer) = printer {
        printer.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}
