use anyhow::{Context, Result};
use clap::Parser;
use lecture_core::content::HttpContentService;
use lecture_core::persistence::{FileProgressStore, MemoryProgressStore, ProgressStore};
use lecture_core::{Orchestrator, SessionView};
use lecture_service::config::Config;
use lecture_service::console::{self, ConsoleInput};
use lecture_service::ws_transport::WebSocketTransport;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Narrates a lecture and answers questions along the way")]
struct Cli {
    /// Identifier of the lecture to play
    lecture_id: String,
    /// Ignore saved progress and start from the first chunk
    #[arg(long)]
    restart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();
    tracing::info!(lecture_id = %args.lecture_id, "starting lecture player");

    // --- 4. Wire the collaborators ---
    let content = Arc::new(HttpContentService::new(&config.api_base_url));
    let store: Arc<dyn ProgressStore> = match FileProgressStore::open(&config.progress_file) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(
                "progress file {} unusable, progress will not survive restarts: {:?}",
                config.progress_file.display(),
                e
            );
            Arc::new(MemoryProgressStore::new())
        }
    };
    let transport = Arc::new(WebSocketTransport::new(&config.realtime_base_url));

    let (handle, orchestrator) = Orchestrator::spawn(
        &args.lecture_id,
        config.playback_settings(),
        content,
        transport,
        store,
    );

    // --- 5. Print snapshots as they change ---
    let mut views = handle.subscribe();
    let printer = tokio::spawn(async move {
        let mut previous = SessionView::default();
        while views.changed().await.is_ok() {
            let current = views.borrow_and_update().clone();
            for line in console::render_changes(&previous, &current) {
                println!("{line}");
            }
            previous = current;
        }
    });

    if args.restart {
        handle.restart().await?;
    } else {
        handle.start(true).await?;
    }
    println!("{}", console::HELP);

    // --- 6. Read commands from the terminal ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read from stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl-C, shutting down...");
                break;
            }
        };
        let Some(line) = line else { break };
        match console::parse_line(&line) {
            None => {}
            Some(ConsoleInput::Command(command)) => {
                if let Err(e) = handle.send(command).await {
                    tracing::error!("orchestrator is gone: {:?}", e);
                    break;
                }
            }
            Some(ConsoleInput::Help) => println!("{}", console::HELP),
            Some(ConsoleInput::Quit) => break,
            Some(ConsoleInput::Unknown(text)) => {
                println!("unrecognized command: {text} (type `help`)");
            }
        }
    }

    tracing::info!("Shutting down...");
    // Dropping the last handle saves the position and closes the socket.
    drop(handle);
    if let Err(e) = orchestrator.await {
        tracing::error!("orchestrator task failed: {:?}", e);
    }
    printer.abort();
    Ok(())
}
