mod dom;
mod face;
mod hands;
mod tour;
mod voice;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use screen_guide::bus::EventBus;
use screen_guide::config::Config;
use screen_guide::engine::{Collaborators, Engine};
use screen_guide::logging;
use screen_guide::planner::HttpPlanner;
use screen_guide::prefs::InMemoryPreferences;
use screen_guide::status::ClockStatus;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Config::parse();
    logging::init(config.log_json);
    config.validate()?;

    let debug_url = config.chrome_debug_url.clone();
    let start_url = config.start_url.clone();
    let apps = config.app_shortcuts();
    let session = tokio::task::spawn_blocking(move || {
        hands::BrowserSession::launch(debug_url.as_deref(), &start_url, apps)
    })
    .await
    .context("browser launch panicked")??;
    let session = Arc::new(session);

    let planner = HttpPlanner::new(
        config.planner_url.clone(),
        config.planner_api_key.clone(),
        config.planner_timeout(),
    )
    .context("planner client")?;
    info!(url = %config.planner_url, "planner ready");

    let prefs = Arc::new(InMemoryPreferences::default());
    let (speech_done_tx, mut speech_done_rx) = mpsc::unbounded_channel();
    let bus = EventBus::default();
    let tours = Arc::new(tour::Tours::new(session.clone(), bus.clone(), prefs.clone()));
    let parts = Collaborators {
        host: session.clone(),
        speaker: Arc::new(voice::ConsoleSpeaker::new(speech_done_tx, prefs.clone())),
        listener: Arc::new(voice::PageListener),
        planner: Arc::new(planner),
        status: Arc::new(ClockStatus {
            locale: config.locale.clone(),
        }),
        prefs,
    };
    let (engine, engine_task) = Engine::spawn(config.timings(), parts, bus.clone());

    let completions = engine.clone();
    tokio::spawn(async move {
        while let Some(id) = speech_done_rx.recv().await {
            if !completions.speech_done(id) {
                break;
            }
        }
    });
    hands::watch_mutations(session, engine.clone());

    face::start_server(
        config.bind,
        face::AppState {
            engine: engine.clone(),
            bus,
            tours,
        },
    )
    .await?;

    let mut engine_task = engine_task;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "ctrl-c handler failed");
            }
            info!("shutting down");
            engine.shutdown();
            engine_task.await.context("engine task panicked")?;
        }
        joined = &mut engine_task => {
            joined.context("engine task panicked")?;
            warn!("engine exited on its own");
        }
    }
    Ok(())
}
