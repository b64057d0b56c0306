use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use screen_guide::bus::{BusEvent, EventBus};
use screen_guide::engine::{CommandMessage, EngineHandle};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use crate::tour::Tours;

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub bus: EventBus,
    pub tours: Arc<Tours>,
}

/// Serves the command IPC and the event stream. Tries `bind` and the next nine
/// ports; returns the address actually bound.
pub async fn start_server(bind: SocketAddr, state: AppState) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/mutation", post(mutation_handler))
        .route("/reset", post(reset_handler))
        .route("/tour", post(tour_start_handler).delete(tour_cancel_handler))
        .route("/events", get(sse_handler))
        .with_state(Arc::new(state));

    let mut listener = None;
    for offset in 0..10 {
        let addr = SocketAddr::new(bind.ip(), bind.port().saturating_add(offset));
        match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => {
                listener = Some(l);
                break;
            }
            Err(e) => debug!(%addr, error = %e, "port busy"),
        }
    }
    let listener = listener.with_context(|| {
        format!("could not bind {} or the nine ports after it", bind)
    })?;
    let local = listener.local_addr()?;
    info!("command endpoint at http://{local}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "http server stopped");
        }
    });
    Ok(local)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

fn accepted(delivered: bool) -> StatusCode {
    if delivered {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(message): Json<CommandMessage>,
) -> StatusCode {
    debug!(
        chars = message.text.len(),
        with_screen = message.screen_context.is_some(),
        "POST /command"
    );
    accepted(state.engine.submit_command(message))
}

async fn mutation_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    accepted(state.engine.screen_mutated())
}

async fn reset_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    accepted(state.engine.reset())
}

async fn tour_start_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.tours.start().await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "tour not started");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn tour_cancel_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.tours.cancel() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

fn to_sse_event(event: &BusEvent) -> Option<Event> {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!(event = event.name(), error = %e, "event not encodable");
            None
        }
    }
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (intents, notices) = state.bus.receivers();
    let stream = BroadcastStream::new(notices)
        .merge(BroadcastStream::new(intents))
        .filter_map(|result| match result {
            Ok(event) => to_sse_event(&event).map(Ok::<_, Infallible>),
            Err(lagged) => {
                debug!(error = %lagged, "sse client lagging");
                None
            }
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Screen Guide</title>
<style>
  body { font-family: system-ui, sans-serif; background: #101418; color: #e6e6e6; margin: 0; }
  main { max-width: 640px; margin: 0 auto; padding: 24px; }
  #log { list-style: none; padding: 0; }
  #log li { padding: 8px 12px; margin: 6px 0; border-radius: 8px; background: #1b2229; }
  #log li.spoke { background: #1d3b2a; }
  #log li.action_requested, #log li.highlight_requested { background: #2a2f45; }
  form { display: flex; gap: 8px; }
  input { flex: 1; padding: 10px; border-radius: 8px; border: 1px solid #333; background: #0b0e11; color: inherit; }
  button { padding: 10px 16px; border-radius: 8px; border: 0; background: #3b82f6; color: #fff; }
  #state { font-size: 13px; opacity: 0.7; margin-bottom: 12px; }
</style>
</head>
<body>
<main>
  <h1>Screen Guide</h1>
  <div id="state">idle</div>
  <form id="say">
    <input id="text" placeholder="Say something (empty = press the button)" autocomplete="off">
    <button>Send</button>
    <button type="button" id="tour">Tour</button>
  </form>
  <ul id="log"></ul>
</main>
<script>
  const log = document.getElementById('log');
  const state = document.getElementById('state');
  function add(kind, text) {
    const li = document.createElement('li');
    li.className = kind;
    li.textContent = text;
    log.prepend(li);
  }
  document.getElementById('say').addEventListener('submit', async (e) => {
    e.preventDefault();
    const input = document.getElementById('text');
    const text = input.value;
    input.value = '';
    if (text) add('user', text);
    await fetch('/command', {
      method: 'POST',
      headers: {'Content-Type': 'application/json'},
      body: JSON.stringify({text})
    });
  });
  document.getElementById('tour').addEventListener('click', () => fetch('/tour', {method: 'POST'}));
  const events = new EventSource('/events');
  events.addEventListener('spoke', e => add('spoke', JSON.parse(e.data).text));
  events.addEventListener('state_changed', e => state.textContent = JSON.parse(e.data).state);
  events.addEventListener('task_changed', e => {
    const t = JSON.parse(e.data).task;
    add('task', t.goal === 'NONE' ? 'task cleared' : 'task: ' + t.goal + ' (step ' + t.step + ')');
  });
  events.addEventListener('action_requested', e => add('action_requested', JSON.stringify(JSON.parse(e.data).action)));
  events.addEventListener('highlight_requested', e => add('highlight_requested', 'highlight ' + JSON.parse(e.data).selector.value));
  events.addEventListener('flow_finished', e => {
    const f = JSON.parse(e.data);
    add('task', f.flow + ' ' + f.outcome);
  });
  events.addEventListener('turn_ready', () => state.textContent = 'ready');
</script>
</body>
</html>
"##;
