//! Embedded HTTP dashboard: an index page, a JSON π snapshot, and a
//! WebSocket that pushes server stats once per second and π stats every ten.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{debug, error};

use crate::app::App;
use crate::stats::StatsFrame;

const SERVER_PUSH_PERIOD: Duration = Duration::from_secs(1);
const PI_PUSH_PERIOD: Duration = Duration::from_secs(10);

pub(crate) async fn serve(listener: tokio::net::TcpListener, app: Arc<App>) {
    let router = Router::new()
        .route("/", get(index))
        .route("/pi", get(pi_snapshot))
        .route("/ws", get(ws_upgrade))
        .with_state(app);

    if let Err(err) = axum::serve(listener, router).await {
        error!(error = %err, "dashboard server failed");
    }
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../assets/index.html"))
}

async fn pi_snapshot(State(app): State<Arc<App>>) -> impl IntoResponse {
    Json(app.pi_stats())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<Arc<App>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_stats(socket, app))
}

async fn push_stats(mut socket: WebSocket, app: Arc<App>) {
    let mut server_tick = tokio::time::interval(SERVER_PUSH_PERIOD);
    server_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut pi_tick = tokio::time::interval(PI_PUSH_PERIOD);
    pi_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let frame = tokio::select! {
            _ = server_tick.tick() => StatsFrame {
                server: Some(app.server_stats()),
                pi: None,
            },
            _ = pi_tick.tick() => StatsFrame {
                server: None,
                pi: Some(app.pi_stats()),
            },
        };

        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "stats frame failed to encode");
                return;
            }
        };
        if let Err(err) = socket.send(Message::Text(payload.into())).await {
            debug!(error = %err, "dashboard client gone");
            return;
        }
    }
}
