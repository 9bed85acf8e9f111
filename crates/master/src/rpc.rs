//! TCP front end for the four RPC verbs: one accept loop, one task per
//! worker connection, strict request/reply framing.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use swarmpi_proto::{Request, read_message, write_message};

use crate::app::App;

pub(crate) async fn serve(listener: TcpListener, app: Arc<App>) {
    let mut stop_rx = app.stop_subscribe();
    loop {
        tokio::select! {
            _ = async { stop_rx.wait_for(|stopped| *stopped).await.ok(); } => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "worker connection accepted");
                    let app = app.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, app).await;
                    });
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

async fn handle_connection(mut stream: TcpStream, app: Arc<App>) {
    let _ = stream.set_nodelay(true);
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(err) => {
            debug!(error = %err, "connection lost before first request");
            return;
        }
    };

    let mut stop_rx = app.stop_subscribe();
    loop {
        let request = tokio::select! {
            _ = async { stop_rx.wait_for(|stopped| *stopped).await.ok(); } => return,
            read = read_message::<_, Request>(&mut stream) => match read {
                Ok(request) => request,
                Err(err) => {
                    // Workers drop connections freely; this is routine.
                    debug!(%peer, error = %err, "worker connection closed");
                    return;
                }
            },
        };

        let reply = app.dispatch(request, peer).await;
        if let Err(err) = write_message(&mut stream, &reply).await {
            debug!(%peer, error = %err, "reply failed, dropping connection");
            return;
        }
    }
}
