use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::Ack;
use crate::registry::Transport;
use crate::router::RoomRouter;
use crate::AppState;

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let router = state.signaling.router.clone();
    ws.max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {error}");
        })
        .on_upgrade(move |socket| handle_socket(socket, router))
}

async fn handle_socket(socket: WebSocket, router: Arc<RoomRouter>) {
    let (transport, outbound) = Transport::channel();
    let conn_id = transport.conn_id();
    info!(%conn_id, "socket connected");

    let (ws_sender, ws_receiver) = socket.split();
    let writer = tokio::spawn(write_loop(ws_sender, outbound));

    serve_connection(ws_receiver, &transport, &router).await;

    // Dropping the last sender ends the writer once the queue is flushed.
    drop(transport);
    if let Err(e) = writer.await {
        debug!(%conn_id, "writer task ended abnormally: {e}");
    }
    info!(%conn_id, "socket disconnected");
}

/// What one inbound WebSocket frame means to the router.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Text(String),
    Skip,
    Close,
}

fn decode_frame(message: Message) -> Inbound {
    match message {
        Message::Text(text) => Inbound::Text(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Inbound::Text(text),
            Err(e) => {
                warn!("binary frame is not UTF-8: {e}");
                Inbound::Skip
            }
        },
        Message::Close(_) => Inbound::Close,
        Message::Ping(_) | Message::Pong(_) => Inbound::Skip,
    }
}

/// Ack the connection, route every frame until the peer goes away, then
/// leave whatever rooms the connection still holds.
async fn serve_connection<St, E>(mut frames: St, transport: &Transport, router: &RoomRouter)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let conn_id = transport.conn_id();
    transport.ack(Ack::ok("Socket Created!"));

    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                debug!(%conn_id, "socket read error: {e}");
                break;
            }
        };
        match decode_frame(message) {
            // Errors are already acked to the sender.
            Inbound::Text(text) => {
                let _ = router.route(transport, &text).await;
            }
            Inbound::Skip => continue,
            Inbound::Close => break,
        }
    }

    router.disconnect(transport).await;
}

async fn write_loop<S>(mut sink: S, mut outbound: mpsc::UnboundedReceiver<String>)
where
    S: futures::Sink<Message> + Unpin,
{
    while let Some(text) = outbound.recv().await {
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
