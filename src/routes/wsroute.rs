use crate::services::extract_bearer;
use crate::state::{AppState, WsSettings};
use crate::websocket::dispatcher::BroadcastDispatcher;
use crate::websocket::{ConnectionId, ConnectionRegistry};
use actix::{Actor, ActorContext, AsyncContext, StreamHandler, WrapFuture};
use actix_web::http::header::AUTHORIZATION;
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::Instant;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

// WebSocket Actor
struct WsSession {
    connection_id: ConnectionId,
    user_id: Uuid,
    registry: ConnectionRegistry,
    dispatcher: BroadcastDispatcher,
    settings: WsSettings,
    hb: Instant,
    // Frames queued by the registry; attached as a stream once the actor starts
    outbound: Option<UnboundedReceiver<String>>,
}

impl WsSession {
    fn new(
        connection_id: ConnectionId,
        user_id: Uuid,
        state: &AppState,
        outbound: UnboundedReceiver<String>,
    ) -> Self {
        Self {
            connection_id,
            user_id,
            registry: state.registry.clone(),
            dispatcher: state.dispatcher.clone(),
            settings: state.ws,
            hb: Instant::now(),
            outbound: Some(outbound),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let timeout = self.settings.client_timeout;
        ctx.run_interval(self.settings.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > timeout {
                tracing::warn!(
                    user_id = %act.user_id,
                    connection_id = %act.connection_id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            "WebSocket session started"
        );

        self.hb(ctx);

        if let Some(rx) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user_id,
            connection_id = %self.connection_id,
            "WebSocket session stopped"
        );

        // Cleanup: rooms, user mapping and offline announcement
        let registry = self.registry.clone();
        let connection_id = self.connection_id;
        actix::spawn(async move {
            registry.disconnect(connection_id).await;
        });
    }
}

// Frames pushed by the registry for this connection
impl StreamHandler<String> for WsSession {
    fn handle(&mut self, frame: String, ctx: &mut Self::Context) {
        ctx.text(frame);
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                let dispatcher = self.dispatcher.clone();
                let connection_id = self.connection_id;
                let user_id = self.user_id;
                let text = text.to_string();
                // Commands from one connection are handled in arrival order
                ctx.wait(
                    async move {
                        dispatcher.handle_frame(connection_id, user_id, &text).await;
                    }
                    .into_actor(self),
                );
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::info!(?reason, "WebSocket close message received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

fn handshake_token(params: &WsParams, req: &HttpRequest) -> Option<String> {
    params.token.clone().filter(|t| !t.is_empty()).or_else(|| {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer)
            .map(str::to_string)
    })
}

#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let Some(token) = handshake_token(&query, &req) else {
        tracing::warn!("WebSocket connection rejected: no token provided");
        return Ok(HttpResponse::Unauthorized().finish());
    };

    let user_id = match state.identity.verify(&token).await {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket connection rejected: invalid token");
            return Ok(HttpResponse::Unauthorized().finish());
        }
    };

    let (tx, rx) = unbounded_channel();
    let connection_id = state.registry.connect(user_id, tx).await;
    let session = WsSession::new(connection_id, user_id, &state, rx);

    match ws::start(session, &req, stream) {
        Ok(response) => Ok(response),
        Err(e) => {
            state.registry.disconnect(connection_id).await;
            Err(e)
        }
    }
}
