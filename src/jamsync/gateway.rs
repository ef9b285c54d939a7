use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_rt::time;
use actix_web::{HttpRequest, Responder, web};
use actix_ws::{AggregatedMessage, AggregatedMessageStream, Session};
use tokio::sync::Mutex;

use super::commands::{ConnCtx, Dispatch};
use super::config::Config;
use super::health;
use super::protocol::{self, ErrorReason, Frame};
use super::registry::SharedRegistry;
use super::room::RoomState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
// max 128kb per frame
const MAX_FRAME_BYTES: usize = 1024 * 128;

/// One websocket connection on the single sync endpoint. A connection is
/// anonymous until its first valid `auth` frame binds it to a room; from
/// then on every frame must carry the authenticated (room, sender) pair.
pub struct JamsyncWsInstance {
    session: Session,
    hb: Arc<Mutex<Instant>>,
}

impl std::fmt::Debug for JamsyncWsInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JamsyncWsInstance").finish_non_exhaustive()
    }
}

impl JamsyncWsInstance {
    pub async fn init(
        req: HttpRequest,
        body: web::Payload,
        registry: web::Data<SharedRegistry>,
        config: web::Data<Config>,
    ) -> actix_web::Result<impl Responder> {
        let (res, session, stream) = actix_ws::handle(&req, body)?;
        let stream = stream
            .max_frame_size(MAX_FRAME_BYTES)
            .aggregate_continuations();

        debug!("[WS] connection opened");

        let _self = Self {
            session,
            hb: Arc::new(Mutex::new(Instant::now())),
        };

        _self.init_main_loop(
            Arc::clone(registry.get_ref()),
            config.get_ref().clone(),
            stream,
        );

        Ok(res)
    }

    /// Multiplexes the inbound stream with the protocol heartbeat; message
    /// handling has priority over ticks.
    fn init_main_loop(
        &self,
        registry: SharedRegistry,
        config: Config,
        mut stream: AggregatedMessageStream,
    ) {
        let mut interval = time::interval(HEARTBEAT_INTERVAL);
        let hb = Arc::clone(&self.hb);
        let mut session = self.session.clone();

        actix_rt::spawn(async move {
            let mut conn: Option<ConnCtx> = None;

            loop {
                tokio::select! {
                    biased;

                    stream_msg = stream.recv() => {
                        match stream_msg {
                            Some(Ok(msg)) => {
                                *hb.lock().await = Instant::now();

                                match msg {
                                    AggregatedMessage::Ping(bytes) => {
                                        if session.pong(&bytes).await.is_err() {
                                            break;
                                        }
                                    }
                                    AggregatedMessage::Pong(_) => {
                                        // Keep-alives count as room activity.
                                        if let Some(ctx) = &conn {
                                            ctx.room.write().await.touch(&ctx.sender_id);
                                        }
                                    }
                                    AggregatedMessage::Text(text) => {
                                        if !Self::handle_frame(
                                            &text,
                                            &mut session,
                                            &mut conn,
                                            &registry,
                                            &config,
                                        )
                                        .await
                                        {
                                            break;
                                        }
                                    }
                                    AggregatedMessage::Binary(bytes) => {
                                        // JSON arriving on a binary frame is accepted.
                                        match std::str::from_utf8(&bytes) {
                                            Ok(text) => {
                                                if !Self::handle_frame(
                                                    text,
                                                    &mut session,
                                                    &mut conn,
                                                    &registry,
                                                    &config,
                                                )
                                                .await
                                                {
                                                    break;
                                                }
                                            }
                                            Err(_) => {
                                                if !Self::send_ack(
                                                    &mut session,
                                                    Err(ErrorReason::InvalidMessage),
                                                    None,
                                                )
                                                .await
                                                {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                    AggregatedMessage::Close(_) => break,
                                }
                            }
                            // Transport errors close without an ACK.
                            None | Some(Err(_)) => break,
                        }
                    }
                    _ = interval.tick() => {
                        if Instant::now().duration_since(*hb.lock().await)
                            > config.client_idle_timeout
                        {
                            debug!("[WS] disconnecting idle connection");
                            break;
                        }

                        if session.ping(b"PING").await.is_err() {
                            break;
                        }
                    }
                }
            }

            Self::close_session(session, conn, &registry, &config).await;
        });
    }

    /// Decodes and dispatches one frame, replying with exactly one ACK.
    /// Returns whether the connection is still usable.
    async fn handle_frame(
        raw: &str,
        session: &mut Session,
        conn: &mut Option<ConnCtx>,
        registry: &SharedRegistry,
        config: &Config,
    ) -> bool {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
            return Self::send_ack(session, Err(ErrorReason::InvalidMessage), None).await;
        };

        let correlation_id = value
            .get("correlationId")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        let Ok(frame) = serde_json::from_value::<Frame>(value) else {
            return Self::send_ack(
                session,
                Err(ErrorReason::MissingRequiredFields),
                correlation_id.as_deref(),
            )
            .await;
        };

        let outcome = Dispatch::new(registry, config, session, conn)
            .process(&frame)
            .await;

        let authenticated = matches!(outcome, Ok("authenticated"));

        if !Self::send_ack(session, outcome, correlation_id.as_deref()).await {
            return false;
        }

        // A fresh member gets the one-shot room snapshot right behind the ACK.
        if authenticated {
            if let Some(ctx) = conn.as_ref() {
                let snapshot = ctx.room.read().await.snapshot();
                if session
                    .text(protocol::full_state_frame(snapshot))
                    .await
                    .is_err()
                {
                    return false;
                }
            }
        }

        true
    }

    /// Returns false when the session is gone.
    async fn send_ack(
        session: &mut Session,
        outcome: Result<&'static str, ErrorReason>,
        correlation_id: Option<&str>,
    ) -> bool {
        let frame = match outcome {
            Ok(reason) => protocol::ack_frame(true, reason, correlation_id),
            Err(reason) => protocol::ack_frame(false, reason.as_str(), correlation_id),
        };

        session.text(frame).await.is_ok()
    }

    async fn close_session(
        session: Session,
        conn: Option<ConnCtx>,
        registry: &SharedRegistry,
        config: &Config,
    ) {
        let _ = session.close(None).await;

        let Some(ctx) = conn else {
            return;
        };
        ctx.handle.close();

        let mut room = ctx.room.write().await;
        let Some(sender_id) = room.detach_member(ctx.handle.conn_id()) else {
            return;
        };
        let host_dropped = room.is_host(&sender_id) && room.state == RoomState::HostDisconnected;
        let room_id = room.id.clone();
        drop(room);

        debug!("[{room_id}] detached {sender_id}");

        // The host gets a grace window before the room is expired.
        if host_dropped {
            health::schedule_expiration_check(Arc::clone(registry), room_id, config.clone());
        }
    }
}
