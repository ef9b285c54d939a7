use std::sync::Arc;

use actix_ws::Session;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;

use super::broadcaster::ClientHandle;
use super::config::Config;
use super::protocol::{
    AddTrackPayload, AuthPayload, ErrorReason, Frame, MoveTrackPayload, PlayPayload,
    RemoveTrackPayload, SeekPayload, SettingsPayload, SyncQueuePayload, SyncStatePayload,
};
use super::registry::SharedRegistry;
use super::room::{Room, RoomError, RoomState, Track};

/// Authenticated binding of a connection to a room. Owned by the
/// connection's main loop, which is the only reader and writer.
pub struct ConnCtx {
    pub room: Arc<RwLock<Room>>,
    pub room_id: String,
    pub sender_id: String,
    pub handle: ClientHandle,
}

impl From<RoomError> for ErrorReason {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::RoomNotFound => ErrorReason::RoomNotFound,
            RoomError::NotAuthorized => ErrorReason::NotAuthorized,
            RoomError::JoinFailed => ErrorReason::JoinFailed,
            RoomError::RoomExists | RoomError::InvalidId | RoomError::ActionFailed => {
                ErrorReason::ActionFailed
            }
        }
    }
}

fn parse<T: DeserializeOwned>(data: &Value) -> Result<T, ErrorReason> {
    serde_json::from_value(data.clone()).map_err(|_| ErrorReason::MissingParams)
}

fn parse_or_default<T: DeserializeOwned + Default>(data: &Value) -> Result<T, ErrorReason> {
    if data.is_null() {
        Ok(T::default())
    } else {
        parse(data)
    }
}

#[async_trait]
trait Commands {
    type Output;

    async fn auth(&mut self, room_id: &str, sender_id: &str, frame: &Frame) -> Self::Output;
    async fn heartbeat(&mut self, sender_id: &str) -> Self::Output;
    async fn playback(&mut self, sender_id: &str, frame: &Frame) -> Self::Output;
    async fn playlist(&mut self, sender_id: &str, frame: &Frame) -> Self::Output;
    async fn settings(&mut self, sender_id: &str, frame: &Frame) -> Self::Output;
    async fn system(&mut self, sender_id: &str, frame: &Frame) -> Self::Output;
}

/// Validates one decoded frame and routes it to the owning room. Every
/// invocation produces exactly one ACK reason for the originator; failures
/// never leave a partial mutation behind.
pub struct Dispatch<'a> {
    registry: &'a SharedRegistry,
    config: &'a Config,
    session: &'a Session,
    conn: &'a mut Option<ConnCtx>,
}

impl<'a> Dispatch<'a> {
    pub fn new(
        registry: &'a SharedRegistry,
        config: &'a Config,
        session: &'a Session,
        conn: &'a mut Option<ConnCtx>,
    ) -> Self {
        Self {
            registry,
            config,
            session,
            conn,
        }
    }

    pub async fn process(&mut self, frame: &Frame) -> Result<&'static str, ErrorReason> {
        let room_id = match frame.room_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.to_owned(),
            _ => return Err(ErrorReason::MissingRequiredFields),
        };
        let sender_id = match frame.sender_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.to_owned(),
            _ => return Err(ErrorReason::MissingRequiredFields),
        };

        if frame.msg_type == "auth" {
            return self.auth(&room_id, &sender_id, frame).await;
        }

        // Everything else requires the frame to match the authenticated pair.
        let authed = self
            .conn
            .as_ref()
            .is_some_and(|ctx| ctx.room_id == room_id && ctx.sender_id == sender_id);
        if !authed {
            return Err(ErrorReason::InvalidSession);
        }

        match frame.msg_type.as_str() {
            "heartbeat" => self.heartbeat(&sender_id).await,
            "playback" => self.playback(&sender_id, frame).await,
            "playlist" => self.playlist(&sender_id, frame).await,
            "settings" => self.settings(&sender_id, frame).await,
            "system" => self.system(&sender_id, frame).await,
            _ => Err(ErrorReason::UnknownMessageType),
        }
    }

    /// The per-room write guard for the authenticated room. The binding can
    /// only be absent on a bug in `process`'s ordering, surfaced as a
    /// processing error instead of tearing the connection down.
    async fn room(&self) -> Result<tokio::sync::RwLockWriteGuard<'_, Room>, ErrorReason> {
        match self.conn.as_ref() {
            Some(ctx) => Ok(ctx.room.write().await),
            None => Err(ErrorReason::ProcessingError),
        }
    }
}

#[async_trait]
impl Commands for Dispatch<'_> {
    type Output = Result<&'static str, ErrorReason>;

    async fn auth(&mut self, room_id: &str, sender_id: &str, frame: &Frame) -> Self::Output {
        let payload: AuthPayload = parse_or_default(&frame.data)?;

        let Some(room_arc) = self.registry.read().await.get(room_id) else {
            return Err(ErrorReason::RoomNotFound);
        };

        // A connection is a member of one room at a time; re-authenticating
        // against another room detaches from the previous one first. A
        // repeat auth for the same pair reuses the existing handle so the
        // replacement path does not close this very connection.
        let same_binding = self
            .conn
            .as_ref()
            .is_some_and(|ctx| ctx.room_id == room_id && ctx.sender_id == sender_id);

        let (handle, writer_rx) = if same_binding {
            match self.conn.as_ref() {
                Some(ctx) => (ctx.handle.clone(), None),
                None => return Err(ErrorReason::ProcessingError),
            }
        } else {
            if let Some(ctx) = self.conn.take() {
                // Dropping the old handle without a close marker lets its
                // writer exit silently; a marker would close the shared
                // session and kill the connection mid-switch.
                ctx.room.write().await.detach_member(ctx.handle.conn_id());
            }

            let (handle, rx) = ClientHandle::new(sender_id, self.config.max_outbound_backlog);
            (handle, Some(rx))
        };

        {
            let mut room = room_arc.write().await;

            if room.state == RoomState::Terminated && !room.is_host(sender_id) {
                return Err(ErrorReason::RoomNotActive);
            }

            room.attach_member(sender_id, handle.clone(), payload.is_host)
                .map_err(|_| ErrorReason::JoinFailed)?;
        }

        // Only a successful join gets a writer; a refused one must not
        // tear the connection down when the fresh handle is dropped.
        if let Some(rx) = writer_rx {
            ClientHandle::spawn_writer(self.session.clone(), rx);
        }

        *self.conn = Some(ConnCtx {
            room: room_arc,
            room_id: room_id.to_owned(),
            sender_id: sender_id.to_owned(),
            handle,
        });

        Ok("authenticated")
    }

    async fn heartbeat(&mut self, sender_id: &str) -> Self::Output {
        self.room().await?.touch(sender_id);
        Ok("ok")
    }

    async fn playback(&mut self, sender_id: &str, frame: &Frame) -> Self::Output {
        let sub_type = frame.sub_type.as_deref().unwrap_or_default();
        let mut room = self.room().await?;

        let result = match sub_type {
            "play" => {
                let payload: PlayPayload = parse_or_default(&frame.data)?;
                room.play(sender_id, payload.track_index, payload.position_ms)
            }
            "pause" => room.pause(sender_id),
            "next" => room.next(sender_id),
            "previous" => room.previous(sender_id),
            "seek" => {
                let payload: SeekPayload = parse(&frame.data)?;
                room.seek(sender_id, payload.position_ms)
            }
            // Composite used on host reconnect to re-assert the whole
            // playback state in one frame.
            "syncState" => {
                let payload: SyncStatePayload = parse(&frame.data)?;
                if payload.is_playing {
                    room.play(sender_id, payload.track_index, Some(payload.position_ms))
                } else {
                    room.pause(sender_id).and_then(|()| {
                        if payload.position_ms > 0 {
                            room.seek(sender_id, payload.position_ms)
                        } else {
                            Ok(())
                        }
                    })
                }
            }
            _ => return Err(ErrorReason::UnknownSubtype),
        };

        result.map(|()| "ok").map_err(Into::into)
    }

    async fn playlist(&mut self, sender_id: &str, frame: &Frame) -> Self::Output {
        let sub_type = frame.sub_type.as_deref().unwrap_or_default();
        let mut room = self.room().await?;

        let result = match sub_type {
            "add" => {
                let payload: AddTrackPayload = parse(&frame.data)?;
                room.add_track(
                    sender_id,
                    &payload.track_id,
                    payload.title,
                    payload.duration_ms,
                )
            }
            "remove" => {
                let payload: RemoveTrackPayload = parse(&frame.data)?;
                room.remove_track(sender_id, payload.track_index)
            }
            "move" => {
                let payload: MoveTrackPayload = parse(&frame.data)?;
                room.move_track(sender_id, payload.from_index, payload.to_index)
            }
            "clear" => room.clear_queue(sender_id),
            "sync_queue" => {
                let payload: SyncQueuePayload = parse(&frame.data)?;
                let tracks = payload
                    .tracks
                    .into_iter()
                    .map(|t| {
                        // Attribution is preserved when the submitted queue
                        // carries it; otherwise the origin takes it.
                        let added_by = t.added_by.unwrap_or_else(|| sender_id.to_owned());
                        Track::new(t.track_id, t.title, t.duration_ms, added_by)
                    })
                    .collect();
                room.replace_queue(sender_id, tracks)
            }
            _ => return Err(ErrorReason::UnknownSubtype),
        };

        result.map(|()| "ok").map_err(Into::into)
    }

    async fn settings(&mut self, sender_id: &str, frame: &Frame) -> Self::Output {
        let payload: SettingsPayload = parse_or_default(&frame.data)?;

        self.room()
            .await?
            .update_settings(
                sender_id,
                payload.allow_guests_control,
                payload.allow_guests_add_tracks,
            )
            .map(|()| "ok")
            .map_err(Into::into)
    }

    async fn system(&mut self, sender_id: &str, frame: &Frame) -> Self::Output {
        match frame.sub_type.as_deref() {
            Some("health_check") => {
                self.room().await?.touch(sender_id);
                Ok("ok")
            }
            _ => Err(ErrorReason::UnknownSubtype),
        }
    }
}
