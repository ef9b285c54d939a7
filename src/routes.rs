use actix_web::{HttpResponse, Responder, delete, get, patch, post, web};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use serde::Deserialize;
use serde_json::json;

use crate::jamsync::protocol::epoch_ms;
use crate::jamsync::registry::SharedRegistry;
use crate::jamsync::room::{RoomError, RoomState};

const ROOM_ID_LEN: usize = 8;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoom {
    host_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRoom {
    caller_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsUpdate {
    caller_id: String,
    allow_guests_control: Option<bool>,
    allow_guests_add_tracks: Option<bool>,
}

fn error_response(err: RoomError) -> HttpResponse {
    match err {
        RoomError::RoomNotFound => {
            HttpResponse::NotFound().json(json!({"error": "room_not_found"}))
        }
        RoomError::NotAuthorized => {
            HttpResponse::Forbidden().json(json!({"error": "not_authorized"}))
        }
        RoomError::RoomExists => HttpResponse::Conflict().json(json!({"error": "room_exists"})),
        RoomError::InvalidId => HttpResponse::BadRequest().json(json!({"error": "invalid_id"})),
        RoomError::ActionFailed | RoomError::JoinFailed => {
            HttpResponse::BadRequest().json(json!({"error": "action_failed"}))
        }
    }
}

fn mint_room_id() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_ID_LEN)
        .map(char::from)
        .collect()
}

#[get("/")]
pub async fn root() -> impl Responder {
    HttpResponse::Ok()
}

#[post("/v1/rooms")]
pub async fn create_room(
    web::Json(CreateRoom { host_id }): web::Json<CreateRoom>,
    registry: web::Data<SharedRegistry>,
) -> impl Responder {
    let mut guard = registry.write().await;

    // Ids are minted here, not by the registry; regenerate on the off
    // chance of a collision.
    let mut room_id = mint_room_id();
    while guard.exists(&room_id) {
        room_id = mint_room_id();
    }

    match guard.create(&room_id, &host_id) {
        Ok(_) => HttpResponse::Created().json(json!({
            "roomId": room_id,
            "hostId": host_id,
        })),
        Err(err) => error_response(err),
    }
}

#[delete("/v1/rooms/{room_id}")]
pub async fn delete_room(
    path: web::Path<String>,
    web::Json(DeleteRoom { caller_id }): web::Json<DeleteRoom>,
    registry: web::Data<SharedRegistry>,
) -> impl Responder {
    let room_id = path.into_inner();

    match registry.write().await.delete(&room_id, &caller_id).await {
        Ok(()) => HttpResponse::Ok().json(json!({"deleted": true})),
        Err(err) => error_response(err),
    }
}

#[get("/v1/rooms/{room_id}")]
pub async fn get_room(
    path: web::Path<String>,
    registry: web::Data<SharedRegistry>,
) -> impl Responder {
    let room_id = path.into_inner();

    let Some(room) = registry.read().await.get(&room_id) else {
        return error_response(RoomError::RoomNotFound);
    };

    let snapshot = room.read().await.snapshot();

    HttpResponse::Ok().json(snapshot)
}

#[get("/v1/rooms/{room_id}/playlist")]
pub async fn get_playlist(
    path: web::Path<String>,
    registry: web::Data<SharedRegistry>,
) -> impl Responder {
    let room_id = path.into_inner();

    let Some(room) = registry.read().await.get(&room_id) else {
        return error_response(RoomError::RoomNotFound);
    };

    let guard = room.read().await;

    HttpResponse::Ok().json(json!({
        "roomId": guard.id,
        "tracks": guard.queue,
    }))
}

#[get("/v1/rooms/{room_id}/playback")]
pub async fn get_playback(
    path: web::Path<String>,
    registry: web::Data<SharedRegistry>,
) -> impl Responder {
    let room_id = path.into_inner();

    let Some(room) = registry.read().await.get(&room_id) else {
        return error_response(RoomError::RoomNotFound);
    };

    let guard = room.read().await;
    let now = epoch_ms();

    HttpResponse::Ok().json(json!({
        "roomId": guard.id,
        "state": guard.state,
        "nowPlayingIndex": guard.now_playing_index(),
        "nowPlaying": guard.current_track(),
        "isPlaying": guard.state == RoomState::Active,
        "positionMs": guard.playback.as_ref().map(|p| p.position(now)),
    }))
}

#[patch("/v1/rooms/{room_id}/settings")]
pub async fn update_settings(
    path: web::Path<String>,
    web::Json(update): web::Json<SettingsUpdate>,
    registry: web::Data<SharedRegistry>,
) -> impl Responder {
    let room_id = path.into_inner();

    let Some(room) = registry.read().await.get(&room_id) else {
        return error_response(RoomError::RoomNotFound);
    };

    let result = room.write().await.update_settings(
        &update.caller_id,
        update.allow_guests_control,
        update.allow_guests_add_tracks,
    );

    match result {
        Ok(()) => HttpResponse::Ok().json(json!({"updated": true})),
        Err(err) => error_response(err),
    }
}

#[get("/v1/stats")]
pub async fn stats(registry: web::Data<SharedRegistry>) -> impl Responder {
    let rooms = registry.read().await.iter_snapshot();
    let mut entries = Vec::with_capacity(rooms.len());

    for (room_id, room) in rooms {
        let guard = room.read().await;
        entries.push(json!({
            "roomId": room_id,
            "state": guard.state,
            "memberCount": guard.member_count(),
            "queueLen": guard.queue.len(),
            "hostConnected": guard.host_connected(),
        }));
    }

    HttpResponse::Ok().json(json!({
        "roomCount": entries.len(),
        "rooms": entries,
    }))
}
