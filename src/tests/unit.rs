use std::sync::Arc;
use std::time::Duration;

use actix_rt::time::timeout;
use tokio::sync::{RwLock, mpsc};

use crate::jamsync::broadcaster::{ClientHandle, Outbound};
use crate::jamsync::config::Config;
use crate::jamsync::health;
use crate::jamsync::protocol::{
    ErrorReason, Frame, SettingsPayload, ack_frame, epoch_ms, event_frame,
};
use crate::jamsync::registry::{RoomRegistry, SharedRegistry};
use crate::jamsync::room::{
    HEALTH_PRINCIPAL, PlaybackAction, Room, RoomError, RoomEvent, RoomState, TimerCmd, Track,
};

const HOST: &str = "H";
const GUEST: &str = "G";

type EventRx = mpsc::UnboundedReceiver<RoomEvent>;
type TimerRx = mpsc::UnboundedReceiver<TimerCmd>;

fn room_fixture() -> (Room, EventRx, TimerRx) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let room = Room::new("r1", HOST, &Config::default(), events_tx, timer_tx);

    (room, events_rx, timer_rx)
}

fn handle_for(sender_id: &str) -> (ClientHandle, mpsc::Receiver<Outbound>) {
    ClientHandle::new(sender_id, 32)
}

fn track(id: &str, duration_ms: i64) -> Track {
    Track::new(
        id.to_owned(),
        Some(format!("Track {id}")),
        Some(duration_ms),
        HOST.to_owned(),
    )
}

fn drain_events(rx: &mut EventRx) -> Vec<RoomEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn last_timer_cmd(rx: &mut TimerRx) -> Option<TimerCmd> {
    let mut last = None;
    while let Ok(cmd) = rx.try_recv() {
        last = Some(cmd);
    }
    last
}

fn queue_ids(room: &Room) -> Vec<String> {
    room.queue.iter().map(|t| t.track_id.clone()).collect()
}

/// The command-visible state of a room, for before/after comparisons.
fn fingerprint(room: &Room) -> (RoomState, Vec<String>, Option<usize>, bool, bool, usize) {
    (
        room.state,
        queue_ids(room),
        room.now_playing_index(),
        room.allow_guests_control,
        room.allow_guests_edit_queue,
        room.member_count(),
    )
}

fn frame_json(out: Outbound) -> serde_json::Value {
    match out {
        Outbound::Frame(frame) => serde_json::from_str(&frame).expect("frame is not valid JSON"),
        Outbound::Close => panic!("unexpected close marker"),
    }
}

async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> serde_json::Value {
    let out = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for outbound frame")
        .expect("outbound channel closed");

    frame_json(out)
}

/// Skips frames until the wanted system event shows up; ordering between
/// system events stays strict because they ride one per-room stream.
async fn next_system(rx: &mut mpsc::Receiver<Outbound>, sub_type: &str) -> serde_json::Value {
    loop {
        let frame = next_frame(rx).await;
        if frame["type"] == "system" && frame["subType"] == sub_type {
            return frame;
        }
    }
}

async fn next_playback(rx: &mut mpsc::Receiver<Outbound>) -> serde_json::Value {
    loop {
        let frame = next_frame(rx).await;
        if frame["type"] == "playback" {
            return frame;
        }
    }
}

async fn expect_close(rx: &mut mpsc::Receiver<Outbound>) {
    loop {
        let out = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for close marker");

        match out {
            Some(Outbound::Close) | None => return,
            Some(Outbound::Frame(_)) => continue,
        }
    }
}

// Wire schema

#[test]
fn frames_decode_with_optional_fields_missing() {
    let frame: Frame = serde_json::from_str(
        r#"{"type":"auth","roomId":"r1","senderId":"H","data":{"isHost":true}}"#,
    )
    .expect("minimal auth frame should decode");

    assert_eq!(frame.msg_type, "auth");
    assert_eq!(frame.room_id.as_deref(), Some("r1"));
    assert_eq!(frame.sender_id.as_deref(), Some("H"));
    assert!(frame.sub_type.is_none());
    assert!(frame.correlation_id.is_none());
}

#[test]
fn frames_without_a_type_do_not_decode() {
    assert!(serde_json::from_str::<Frame>(r#"{"roomId":"r1","senderId":"H"}"#).is_err());
}

#[test]
fn reason_strings_are_stable() {
    for (reason, s) in [
        (ErrorReason::MissingRequiredFields, "missing_required_fields"),
        (ErrorReason::InvalidMessage, "invalid_message"),
        (ErrorReason::MissingParams, "missing_params"),
        (ErrorReason::UnknownMessageType, "unknown_message_type"),
        (ErrorReason::UnknownSubtype, "unknown_subtype"),
        (ErrorReason::RoomNotFound, "room_not_found"),
        (ErrorReason::RoomNotActive, "room_not_active"),
        (ErrorReason::JoinFailed, "join_failed"),
        (ErrorReason::InvalidSession, "invalid_session"),
        (ErrorReason::NotAuthorized, "not_authorized"),
        (ErrorReason::ActionFailed, "action_failed"),
        (ErrorReason::ProcessingError, "processing_error"),
    ] {
        assert_eq!(reason.as_str(), s);
    }
}

#[test]
fn ack_envelopes_echo_the_correlation_id() {
    let ack: serde_json::Value =
        serde_json::from_str(&ack_frame(false, "action_failed", Some("c42"))).unwrap();

    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["data"]["success"], false);
    assert_eq!(ack["data"]["reason"], "action_failed");
    assert_eq!(ack["data"]["correlationId"], "c42");
    assert!(ack["data"]["timestamp"].is_i64());
}

#[test]
fn broadcast_envelopes_carry_room_and_timestamp() {
    let playback: serde_json::Value = serde_json::from_str(&event_frame(
        "r1",
        &RoomEvent::Playback {
            action: PlaybackAction::Play,
            track_index: Some(2),
            position_ms: 1_500,
        },
    ))
    .unwrap();

    assert_eq!(playback["type"], "playback");
    assert_eq!(playback["data"]["action"], "play");
    assert_eq!(playback["data"]["currentTrackIndex"], 2);
    assert_eq!(playback["data"]["positionMs"], 1_500);
    assert_eq!(playback["data"]["roomId"], "r1");
    assert!(playback["data"]["timestamp"].is_i64());

    let ended: serde_json::Value =
        serde_json::from_str(&event_frame("r1", &RoomEvent::PlaylistEnded)).unwrap();

    assert_eq!(ended["type"], "system");
    assert_eq!(ended["subType"], "playlist_ended");
    assert_eq!(ended["data"]["roomId"], "r1");
}

#[test]
fn settings_payload_reads_the_add_tracks_wire_name() {
    let payload: SettingsPayload =
        serde_json::from_str(r#"{"allowGuestsAddTracks":true}"#).unwrap();

    assert_eq!(payload.allow_guests_add_tracks, Some(true));
    assert_eq!(payload.allow_guests_control, None);
}

// Membership

#[test]
fn host_and_guest_join_emit_their_events() {
    let (mut room, mut events, _timers) = room_fixture();
    let (host, _rx) = handle_for(HOST);
    let (guest, _grx) = handle_for(GUEST);

    assert!(room.attach_member(HOST, host, true).is_ok());
    assert!(room.attach_member(GUEST, guest, false).is_ok());
    assert_eq!(room.member_count(), 2);
    assert!(room.host_connected());
    // Joining with nothing queued keeps the room idle.
    assert_eq!(room.state, RoomState::Created);

    let events = drain_events(&mut events);
    assert!(matches!(&events[0], RoomEvent::HostConnected { sender_id } if sender_id == HOST));
    assert!(matches!(&events[1], RoomEvent::UserJoined { sender_id } if sender_id == GUEST));
}

#[test]
fn newer_connection_displaces_older_for_same_sender() {
    let (mut room, _events, _timers) = room_fixture();
    let (first, mut first_rx) = handle_for(HOST);
    let (second, _rx) = handle_for(HOST);

    room.attach_member(HOST, first, true).unwrap();
    room.attach_member(HOST, second, true).unwrap();

    assert_eq!(room.member_count(), 1);
    // The displaced connection got its close marker.
    assert!(matches!(first_rx.try_recv(), Ok(Outbound::Close)));
}

#[test]
fn repeat_join_with_same_connection_is_idempotent() {
    let (mut room, _events, _timers) = room_fixture();
    let (host, mut rx) = handle_for(HOST);

    room.attach_member(HOST, host.clone(), true).unwrap();
    room.attach_member(HOST, host, true).unwrap();

    assert_eq!(room.member_count(), 1);
    assert!(rx.try_recv().is_err());
}

#[test]
fn guest_can_join_while_host_is_briefly_away() {
    let (mut room, _events, _timers) = room_fixture();
    let (host, _hrx) = handle_for(HOST);
    let (guest, _grx) = handle_for(GUEST);

    room.attach_member(HOST, host.clone(), true).unwrap();
    room.detach_member(host.conn_id());
    assert_eq!(room.state, RoomState::HostDisconnected);

    assert!(room.attach_member(GUEST, guest, false).is_ok());
}

#[test]
fn guest_join_fails_once_host_is_long_gone() {
    let (mut room, _events, _timers) = room_fixture();
    let (guest, _grx) = handle_for(GUEST);

    room.last_host_activity_at = epoch_ms() - 700_000;

    assert_eq!(
        room.attach_member(GUEST, guest, false),
        Err(RoomError::JoinFailed)
    );
    assert_eq!(room.member_count(), 0);
}

#[test]
fn host_disconnect_freezes_playback_and_reconnect_resumes() {
    let (mut room, mut events, mut timers) = room_fixture();
    let (host, _hrx) = handle_for(HOST);

    room.attach_member(HOST, host.clone(), true).unwrap();
    room.add_track(HOST, "t1", None, Some(180_000)).unwrap();
    room.play(HOST, Some(0), Some(5_000)).unwrap();
    drain_events(&mut events);

    room.detach_member(host.conn_id());

    assert_eq!(room.state, RoomState::HostDisconnected);
    assert_eq!(last_timer_cmd(&mut timers), Some(TimerCmd::Disarm));
    let events_after_drop = drain_events(&mut events);
    assert!(
        events_after_drop
            .iter()
            .any(|e| matches!(e, RoomEvent::HostDisconnected))
    );

    // Frozen: the reported position no longer depends on the clock.
    let playback = room.playback.as_ref().unwrap();
    let frozen = playback.position(epoch_ms());
    assert_eq!(frozen, playback.position(epoch_ms() + 60_000));

    let (host2, _hrx2) = handle_for(HOST);
    room.attach_member(HOST, host2, true).unwrap();

    assert_eq!(room.state, RoomState::Active);
    assert!(matches!(
        last_timer_cmd(&mut timers),
        Some(TimerCmd::Arm { .. })
    ));
    let events_after_return = drain_events(&mut events);
    assert!(
        events_after_return
            .iter()
            .any(|e| matches!(e, RoomEvent::HostReconnected { .. }))
    );
}

// Playback

#[test]
fn play_activates_room_and_arms_timer() {
    let (mut room, mut events, mut timers) = room_fixture();

    room.add_track(HOST, "t1", Some("A".into()), Some(180_000))
        .unwrap();
    room.add_track(HOST, "t2", Some("B".into()), Some(0)).unwrap();
    drain_events(&mut events);

    let before = epoch_ms();
    room.play(HOST, Some(0), Some(0)).unwrap();

    assert_eq!(room.state, RoomState::Active);
    assert_eq!(room.now_playing_index(), Some(0));

    match last_timer_cmd(&mut timers) {
        Some(TimerCmd::Arm { deadline_ms }) => {
            assert!(deadline_ms >= before + 180_000);
            assert!(deadline_ms <= epoch_ms() + 180_000);
        }
        other => panic!("expected an armed timer, got {other:?}"),
    }

    let events = drain_events(&mut events);
    assert!(matches!(
        events.as_slice(),
        [RoomEvent::Playback { track_index: Some(0), position_ms: 0, .. }]
    ));
}

#[test]
fn unknown_duration_never_arms_the_timer() {
    let (mut room, _events, mut timers) = room_fixture();

    room.add_track(HOST, "t1", None, Some(0)).unwrap();
    room.play(HOST, Some(0), None).unwrap();

    assert_eq!(room.state, RoomState::Active);
    assert_eq!(last_timer_cmd(&mut timers), Some(TimerCmd::Disarm));
}

#[test]
fn play_on_empty_queue_fails() {
    let (mut room, mut events, _timers) = room_fixture();

    assert_eq!(room.play(HOST, None, None), Err(RoomError::ActionFailed));
    assert!(drain_events(&mut events).is_empty());
}

#[test]
fn pause_then_bare_play_resumes_the_frozen_position() {
    let (mut room, _events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, Some(180_000)).unwrap();
    room.play(HOST, Some(0), Some(42_000)).unwrap();
    room.pause(HOST).unwrap();

    let frozen = room.playback.as_ref().unwrap().position(epoch_ms());
    assert!((42_000..43_000).contains(&frozen));
    assert_eq!(room.state, RoomState::Paused);

    room.play(HOST, None, None).unwrap();

    assert_eq!(room.state, RoomState::Active);
    let resumed = room.playback.as_ref().unwrap().position(epoch_ms());
    assert!((frozen..frozen + 1_000).contains(&resumed));
}

#[test]
fn pause_without_a_current_track_fails() {
    let (mut room, mut events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, None).unwrap();
    drain_events(&mut events);

    assert_eq!(room.pause(HOST), Err(RoomError::ActionFailed));
    assert!(drain_events(&mut events).is_empty());
}

#[test]
fn seek_accepts_the_exact_duration_and_rejects_past_it() {
    let (mut room, mut events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, Some(180_000)).unwrap();
    room.play(HOST, Some(0), Some(0)).unwrap();
    drain_events(&mut events);

    assert!(room.seek(HOST, 180_000).is_ok());
    assert_eq!(room.seek(HOST, 180_001), Err(RoomError::ActionFailed));
    assert_eq!(room.seek(HOST, -1), Err(RoomError::ActionFailed));

    // Only the accepted seek broadcast.
    let events = drain_events(&mut events);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        RoomEvent::Playback { position_ms: 180_000, .. }
    ));
}

#[test]
fn seek_while_paused_updates_position_but_stays_paused() {
    let (mut room, _events, mut timers) = room_fixture();

    room.add_track(HOST, "t1", None, Some(180_000)).unwrap();
    room.play(HOST, Some(0), Some(0)).unwrap();
    room.pause(HOST).unwrap();

    room.seek(HOST, 30_000).unwrap();

    assert_eq!(room.state, RoomState::Paused);
    assert_eq!(room.playback.as_ref().unwrap().position(epoch_ms()), 30_000);
    assert_eq!(last_timer_cmd(&mut timers), Some(TimerCmd::Disarm));
}

#[test]
fn next_walks_the_queue_and_ends_past_the_last_track() {
    let (mut room, mut events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, Some(1_000)).unwrap();
    room.add_track(HOST, "t2", None, Some(1_000)).unwrap();
    room.play(HOST, Some(0), Some(0)).unwrap();
    drain_events(&mut events);

    assert!(room.next(HOST).is_ok());
    assert_eq!(room.now_playing_index(), Some(1));
    assert_eq!(room.state, RoomState::Active);

    // Past the end: playback clears, the room idles, and the failure is
    // reported alongside the ended announcement.
    assert_eq!(room.next(HOST), Err(RoomError::ActionFailed));
    assert_eq!(room.now_playing_index(), None);
    assert_eq!(room.state, RoomState::Created);

    let events = drain_events(&mut events);
    assert!(matches!(
        events.as_slice(),
        [
            RoomEvent::Playback { track_index: Some(1), .. },
            RoomEvent::PlaylistEnded,
        ]
    ));
}

#[test]
fn previous_retreats_and_fails_at_the_first_track() {
    let (mut room, _events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, None).unwrap();
    room.add_track(HOST, "t2", None, None).unwrap();
    room.play(HOST, Some(1), Some(0)).unwrap();

    assert!(room.previous(HOST).is_ok());
    assert_eq!(room.now_playing_index(), Some(0));
    assert_eq!(room.previous(HOST), Err(RoomError::ActionFailed));
    assert_eq!(room.now_playing_index(), Some(0));
}

// Queue

#[test]
fn add_then_remove_last_restores_the_queue() {
    let (mut room, _events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, None).unwrap();
    let before = queue_ids(&room);

    room.add_track(HOST, "t2", None, None).unwrap();
    room.remove_track(HOST, room.queue.len() - 1).unwrap();

    assert_eq!(queue_ids(&room), before);
}

#[test]
fn move_there_and_back_is_identity() {
    let (mut room, _events, _timers) = room_fixture();

    for id in ["t1", "t2", "t3", "t4"] {
        room.add_track(HOST, id, None, None).unwrap();
    }
    room.play(HOST, Some(2), Some(0)).unwrap();
    let before = queue_ids(&room);

    room.move_track(HOST, 0, 3).unwrap();
    room.move_track(HOST, 3, 0).unwrap();

    assert_eq!(queue_ids(&room), before);
    assert_eq!(room.now_playing_index(), Some(2));
}

#[test]
fn move_preserves_the_identity_of_the_playing_track() {
    let (mut room, _events, _timers) = room_fixture();

    for id in ["t1", "t2", "t3"] {
        room.add_track(HOST, id, None, None).unwrap();
    }
    room.play(HOST, Some(1), Some(0)).unwrap();

    // Moving the playing track itself follows it.
    room.move_track(HOST, 1, 0).unwrap();
    assert_eq!(room.current_track().unwrap().track_id, "t2");
    assert_eq!(room.now_playing_index(), Some(0));

    // Moving another track around it shifts the index accordingly.
    room.move_track(HOST, 2, 0).unwrap();
    assert_eq!(room.current_track().unwrap().track_id, "t2");
    assert_eq!(room.now_playing_index(), Some(1));
}

#[test]
fn removing_the_playing_track_clears_playback_quietly() {
    let (mut room, mut events, mut timers) = room_fixture();

    room.add_track(HOST, "t1", None, Some(60_000)).unwrap();
    room.add_track(HOST, "t2", None, None).unwrap();
    room.play(HOST, Some(0), Some(0)).unwrap();
    drain_events(&mut events);

    room.remove_track(HOST, 0).unwrap();

    assert_eq!(room.now_playing_index(), None);
    assert_eq!(room.state, RoomState::Created);
    assert_eq!(last_timer_cmd(&mut timers), Some(TimerCmd::Disarm));

    // A removal broadcast, but no end-of-playlist announcement.
    let events = drain_events(&mut events);
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], RoomEvent::PlaylistUpdate(_)));
}

#[test]
fn removing_an_earlier_track_shifts_the_playing_index() {
    let (mut room, _events, _timers) = room_fixture();

    for id in ["t1", "t2", "t3"] {
        room.add_track(HOST, id, None, None).unwrap();
    }
    room.play(HOST, Some(2), Some(0)).unwrap();

    room.remove_track(HOST, 0).unwrap();

    assert_eq!(room.now_playing_index(), Some(1));
    assert_eq!(room.current_track().unwrap().track_id, "t3");
}

#[test]
fn replace_queue_keeps_the_current_index_when_in_range() {
    let (mut room, _events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, None).unwrap();
    room.add_track(HOST, "t2", None, None).unwrap();
    room.play(HOST, Some(1), Some(0)).unwrap();

    room.replace_queue(HOST, vec![track("n1", 0), track("n2", 0), track("n3", 0)])
        .unwrap();

    assert_eq!(queue_ids(&room), ["n1", "n2", "n3"]);
    assert_eq!(room.now_playing_index(), Some(1));
    assert_eq!(room.current_track().unwrap().track_id, "n2");
}

#[test]
fn replace_queue_clears_playback_when_out_of_range() {
    let (mut room, _events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, None).unwrap();
    room.add_track(HOST, "t2", None, None).unwrap();
    room.play(HOST, Some(1), Some(0)).unwrap();

    room.replace_queue(HOST, vec![track("n1", 0)]).unwrap();

    assert_eq!(room.now_playing_index(), None);
    assert_eq!(room.state, RoomState::Created);
}

#[test]
fn replace_queue_is_host_only_regardless_of_queue_permissions() {
    let (mut room, _events, _timers) = room_fixture();

    room.update_settings(HOST, None, Some(true)).unwrap();

    assert_eq!(
        room.replace_queue(GUEST, vec![track("n1", 0)]),
        Err(RoomError::NotAuthorized)
    );
}

#[test]
fn clear_queue_is_host_only() {
    let (mut room, _events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, None).unwrap();

    assert_eq!(room.clear_queue(GUEST), Err(RoomError::NotAuthorized));

    room.clear_queue(HOST).unwrap();
    assert!(room.queue.is_empty());
    assert_eq!(room.now_playing_index(), None);
}

#[test]
fn empty_titles_become_a_placeholder() {
    let (mut room, _events, _timers) = room_fixture();

    room.add_track(HOST, "t1", Some("  ".into()), None).unwrap();
    room.add_track(HOST, "t2", None, None).unwrap();

    assert!(room.queue.iter().all(|t| t.title == "Unknown Track"));
}

// Permissions

#[test]
fn guests_control_by_default_but_cannot_edit_the_queue() {
    let (mut room, _events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, None).unwrap();

    assert!(room.play(GUEST, Some(0), Some(0)).is_ok());
    assert_eq!(
        room.add_track(GUEST, "t2", None, None),
        Err(RoomError::NotAuthorized)
    );

    room.update_settings(HOST, Some(false), Some(true)).unwrap();

    assert_eq!(room.pause(GUEST), Err(RoomError::NotAuthorized));
    assert!(room.add_track(GUEST, "t2", None, None).is_ok());
}

#[test]
fn settings_are_host_only() {
    let (mut room, mut events, _timers) = room_fixture();
    drain_events(&mut events);

    assert_eq!(
        room.update_settings(GUEST, Some(false), None),
        Err(RoomError::NotAuthorized)
    );
    assert!(drain_events(&mut events).is_empty());

    room.update_settings(HOST, None, Some(true)).unwrap();
    let events = drain_events(&mut events);
    assert!(matches!(
        events.as_slice(),
        [RoomEvent::SettingsUpdated {
            allow_guests_control: true,
            allow_guests_edit_queue: true,
        }]
    ));
}

// Failure atomicity

#[test]
fn failed_commands_leave_the_room_untouched_and_silent() {
    let (mut room, mut events, _timers) = room_fixture();

    room.add_track(HOST, "t1", None, Some(60_000)).unwrap();
    room.add_track(HOST, "t2", None, None).unwrap();
    room.play(HOST, Some(0), Some(10_000)).unwrap();
    room.pause(HOST).unwrap();
    drain_events(&mut events);

    let before = fingerprint(&room);
    let frozen_before = room.playback.as_ref().unwrap().position(epoch_ms());

    assert!(room.play(HOST, Some(9), None).is_err());
    assert!(room.seek(HOST, 60_001).is_err());
    assert!(room.seek(HOST, -5).is_err());
    assert!(room.remove_track(HOST, 7).is_err());
    assert!(room.move_track(HOST, 0, 9).is_err());
    assert!(room.add_track(GUEST, "t3", None, None).is_err());
    assert!(room.add_track(HOST, "   ", None, None).is_err());
    assert!(room.update_settings(GUEST, Some(false), None).is_err());
    assert!(room.clear_queue(GUEST).is_err());

    assert_eq!(fingerprint(&room), before);
    assert_eq!(
        room.playback.as_ref().unwrap().position(epoch_ms()),
        frozen_before
    );
    assert!(drain_events(&mut events).is_empty());
}

#[test]
fn now_playing_index_stays_in_bounds_through_queue_churn() {
    let (mut room, _events, _timers) = room_fixture();

    for id in ["t1", "t2", "t3", "t4", "t5"] {
        room.add_track(HOST, id, None, None).unwrap();
    }
    room.play(HOST, Some(4), Some(0)).unwrap();

    let ops: Vec<Box<dyn Fn(&mut Room) -> Result<(), RoomError>>> = vec![
        Box::new(|r| r.remove_track(HOST, 0)),
        Box::new(|r| r.move_track(HOST, 0, 2)),
        Box::new(|r| r.remove_track(HOST, r.queue.len().saturating_sub(1))),
        Box::new(|r| r.next(HOST)),
        Box::new(|r| r.remove_track(HOST, 0)),
        Box::new(|r| r.previous(HOST)),
    ];

    for op in ops {
        let _ = op(&mut room);
        if let Some(index) = room.now_playing_index() {
            assert!(index < room.queue.len());
        }
    }
}

// Registry

#[actix_rt::test]
async fn registry_validates_ids_and_uniqueness() {
    let mut registry = RoomRegistry::new(Config::default());

    assert!(matches!(registry.create("  ", HOST), Err(RoomError::InvalidId)));
    assert!(matches!(registry.create("r1", " "), Err(RoomError::InvalidId)));
    assert!(registry.create("r1", HOST).is_ok());
    assert!(matches!(registry.create("r1", "H2"), Err(RoomError::RoomExists)));
    assert!(registry.exists("r1"));
    assert_eq!(registry.len(), 1);
}

#[actix_rt::test]
async fn registry_delete_requires_host_or_health_principal() {
    let mut registry = RoomRegistry::new(Config::default());
    registry.create("r1", HOST).unwrap();

    assert_eq!(
        registry.delete("r1", GUEST).await,
        Err(RoomError::NotAuthorized)
    );
    assert!(registry.delete("r1", HOST).await.is_ok());
    assert_eq!(
        registry.delete("r1", HOST).await,
        Err(RoomError::RoomNotFound)
    );

    registry.create("r2", HOST).unwrap();
    assert!(registry.delete("r2", HEALTH_PRINCIPAL).await.is_ok());
    assert!(registry.is_empty());
}

#[actix_rt::test]
async fn deleting_a_room_notifies_and_closes_its_members() {
    let mut registry = RoomRegistry::new(Config::default());
    let room = registry.create("r1", HOST).unwrap();

    let (guest, mut guest_rx) = handle_for(GUEST);
    room.write().await.attach_member(GUEST, guest, false).unwrap();

    registry.delete("r1", HOST).await.unwrap();

    let frame = next_system(&mut guest_rx, "room_closed").await;
    assert_eq!(frame["data"]["roomId"], "r1");
    expect_close(&mut guest_rx).await;
}

#[actix_rt::test]
async fn timer_advances_to_the_next_track_and_then_runs_open_ended() {
    let mut registry = RoomRegistry::new(Config::default());
    let room = registry.create("r1", HOST).unwrap();

    let (guest, mut guest_rx) = handle_for(GUEST);
    {
        let mut guard = room.write().await;
        guard.attach_member(GUEST, guest, false).unwrap();
        guard.add_track(HOST, "t1", None, Some(250)).unwrap();
        guard.add_track(HOST, "t2", None, Some(0)).unwrap();
        guard.play(HOST, Some(0), Some(0)).unwrap();
    }

    // First the play broadcast, then the automatic advance.
    let first = next_playback(&mut guest_rx).await;
    assert_eq!(first["data"]["currentTrackIndex"], 0);

    let second = next_playback(&mut guest_rx).await;
    assert_eq!(second["data"]["action"], "play");
    assert_eq!(second["data"]["currentTrackIndex"], 1);
    assert_eq!(second["data"]["positionMs"], 0);

    let guard = room.read().await;
    assert_eq!(guard.state, RoomState::Active);
    assert_eq!(guard.now_playing_index(), Some(1));
}

#[actix_rt::test]
async fn timer_on_the_last_track_ends_the_playlist() {
    let mut registry = RoomRegistry::new(Config::default());
    let room = registry.create("r1", HOST).unwrap();

    let (guest, mut guest_rx) = handle_for(GUEST);
    {
        let mut guard = room.write().await;
        guard.attach_member(GUEST, guest, false).unwrap();
        guard.add_track(HOST, "t1", None, Some(250)).unwrap();
        guard.play(HOST, Some(0), Some(0)).unwrap();
    }

    let first = next_playback(&mut guest_rx).await;
    assert_eq!(first["data"]["currentTrackIndex"], 0);

    next_system(&mut guest_rx, "playlist_ended").await;

    let guard = room.read().await;
    assert_eq!(guard.state, RoomState::Created);
    assert_eq!(guard.now_playing_index(), None);
}

// Health monitor

fn monitor_config() -> Config {
    Config::default()
}

#[actix_rt::test]
async fn liveness_scan_reports_a_dead_host_exactly_once() {
    let config = monitor_config();
    let registry: SharedRegistry =
        Arc::new(RwLock::new(RoomRegistry::new(config.clone())));
    let room = registry.write().await.create("r1", HOST).unwrap();

    let (guest, mut guest_rx) = handle_for(GUEST);
    {
        let mut guard = room.write().await;
        guard.attach_member(GUEST, guest, false).unwrap();
        guard.last_host_activity_at = epoch_ms() - 700_000;
        // Keep overall activity fresh so only the host edge trips.
        guard.last_activity_at = epoch_ms();
    }

    health::scan_once(&registry, &config).await;
    health::scan_once(&registry, &config).await;
    health::scan_once(&registry, &config).await;

    next_system(&mut guest_rx, "host_disconnected").await;

    actix_rt::time::sleep(Duration::from_millis(100)).await;
    assert!(guest_rx.try_recv().is_err(), "edge event was not deduplicated");
}

#[actix_rt::test]
async fn recovery_announces_health_check_passed_once() {
    let config = monitor_config();
    let registry: SharedRegistry =
        Arc::new(RwLock::new(RoomRegistry::new(config.clone())));
    let room = registry.write().await.create("r1", HOST).unwrap();

    let (guest, mut guest_rx) = handle_for(GUEST);
    {
        let mut guard = room.write().await;
        guard.attach_member(GUEST, guest, false).unwrap();
        guard.last_host_activity_at = epoch_ms() - 700_000;
        guard.last_activity_at = epoch_ms();
    }

    health::scan_once(&registry, &config).await;
    next_system(&mut guest_rx, "host_disconnected").await;

    // The host shows up again.
    room.write().await.last_host_activity_at = epoch_ms();

    health::scan_once(&registry, &config).await;
    health::scan_once(&registry, &config).await;

    next_system(&mut guest_rx, "health_check_passed").await;

    actix_rt::time::sleep(Duration::from_millis(100)).await;
    assert!(
        guest_rx.try_recv().is_err(),
        "rising edge was not deduplicated"
    );
}

#[actix_rt::test]
async fn disconnected_room_expires_after_the_window() {
    let config = monitor_config();
    let registry: SharedRegistry =
        Arc::new(RwLock::new(RoomRegistry::new(config.clone())));
    let room = registry.write().await.create("r1", HOST).unwrap();

    let (host, _host_rx) = handle_for(HOST);
    let (guest, mut guest_rx) = handle_for(GUEST);
    {
        let mut guard = room.write().await;
        guard.attach_member(HOST, host.clone(), true).unwrap();
        guard.attach_member(GUEST, guest, false).unwrap();
        guard.detach_member(host.conn_id());
        // Stale past the window, but not past the host timeout.
        guard.last_activity_at = epoch_ms() - 301_000;
        guard.last_host_activity_at = epoch_ms() - 301_000;
    }

    health::scan_once(&registry, &config).await;

    next_system(&mut guest_rx, "host_disconnected").await;
    next_system(&mut guest_rx, "room_expired").await;
    next_system(&mut guest_rx, "room_closed").await;
    expect_close(&mut guest_rx).await;

    assert!(!registry.read().await.exists("r1"));
}

#[actix_rt::test]
async fn sweeper_culls_rooms_whose_host_never_returned() {
    let config = monitor_config();
    let registry: SharedRegistry =
        Arc::new(RwLock::new(RoomRegistry::new(config.clone())));
    let room = registry.write().await.create("r1", HOST).unwrap();

    room.write().await.last_host_activity_at = epoch_ms() - 301_000;

    health::sweep_once(&registry, &config).await;

    assert!(!registry.read().await.exists("r1"));
}

#[actix_rt::test]
async fn expiration_check_is_a_noop_for_a_returned_host() {
    let config = monitor_config();
    let registry: SharedRegistry =
        Arc::new(RwLock::new(RoomRegistry::new(config.clone())));
    let room = registry.write().await.create("r1", HOST).unwrap();

    let (host, _host_rx) = handle_for(HOST);
    room.write().await.attach_member(HOST, host, true).unwrap();

    health::expire_if_stale(&registry, "r1", &config).await;

    assert!(registry.read().await.exists("r1"));
}

#[actix_rt::test]
async fn scan_leaves_a_healthy_room_alone() {
    let config = monitor_config();
    let registry: SharedRegistry =
        Arc::new(RwLock::new(RoomRegistry::new(config.clone())));
    let room = registry.write().await.create("r1", HOST).unwrap();

    let (host, mut host_rx) = handle_for(HOST);
    room.write().await.attach_member(HOST, host, true).unwrap();

    health::scan_once(&registry, &config).await;
    health::sweep_once(&registry, &config).await;

    actix_rt::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.read().await.exists("r1"));
    assert!(host_rx.try_recv().is_err());
}
