use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use actix_rt::time;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use super::broadcaster::ClientHandle;
use super::config::Config;
use super::protocol::epoch_ms;

/// Reserved principal allowed to delete rooms on behalf of the health
/// subsystem.
pub const HEALTH_PRINCIPAL: &str = "health_system";

/// Slack granted to timer fires racing a reschedule; a fire earlier than
/// this against the current deadline is treated as stale.
const ADVANCE_SLACK_MS: i64 = 25;

pub type RoomId = String;
pub type SenderId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Created,
    Active,
    Paused,
    HostDisconnected,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RoomError {
    RoomExists,
    InvalidId,
    RoomNotFound,
    NotAuthorized,
    ActionFailed,
    JoinFailed,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub track_id: String,
    pub title: String,
    pub added_by: SenderId,
    pub added_at: i64,
    pub duration_ms: i64,
}

impl Track {
    /// `added_at` is stamped server-side; empty titles and negative
    /// durations are normalized on the way in.
    pub fn new(
        track_id: String,
        title: Option<String>,
        duration_ms: Option<i64>,
        added_by: SenderId,
    ) -> Self {
        let title = match title {
            Some(t) if !t.trim().is_empty() => t,
            _ => "Unknown Track".to_owned(),
        };

        Self {
            track_id,
            title,
            added_by,
            added_at: epoch_ms(),
            duration_ms: duration_ms.unwrap_or(0).max(0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackAction {
    Play,
    Pause,
    Seek,
}

impl PlaybackAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Seek => "seek",
        }
    }
}

#[derive(Clone, Debug)]
pub enum PlaylistChange {
    Add { track: Track },
    Remove { index: usize },
    Move { from: usize, to: usize },
}

/// Everything the broadcaster fans out to room members. Events are pushed
/// while the room write lock is held, so channel order equals command order.
#[derive(Clone, Debug)]
pub enum RoomEvent {
    UserJoined {
        sender_id: SenderId,
    },
    UserLeft {
        sender_id: SenderId,
    },
    HostConnected {
        sender_id: SenderId,
    },
    HostReconnected {
        sender_id: SenderId,
    },
    HostDisconnected,
    Playback {
        action: PlaybackAction,
        track_index: Option<usize>,
        position_ms: i64,
    },
    PlaylistUpdate(PlaylistChange),
    PlaylistCleared,
    PlaylistSync {
        tracks: Vec<Track>,
    },
    PlaylistEnded,
    SettingsUpdated {
        allow_guests_control: bool,
        allow_guests_edit_queue: bool,
    },
    HealthWarning {
        detail: String,
    },
    HealthCheckPassed,
    RoomClosed,
    RoomExpired,
}

impl RoomEvent {
    /// Join/leave notifications are suppressed for the affected member;
    /// playback broadcasts go to everyone so all clients converge on the
    /// authoritative position.
    pub fn excluded_sender(&self) -> Option<&str> {
        match self {
            Self::UserJoined { sender_id }
            | Self::UserLeft { sender_id }
            | Self::HostConnected { sender_id }
            | Self::HostReconnected { sender_id } => Some(sender_id),
            _ => None,
        }
    }
}

/// Messages for the per-room end-of-track timer task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerCmd {
    Arm { deadline_ms: i64 },
    Disarm,
    Shutdown,
}

/// Position bookkeeping for the current track. `started_at` anchors the
/// position to the room clock; while frozen (paused or host away) the
/// position is stored explicitly so it is stable across snapshots.
#[derive(Clone, Debug)]
pub struct Playback {
    pub index: usize,
    started_at: i64,
    paused_position: Option<i64>,
}

impl Playback {
    fn playing_at(index: usize, position_ms: i64, now: i64) -> Self {
        Self {
            index,
            started_at: now - position_ms,
            paused_position: None,
        }
    }

    pub fn position(&self, now: i64) -> i64 {
        self.paused_position
            .unwrap_or_else(|| (now - self.started_at).max(0))
    }

    fn freeze(&mut self, now: i64) {
        if self.paused_position.is_none() {
            self.paused_position = Some((now - self.started_at).max(0));
        }
    }

    fn resume(&mut self, now: i64) {
        if let Some(position) = self.paused_position.take() {
            self.started_at = now - position;
        }
    }

    fn seek_to(&mut self, position_ms: i64, now: i64) {
        if self.paused_position.is_some() {
            self.paused_position = Some(position_ms);
        } else {
            self.started_at = now - position_ms;
        }
    }

    fn deadline_ms(&self, duration_ms: i64) -> i64 {
        self.started_at + duration_ms
    }
}

/// The unit of synchronization: queue, playback, membership, permissions
/// and liveness for one party. Mutating methods are synchronous; callers
/// serialize them through the per-room write lock, which is what makes
/// every command atomic with respect to every other command on the room.
pub struct Room {
    pub id: RoomId,
    pub host_id: SenderId,
    pub state: RoomState,
    pub allow_guests_control: bool,
    pub allow_guests_edit_queue: bool,
    pub queue: Vec<Track>,
    pub playback: Option<Playback>,
    members: HashMap<SenderId, ClientHandle>,
    host_connected: bool,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub last_host_activity_at: i64,
    /// Healthy/unhealthy edge bit owned by the health monitor.
    pub health_ok: bool,
    host_timeout_ms: i64,
    events: mpsc::UnboundedSender<RoomEvent>,
    timer: mpsc::UnboundedSender<TimerCmd>,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("host_id", &self.host_id)
            .field("state", &self.state)
            .field("queue_len", &self.queue.len())
            .field("members", &self.members.len())
            .finish_non_exhaustive()
    }
}

impl Room {
    pub fn new(
        id: &str,
        host_id: &str,
        config: &Config,
        events: mpsc::UnboundedSender<RoomEvent>,
        timer: mpsc::UnboundedSender<TimerCmd>,
    ) -> Self {
        let now = epoch_ms();

        Self {
            id: id.to_owned(),
            host_id: host_id.to_owned(),
            state: RoomState::Created,
            allow_guests_control: true,
            allow_guests_edit_queue: false,
            queue: Vec::new(),
            playback: None,
            members: HashMap::new(),
            host_connected: false,
            created_at: now,
            last_activity_at: now,
            last_host_activity_at: now,
            health_ok: true,
            host_timeout_ms: config.host_timeout_ms,
            events,
            timer,
        }
    }

    // Permission predicates

    pub fn is_host(&self, sender_id: &str) -> bool {
        sender_id == self.host_id
    }

    pub fn can_control(&self, sender_id: &str) -> bool {
        self.is_host(sender_id) || self.allow_guests_control
    }

    pub fn can_edit_queue(&self, sender_id: &str) -> bool {
        self.is_host(sender_id) || self.allow_guests_edit_queue
    }

    // Derived state

    pub fn now_playing_index(&self) -> Option<usize> {
        self.playback.as_ref().map(|p| p.index)
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.playback.as_ref().and_then(|p| self.queue.get(p.index))
    }

    pub fn host_connected(&self) -> bool {
        self.host_connected
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn member_handles(&self) -> Vec<ClientHandle> {
        self.members.values().cloned().collect()
    }

    /// Stamps inbound activity for this sender; host activity keeps the
    /// room out of the health monitor's expiry rules.
    pub fn touch(&mut self, sender_id: &str) {
        let now = epoch_ms();
        self.last_activity_at = now;
        if self.is_host(sender_id) {
            self.last_host_activity_at = now;
        }
    }

    pub(crate) fn emit(&self, event: RoomEvent) {
        // The receiver only goes away during teardown.
        let _ = self.events.send(event);
    }

    fn ensure_live(&self) -> Result<(), RoomError> {
        match self.state {
            RoomState::Terminated => Err(RoomError::ActionFailed),
            _ => Ok(()),
        }
    }

    /// Keeps the end-of-track timer consistent with the room: armed iff the
    /// room is ACTIVE and the current track has a known duration.
    fn sync_timer(&self) {
        let cmd = match (&self.playback, self.state) {
            (Some(playback), RoomState::Active) => match self.queue.get(playback.index) {
                Some(track) if track.duration_ms > 0 => TimerCmd::Arm {
                    deadline_ms: playback.deadline_ms(track.duration_ms),
                },
                _ => TimerCmd::Disarm,
            },
            _ => TimerCmd::Disarm,
        };

        let _ = self.timer.send(cmd);
    }

    // Membership

    /// The host role is granted purely by sender id; a guest may enter while
    /// the host is connected or within the host-timeout window of its last
    /// activity, which keeps late joins possible during a disconnection.
    pub fn attach_member(
        &mut self,
        sender_id: &str,
        handle: ClientHandle,
        _is_host_claim: bool,
    ) -> Result<(), RoomError> {
        if self.state == RoomState::Terminated {
            return Err(RoomError::JoinFailed);
        }

        let now = epoch_ms();
        let is_host = self.is_host(sender_id);

        if !is_host
            && !self.host_connected
            && now - self.last_host_activity_at > self.host_timeout_ms
        {
            return Err(RoomError::JoinFailed);
        }

        // Re-join replaces any prior connection for this sender.
        if let Some(prior) = self.members.insert(sender_id.to_owned(), handle.clone()) {
            if prior.conn_id() != handle.conn_id() {
                debug!("[{}] replacing connection for {}", self.id, sender_id);
                prior.close();
            }
        }

        self.last_activity_at = now;

        if is_host {
            let was_disconnected = self.state == RoomState::HostDisconnected;
            self.host_connected = true;
            self.last_host_activity_at = now;

            if was_disconnected {
                if let Some(playback) = self.playback.as_mut() {
                    playback.resume(now);
                    self.state = RoomState::Active;
                } else {
                    self.state = RoomState::Created;
                }
                self.sync_timer();
                self.emit(RoomEvent::HostReconnected {
                    sender_id: sender_id.to_owned(),
                });
            } else {
                self.emit(RoomEvent::HostConnected {
                    sender_id: sender_id.to_owned(),
                });
            }
        } else {
            self.emit(RoomEvent::UserJoined {
                sender_id: sender_id.to_owned(),
            });
        }

        Ok(())
    }

    /// Removal is by connection identity so a stale close racing a re-join
    /// cannot evict the replacement. Returns the detached sender, if any.
    pub fn detach_member(&mut self, conn_id: Uuid) -> Option<SenderId> {
        let sender_id = self
            .members
            .iter()
            .find_map(|(id, handle)| (handle.conn_id() == conn_id).then(|| id.clone()))?;

        self.members.remove(&sender_id);
        let now = epoch_ms();
        self.last_activity_at = now;

        if sender_id == self.host_id {
            self.host_connected = false;
            if self.state != RoomState::Terminated {
                if let Some(playback) = self.playback.as_mut() {
                    playback.freeze(now);
                }
                self.state = RoomState::HostDisconnected;
                self.sync_timer();
                self.emit(RoomEvent::HostDisconnected);
            }
        } else {
            self.emit(RoomEvent::UserLeft {
                sender_id: sender_id.clone(),
            });
        }

        Some(sender_id)
    }

    // Playback

    pub fn play(
        &mut self,
        sender_id: &str,
        track_index: Option<usize>,
        position_ms: Option<i64>,
    ) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.can_control(sender_id) {
            return Err(RoomError::NotAuthorized);
        }
        if matches!(position_ms, Some(p) if p < 0) {
            return Err(RoomError::ActionFailed);
        }

        let index = match track_index {
            Some(i) => {
                if i >= self.queue.len() {
                    return Err(RoomError::ActionFailed);
                }
                i
            }
            None => match &self.playback {
                Some(playback) => playback.index,
                None => {
                    if self.queue.is_empty() {
                        return Err(RoomError::ActionFailed);
                    }
                    0
                }
            },
        };

        let now = epoch_ms();
        let position = position_ms.unwrap_or_else(|| match &self.playback {
            // Resuming the same track picks up the frozen position.
            Some(playback) if playback.index == index => playback.position(now),
            _ => 0,
        });

        self.playback = Some(Playback::playing_at(index, position, now));
        self.state = RoomState::Active;
        self.touch(sender_id);
        self.sync_timer();
        self.emit(RoomEvent::Playback {
            action: PlaybackAction::Play,
            track_index: Some(index),
            position_ms: position,
        });

        Ok(())
    }

    pub fn pause(&mut self, sender_id: &str) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.can_control(sender_id) {
            return Err(RoomError::NotAuthorized);
        }

        let now = epoch_ms();
        let Some(playback) = self.playback.as_mut() else {
            return Err(RoomError::ActionFailed);
        };

        playback.freeze(now);
        let (index, position) = (playback.index, playback.position(now));
        self.state = RoomState::Paused;
        self.touch(sender_id);
        self.sync_timer();
        self.emit(RoomEvent::Playback {
            action: PlaybackAction::Pause,
            track_index: Some(index),
            position_ms: position,
        });

        Ok(())
    }

    /// Advances to the next queued track. Walking past the end clears
    /// playback, announces `playlist_ended` and reports failure; this is
    /// the one command where a broadcast accompanies a failed result.
    pub fn next(&mut self, sender_id: &str) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.can_control(sender_id) {
            return Err(RoomError::NotAuthorized);
        }

        let Some(playback) = &self.playback else {
            return Err(RoomError::ActionFailed);
        };

        let next_index = playback.index + 1;
        self.touch(sender_id);

        if next_index >= self.queue.len() {
            self.playback = None;
            self.state = RoomState::Created;
            self.sync_timer();
            self.emit(RoomEvent::PlaylistEnded);
            return Err(RoomError::ActionFailed);
        }

        self.start_track(next_index);
        Ok(())
    }

    pub fn previous(&mut self, sender_id: &str) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.can_control(sender_id) {
            return Err(RoomError::NotAuthorized);
        }

        let Some(playback) = &self.playback else {
            return Err(RoomError::ActionFailed);
        };
        if playback.index == 0 {
            return Err(RoomError::ActionFailed);
        }

        let prev_index = playback.index - 1;
        self.touch(sender_id);
        self.start_track(prev_index);
        Ok(())
    }

    fn start_track(&mut self, index: usize) {
        self.playback = Some(Playback::playing_at(index, 0, epoch_ms()));
        self.state = RoomState::Active;
        self.sync_timer();
        self.emit(RoomEvent::Playback {
            action: PlaybackAction::Play,
            track_index: Some(index),
            position_ms: 0,
        });
    }

    /// Seeking keeps the play/pause state: while frozen it rewrites the
    /// stored position, while playing it re-anchors the clock and re-arms
    /// the timer. A seek to exactly the track duration is accepted.
    pub fn seek(&mut self, sender_id: &str, position_ms: i64) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.can_control(sender_id) {
            return Err(RoomError::NotAuthorized);
        }

        let now = epoch_ms();
        let Some(playback) = self.playback.as_mut() else {
            return Err(RoomError::ActionFailed);
        };
        let Some(track) = self.queue.get(playback.index) else {
            return Err(RoomError::ActionFailed);
        };
        if position_ms < 0 || (track.duration_ms > 0 && position_ms > track.duration_ms) {
            return Err(RoomError::ActionFailed);
        }

        playback.seek_to(position_ms, now);
        let index = playback.index;
        self.touch(sender_id);
        self.sync_timer();
        self.emit(RoomEvent::Playback {
            action: PlaybackAction::Seek,
            track_index: Some(index),
            position_ms,
        });

        Ok(())
    }

    /// Entry point for the end-of-track timer. Anything that changed the
    /// playback since the arm makes the fire a no-op.
    pub(crate) fn advance_track(&mut self) {
        if self.state != RoomState::Active {
            return;
        }
        let Some(playback) = &self.playback else {
            return;
        };
        let Some(track) = self.queue.get(playback.index) else {
            return;
        };
        if track.duration_ms == 0
            || epoch_ms() + ADVANCE_SLACK_MS < playback.deadline_ms(track.duration_ms)
        {
            return;
        }

        debug!("[{}] track {} elapsed, advancing", self.id, playback.index);
        let host_id = self.host_id.clone();
        let _ = self.next(&host_id);
    }

    // Queue

    pub fn add_track(
        &mut self,
        sender_id: &str,
        track_id: &str,
        title: Option<String>,
        duration_ms: Option<i64>,
    ) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.can_edit_queue(sender_id) {
            return Err(RoomError::NotAuthorized);
        }
        if track_id.trim().is_empty() {
            return Err(RoomError::ActionFailed);
        }

        let track = Track::new(
            track_id.to_owned(),
            title,
            duration_ms,
            sender_id.to_owned(),
        );
        self.queue.push(track.clone());
        self.touch(sender_id);
        self.emit(RoomEvent::PlaylistUpdate(PlaylistChange::Add { track }));

        Ok(())
    }

    pub fn remove_track(&mut self, sender_id: &str, index: usize) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.can_edit_queue(sender_id) {
            return Err(RoomError::NotAuthorized);
        }
        if index >= self.queue.len() {
            return Err(RoomError::ActionFailed);
        }

        self.queue.remove(index);

        match self.now_playing_index() {
            // The playing track is gone; back to an idle room.
            Some(current) if current == index => {
                self.playback = None;
                if matches!(self.state, RoomState::Active | RoomState::Paused) {
                    self.state = RoomState::Created;
                }
            }
            Some(current) if current > index => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.index = current - 1;
                }
            }
            _ => {}
        }

        self.touch(sender_id);
        self.sync_timer();
        self.emit(RoomEvent::PlaylistUpdate(PlaylistChange::Remove { index }));

        Ok(())
    }

    pub fn move_track(&mut self, sender_id: &str, from: usize, to: usize) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.can_edit_queue(sender_id) {
            return Err(RoomError::NotAuthorized);
        }
        if from >= self.queue.len() || to >= self.queue.len() {
            return Err(RoomError::ActionFailed);
        }

        let track = self.queue.remove(from);
        self.queue.insert(to, track);

        // The identity of the playing track is preserved across the move.
        if let Some(playback) = self.playback.as_mut() {
            if playback.index == from {
                playback.index = to;
            } else {
                let mut index = playback.index;
                if from < index {
                    index -= 1;
                }
                if to <= index {
                    index += 1;
                }
                playback.index = index;
            }
        }

        self.touch(sender_id);
        self.emit(RoomEvent::PlaylistUpdate(PlaylistChange::Move { from, to }));

        Ok(())
    }

    pub fn clear_queue(&mut self, sender_id: &str) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.is_host(sender_id) {
            return Err(RoomError::NotAuthorized);
        }

        self.queue.clear();
        self.playback = None;
        if matches!(self.state, RoomState::Active | RoomState::Paused) {
            self.state = RoomState::Created;
        }
        self.touch(sender_id);
        self.sync_timer();
        self.emit(RoomEvent::PlaylistCleared);

        Ok(())
    }

    /// Atomically swaps the whole queue. The current track survives when its
    /// index is still in range, with position and clock untouched.
    pub fn replace_queue(&mut self, sender_id: &str, tracks: Vec<Track>) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.is_host(sender_id) {
            return Err(RoomError::NotAuthorized);
        }
        if tracks.iter().any(|t| t.track_id.trim().is_empty()) {
            return Err(RoomError::ActionFailed);
        }

        self.queue = tracks;

        if self
            .now_playing_index()
            .is_some_and(|current| current >= self.queue.len())
        {
            self.playback = None;
            if matches!(self.state, RoomState::Active | RoomState::Paused) {
                self.state = RoomState::Created;
            }
        }

        self.touch(sender_id);
        self.sync_timer();
        self.emit(RoomEvent::PlaylistSync {
            tracks: self.queue.clone(),
        });

        Ok(())
    }

    // Settings

    pub fn update_settings(
        &mut self,
        sender_id: &str,
        allow_control: Option<bool>,
        allow_edit: Option<bool>,
    ) -> Result<(), RoomError> {
        self.ensure_live()?;
        if !self.is_host(sender_id) {
            return Err(RoomError::NotAuthorized);
        }

        if let Some(allow) = allow_control {
            self.allow_guests_control = allow;
        }
        if let Some(allow) = allow_edit {
            self.allow_guests_edit_queue = allow;
        }

        self.touch(sender_id);
        self.emit(RoomEvent::SettingsUpdated {
            allow_guests_control: self.allow_guests_control,
            allow_guests_edit_queue: self.allow_guests_edit_queue,
        });

        Ok(())
    }

    /// Full room state for a freshly authenticated member.
    pub fn snapshot(&self) -> Value {
        let now = epoch_ms();

        json!({
            "room": {
                "roomId": self.id,
                "hostId": self.host_id,
                "state": self.state,
                "createdAt": self.created_at,
                "memberCount": self.members.len(),
                "hostConnected": self.host_connected,
            },
            "playlist": self.queue,
            "nowPlayingIndex": self.now_playing_index(),
            "nowPlaying": self.current_track(),
            "playback": self.playback.as_ref().map(|p| json!({
                "isPlaying": self.state == RoomState::Active,
                "positionMs": p.position(now),
            })),
            "settings": {
                "allowGuestsControl": self.allow_guests_control,
                "allowGuestsEditQueue": self.allow_guests_edit_queue,
            },
            "timestamp": now,
        })
    }

    /// Terminal transition. Announces `room_closed` (the broadcaster closes
    /// the member connections after delivering it) and stops the timer task.
    pub(crate) fn terminate(&mut self) {
        if self.state == RoomState::Terminated {
            return;
        }

        self.state = RoomState::Terminated;
        self.playback = None;
        let _ = self.timer.send(TimerCmd::Shutdown);
        self.emit(RoomEvent::RoomClosed);
    }
}

/// Per-room end-of-track scheduler. One resettable sleep driven by arm and
/// disarm messages from the room's commands; a fire takes the room's write
/// lock and runs the advance, which re-checks the state it raced against.
pub(crate) async fn end_of_track_loop(
    room: Arc<RwLock<Room>>,
    mut commands: mpsc::UnboundedReceiver<TimerCmd>,
) {
    let mut armed = false;
    let mut sleep_fut = pin!(time::sleep(Duration::ZERO));

    loop {
        tokio::select! {
            biased;

            cmd = commands.recv() => {
                match cmd {
                    Some(TimerCmd::Arm { deadline_ms }) => {
                        let delay = (deadline_ms - epoch_ms()).max(0) as u64;
                        sleep_fut
                            .as_mut()
                            .reset(time::Instant::now() + Duration::from_millis(delay));
                        armed = true;
                    }
                    Some(TimerCmd::Disarm) => {
                        armed = false;
                    }
                    Some(TimerCmd::Shutdown) | None => break,
                }
            }
            _ = &mut sleep_fut, if armed => {
                armed = false;
                room.write().await.advance_track();
            }
        }
    }
}
