use std::sync::Arc;
use std::time::Duration;

use actix_rt::time;

use super::config::Config;
use super::protocol::epoch_ms;
use super::registry::SharedRegistry;
use super::room::{HEALTH_PRINCIPAL, RoomEvent, RoomId, RoomState};

/// Periodic liveness scanning and room expiration. Activity stamps live on
/// the rooms themselves; the monitor only reads them and flips the per-room
/// health bit, which is what de-duplicates the edge events.
pub struct HealthMonitor {
    registry: SharedRegistry,
    config: Config,
}

impl HealthMonitor {
    pub fn new(registry: SharedRegistry, config: Config) -> Self {
        Self { registry, config }
    }

    pub fn spawn(self) {
        let HealthMonitor { registry, config } = self;

        {
            let registry = Arc::clone(&registry);
            let config = config.clone();

            actix_rt::spawn(async move {
                let mut interval = time::interval(config.health_check_interval);

                loop {
                    interval.tick().await;
                    scan_once(&registry, &config).await;
                }
            });
        }

        actix_rt::spawn(async move {
            let mut interval = time::interval(config.cleanup_interval);

            loop {
                interval.tick().await;
                sweep_once(&registry, &config).await;
            }
        });
    }
}

/// One liveness pass over every room: host-timeout detection on the falling
/// edge, expiry of disconnected rooms past the reconnection window, and the
/// healthy rising edge. Repeated passes in the same state emit nothing.
pub(crate) async fn scan_once(registry: &SharedRegistry, config: &Config) {
    let rooms = registry.read().await.iter_snapshot();

    for (room_id, room_arc) in rooms {
        let now = epoch_ms();
        let mut expire = false;

        {
            let mut room = room_arc.write().await;

            if room.state == RoomState::Terminated {
                continue;
            }

            let host_stale = now - room.last_host_activity_at > config.host_timeout_ms;

            if host_stale && room.health_ok {
                room.health_ok = false;
                warn!("[{room_id}] host inactive beyond timeout");

                if room.state == RoomState::HostDisconnected {
                    // The disconnect was already announced at detach time.
                    room.emit(RoomEvent::HealthWarning {
                        detail: "host inactive".to_owned(),
                    });
                } else {
                    room.emit(RoomEvent::HostDisconnected);
                }

                schedule_expiration_check(
                    Arc::clone(registry),
                    room_id.clone(),
                    config.clone(),
                );
            } else if room.state == RoomState::HostDisconnected
                && now - room.last_activity_at > config.reconnection_window_ms
            {
                room.emit(RoomEvent::RoomExpired);
                expire = true;
            } else if !host_stale && !room.health_ok {
                room.health_ok = true;
                debug!("[{room_id}] health check passed");
                room.emit(RoomEvent::HealthCheckPassed);
            }
        }

        if expire {
            let _ = registry
                .write()
                .await
                .delete(&room_id, HEALTH_PRINCIPAL)
                .await;
        }
    }
}

/// Belt-and-braces reaper: culls every room whose host has been silent for
/// longer than the reconnection window, whatever state it is stuck in.
pub(crate) async fn sweep_once(registry: &SharedRegistry, config: &Config) {
    let rooms = registry.read().await.iter_snapshot();

    for (room_id, room_arc) in rooms {
        let now = epoch_ms();

        let stale = {
            let room = room_arc.read().await;
            room.state != RoomState::Terminated
                && now - room.last_host_activity_at > config.reconnection_window_ms
        };

        if !stale {
            continue;
        }

        debug!("[{room_id}] sweeping inactive room");
        room_arc.read().await.emit(RoomEvent::RoomExpired);

        let _ = registry
            .write()
            .await
            .delete(&room_id, HEALTH_PRINCIPAL)
            .await;
    }
}

/// One-shot check at the end of the reconnection window, scheduled when a
/// host drops. A host that came back in time makes this a no-op.
pub(crate) fn schedule_expiration_check(
    registry: SharedRegistry,
    room_id: RoomId,
    config: Config,
) {
    actix_rt::spawn(async move {
        time::sleep(Duration::from_millis(
            config.reconnection_window_ms.max(0) as u64
        ))
        .await;

        expire_if_stale(&registry, &room_id, &config).await;
    });
}

pub(crate) async fn expire_if_stale(registry: &SharedRegistry, room_id: &str, config: &Config) {
    let Some(room_arc) = registry.read().await.get(room_id) else {
        return;
    };

    {
        let room = room_arc.read().await;

        if room.state != RoomState::HostDisconnected
            || epoch_ms() - room.last_host_activity_at < config.reconnection_window_ms
        {
            return;
        }

        debug!("[{room_id}] reconnection window elapsed, expiring");
        room.emit(RoomEvent::RoomExpired);
    }

    let _ = registry
        .write()
        .await
        .delete(room_id, HEALTH_PRINCIPAL)
        .await;
}
