use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use actix_ws::Session;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use super::protocol;
use super::room::{Room, RoomEvent, SenderId};

/// A serialized envelope shared across every recipient of one event.
pub type WireFrame = Arc<str>;

#[derive(Debug)]
pub enum Outbound {
    Frame(WireFrame),
    Close,
}

/// One member connection as the room sees it: an id for identity checks, a
/// bounded outbound queue, and a writer task draining that queue to the
/// websocket. The queue is what serializes sends per connection and keeps a
/// slow client from delaying anyone but itself.
#[derive(Clone)]
pub struct ClientHandle {
    conn_id: Uuid,
    sender_id: SenderId,
    outbound: mpsc::Sender<Outbound>,
    open: Arc<AtomicBool>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("conn_id", &self.conn_id)
            .field("sender_id", &self.sender_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ClientHandle {
    /// The returned receiver feeds the writer task; tests read it directly.
    pub fn new(sender_id: &str, backlog: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(backlog.max(1));

        (
            Self {
                conn_id: Uuid::now_v7(),
                sender_id: sender_id.to_owned(),
                outbound,
                open: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    pub fn spawn_writer(session: Session, rx: mpsc::Receiver<Outbound>) {
        actix_rt::spawn(write_loop(session, rx));
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Best-effort enqueue. A full backlog means the client stopped reading;
    /// the connection is closed rather than letting the queue grow.
    pub fn send(&self, frame: WireFrame) -> bool {
        if !self.is_open() {
            return false;
        }

        match self.outbound.try_send(Outbound::Frame(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[conn:{}] outbound backlog overflow for {}, closing",
                    self.conn_id, self.sender_id
                );
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.open.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Queues a close marker behind any pending frames so they drain first.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        if self.outbound.try_send(Outbound::Close).is_err() {
            let outbound = self.outbound.clone();
            actix_rt::spawn(async move {
                let _ = outbound.send(Outbound::Close).await;
            });
        }
    }
}

/// Only the explicit close marker closes the session: the session is a
/// clone of the live connection's, and a handle dropped without a marker
/// (a re-auth into another room) must leave that connection running.
async fn write_loop(mut session: Session, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Frame(frame) => {
                if session.text(frame.as_ref()).await.is_err() {
                    return;
                }
            }
            Outbound::Close => {
                let _ = session.close(None).await;
                return;
            }
        }
    }
}

/// Per-room fan-out task. Consumes the room's event stream in order,
/// serializes each event once and delivers it to every member except the
/// event's excluded origin. A failed send never aborts the fan-out. The
/// task ends itself after delivering `room_closed`, closing every member.
pub(crate) async fn run(room: Arc<RwLock<Room>>, mut events: mpsc::UnboundedReceiver<RoomEvent>) {
    while let Some(event) = events.recv().await {
        let (room_id, recipients) = {
            let guard = room.read().await;
            (guard.id.clone(), guard.member_handles())
        };

        let frame: WireFrame = protocol::event_frame(&room_id, &event).into();

        for handle in &recipients {
            if event
                .excluded_sender()
                .is_some_and(|excluded| excluded == handle.sender_id())
            {
                continue;
            }

            if !handle.send(Arc::clone(&frame)) {
                debug!(
                    "[{}] dropped frame for {}, connection closed",
                    room_id,
                    handle.sender_id()
                );
            }
        }

        if matches!(event, RoomEvent::RoomClosed) {
            for handle in &recipients {
                handle.close();
            }
            break;
        }
    }
}
