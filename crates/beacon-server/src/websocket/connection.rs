//! Per-socket session state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use beacon_core::SessionId;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::protocol::{ServerMessage, ServiceType};
use crate::metrics::WS_SEND_DROPS_TOTAL;

/// Close code sent to a session replaced by a newer one for the same user.
pub const CLOSE_SUPERSEDED: u16 = 4000;
/// Close code sent when the client stops answering pings.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4001;
/// Close code sent on server shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Lifecycle of a session. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, not yet registered.
    Connecting,
    /// Registered and receiving pushes.
    Active,
    /// Closing or closed.
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

/// Close frame the writer should send on its way out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

/// One live WebSocket session.
///
/// Writes go through a bounded queue drained by the socket's writer task;
/// a full queue drops the message instead of blocking the caller.
pub struct Session {
    /// Connection id, unique per socket.
    pub id: SessionId,
    /// Owning user.
    pub user_id: String,
    /// Surface chosen at connect time.
    pub service_type: ServiceType,
    tx: mpsc::Sender<Arc<String>>,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
    state: AtomicU8,
    dropped: AtomicU64,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl Session {
    /// Build a session in `Connecting` state.
    ///
    /// `cancel` ends the session's tasks; pass a child of the server token
    /// so shutdown reaches every socket.
    pub fn new(
        user_id: impl Into<String>,
        service_type: ServiceType,
        tx: mpsc::Sender<Arc<String>>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            user_id: user_id.into(),
            service_type,
            tx,
            connected_at: now,
            last_seen: Mutex::new(now),
            state: AtomicU8::new(0),
            dropped: AtomicU64::new(0),
            close_reason: Mutex::new(None),
            cancel,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `Connecting → Active`. No effect once closed.
    pub fn activate(&self) {
        let _ = self
            .state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Queue an already-encoded frame. `false` when the queue is full or
    /// the writer is gone.
    pub fn send_raw(&self, frame: Arc<String>) -> bool {
        if self.state() == SessionState::Closed {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!(WS_SEND_DROPS_TOTAL).increment(1);
            false
        }
    }

    /// Encode and queue a frame.
    pub fn send(&self, message: &ServerMessage) -> bool {
        match message.encode() {
            Ok(frame) => self.send_raw(frame),
            Err(err) => {
                tracing::error!(user_id = %self.user_id, error = %err, "failed to encode server message");
                false
            }
        }
    }

    /// Messages dropped on a full queue.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn silent_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Session age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Close with a code and reason. The first reason wins.
    pub fn close(&self, code: u16, reason: &str) {
        self.state.store(2, Ordering::Release);
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(CloseReason {
                    code,
                    reason: reason.to_owned(),
                });
            }
        }
        self.cancel.cancel();
    }

    /// The recorded close reason, or going-away when the session ended
    /// through the shared shutdown token.
    pub fn close_reason(&self) -> CloseReason {
        self.close_reason.lock().clone().unwrap_or(CloseReason {
            code: CLOSE_GOING_AWAY,
            reason: "server shutting down".into(),
        })
    }

    /// Whether the session was told to end.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The session's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("service_type", &self.service_type)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn session(user: &str, capacity: usize) -> (Arc<Session>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let s = Session::new(user, ServiceType::Notifications, tx, CancellationToken::new());
        (Arc::new(s), rx)
    }

    #[test]
    fn lifecycle() {
        let (s, _rx) = session("u1", 4);
        assert_eq!(s.state(), SessionState::Connecting);
        s.activate();
        assert_eq!(s.state(), SessionState::Active);
        s.close(CLOSE_SUPERSEDED, "superseded");
        assert_eq!(s.state(), SessionState::Closed);
        s.activate();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.is_closed());
    }

    #[tokio::test]
    async fn send_encodes_once() {
        let (s, mut rx) = session("u1", 4);
        assert!(s.send(&ServerMessage::pong()));
        let frame = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "pong");
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (s, _rx) = session("u1", 1);
        assert!(s.send(&ServerMessage::pong()));
        assert!(!s.send(&ServerMessage::pong()));
        assert!(!s.send(&ServerMessage::pong()));
        assert_eq!(s.drop_count(), 2);
    }

    #[test]
    fn closed_writer_refuses() {
        let (s, rx) = session("u1", 4);
        drop(rx);
        assert!(!s.send(&ServerMessage::pong()));
    }

    #[test]
    fn closed_session_refuses_without_counting() {
        let (s, _rx) = session("u1", 4);
        s.close(CLOSE_GOING_AWAY, "bye");
        assert!(!s.send(&ServerMessage::pong()));
        assert_eq!(s.drop_count(), 0);
    }

    #[test]
    fn first_close_reason_wins() {
        let (s, _rx) = session("u1", 4);
        s.close(CLOSE_SUPERSEDED, "superseded");
        s.close(CLOSE_GOING_AWAY, "later");
        assert_eq!(
            s.close_reason(),
            CloseReason {
                code: CLOSE_SUPERSEDED,
                reason: "superseded".into()
            }
        );
    }

    #[test]
    fn external_cancel_reads_as_going_away() {
        let parent = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);
        let s = Session::new("u1", ServiceType::Gig, tx, parent.child_token());
        parent.cancel();
        assert!(s.is_closed());
        assert_eq!(s.close_reason().code, CLOSE_GOING_AWAY);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_tracking() {
        let (s, _rx) = session("u1", 4);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(s.silent_for() >= Duration::from_secs(5));
        s.mark_alive();
        assert!(s.silent_for() < Duration::from_secs(1));
    }
}
