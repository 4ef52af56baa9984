//! The session registry: the only writer to live sockets.
//!
//! One lock guards the session map, every session's subscription set and
//! the room index, so membership and room counts never disagree. The lock
//! is never held across an `.await`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::connection::{CLOSE_SUPERSEDED, Session, SessionState};
use super::protocol::ServerMessage;
use crate::metrics::{WS_PUSH_TOTAL, WS_SESSIONS_ACTIVE, WS_SESSIONS_SUPERSEDED_TOTAL};

struct Entry {
    session: Arc<Session>,
    notifications: bool,
    rooms: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Entry>,
    rooms: HashMap<String, HashSet<String>>,
}

impl Inner {
    /// Drop every room membership of `entry`, returning rooms left empty.
    fn release_rooms(&mut self, user_id: &str, rooms: &BTreeSet<String>) -> Vec<String> {
        let mut emptied = Vec::new();
        for room in rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                let _ = members.remove(user_id);
                if members.is_empty() {
                    let _ = self.rooms.remove(room);
                    emptied.push(room.clone());
                }
            }
        }
        emptied
    }

    fn entry_for(&mut self, session: &Session) -> Option<&mut Entry> {
        self.sessions
            .get_mut(&session.user_id)
            .filter(|e| e.session.id == session.id)
    }
}

/// Subscriptions a removed session held, for bridge teardown.
#[derive(Debug)]
pub struct Released {
    /// The removed session.
    pub session: Arc<Session>,
    /// Whether it held the notification stream.
    pub notifications: bool,
    /// Rooms with no local member left.
    pub emptied_rooms: Vec<String>,
}

/// Outcome of [`SessionRegistry::join_room`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Newly joined; `first_local` when no other local session was in the room.
    Joined {
        /// The room had no local member before.
        first_local: bool,
    },
    /// Already a member.
    AlreadyMember,
}

/// Outcome of [`SessionRegistry::leave_room`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Left; `room_empty` when no local member remains.
    Left {
        /// No local member remains.
        room_empty: bool,
    },
    /// Was not a member.
    NotMember,
}

/// Outcome of [`SessionRegistry::try_push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued on the session's writer.
    Delivered,
    /// No live session for the user.
    Offline,
    /// The session is live but its send queue is full.
    Full,
}

/// Point-in-time counters for `/health` and `/stats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Registered sessions.
    pub active: usize,
    /// Sessions holding the notification stream.
    pub notification_subscribers: usize,
    /// Local member count per room.
    pub rooms: BTreeMap<String, usize>,
}

/// Owns every live session and its subscriptions.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` as the user's only session and activate it.
    ///
    /// A previous session for the same user is closed with code 4000 before
    /// the new one activates, and returned with its subscriptions so the
    /// caller can tear them down.
    pub fn register(&self, session: Arc<Session>) -> Option<Released> {
        let user_id = session.user_id.clone();
        let (previous, count) = {
            let mut inner = self.inner.lock();
            let previous = inner.sessions.insert(
                user_id.clone(),
                Entry {
                    session: session.clone(),
                    notifications: false,
                    rooms: BTreeSet::new(),
                },
            );
            let released = previous.map(|old| {
                let emptied_rooms = inner.release_rooms(&user_id, &old.rooms);
                Released {
                    session: old.session,
                    notifications: old.notifications,
                    emptied_rooms,
                }
            });
            (released, inner.sessions.len())
        };
        if let Some(previous) = &previous {
            previous.session.close(CLOSE_SUPERSEDED, "superseded");
            counter!(WS_SESSIONS_SUPERSEDED_TOTAL).increment(1);
        }
        session.activate();
        #[allow(clippy::cast_precision_loss)]
        gauge!(WS_SESSIONS_ACTIVE).set(count as f64);
        debug!(user_id = %user_id, session_id = %session.id, superseded = previous.is_some(), "session registered");
        previous
    }

    /// Remove `session` if it is still the user's registered session.
    ///
    /// `None` when a newer session already replaced it.
    pub fn unregister(&self, session: &Session) -> Option<Released> {
        let (released, count) = {
            let mut inner = self.inner.lock();
            let _ = inner.entry_for(session)?;
            let entry = inner.sessions.remove(&session.user_id)?;
            let emptied_rooms = inner.release_rooms(&session.user_id, &entry.rooms);
            let released = Released {
                session: entry.session,
                notifications: entry.notifications,
                emptied_rooms,
            };
            (released, inner.sessions.len())
        };
        #[allow(clippy::cast_precision_loss)]
        gauge!(WS_SESSIONS_ACTIVE).set(count as f64);
        Some(released)
    }

    /// The user's live session.
    pub fn get(&self, user_id: &str) -> Option<Arc<Session>> {
        self.inner
            .lock()
            .sessions
            .get(user_id)
            .map(|e| e.session.clone())
    }

    /// Whether a session is registered for the user.
    pub fn contains(&self, user_id: &str) -> bool {
        self.inner.lock().sessions.contains_key(user_id)
    }

    /// Whether `session` is the user's registered session.
    pub fn is_current(&self, session: &Session) -> bool {
        self.inner.lock().entry_for(session).is_some()
    }

    /// Registered session count.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send to the user's session. `false` when offline or the queue is full.
    pub fn push(&self, user_id: &str, message: &ServerMessage) -> bool {
        self.try_push(user_id, message) == PushOutcome::Delivered
    }

    /// Send to the user's session, telling a missing or closed session
    /// apart from a full send queue.
    pub fn try_push(&self, user_id: &str, message: &ServerMessage) -> PushOutcome {
        let outcome = match self.get(user_id) {
            None => PushOutcome::Offline,
            Some(session) if session.send(message) => PushOutcome::Delivered,
            Some(session) if session.state() == SessionState::Closed => PushOutcome::Offline,
            Some(_) => PushOutcome::Full,
        };
        let delivered = outcome == PushOutcome::Delivered;
        counter!(WS_PUSH_TOTAL, "delivered" => if delivered { "true" } else { "false" }).increment(1);
        outcome
    }

    /// Set the notification flag. Returns the previous value, or `None`
    /// when `session` is no longer registered.
    pub fn set_notifications(&self, session: &Session, active: bool) -> Option<bool> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_for(session)?;
        Some(std::mem::replace(&mut entry.notifications, active))
    }

    /// Whether the user's session holds the notification stream.
    pub fn notifications_active(&self, user_id: &str) -> bool {
        self.inner
            .lock()
            .sessions
            .get(user_id)
            .is_some_and(|e| e.notifications)
    }

    /// Add `session` to a room. `None` when the session is no longer registered.
    pub fn join_room(&self, session: &Session, room_id: &str) -> Option<JoinOutcome> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_for(session)?;
        if !entry.rooms.insert(room_id.to_owned()) {
            return Some(JoinOutcome::AlreadyMember);
        }
        let members = inner.rooms.entry(room_id.to_owned()).or_default();
        let first_local = members.is_empty();
        let _ = members.insert(session.user_id.clone());
        Some(JoinOutcome::Joined { first_local })
    }

    /// Remove `session` from a room.
    pub fn leave_room(&self, session: &Session, room_id: &str) -> LeaveOutcome {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entry_for(session) else {
            return LeaveOutcome::NotMember;
        };
        if !entry.rooms.remove(room_id) {
            return LeaveOutcome::NotMember;
        }
        let room = BTreeSet::from([room_id.to_owned()]);
        let room_empty = !inner.release_rooms(&session.user_id, &room).is_empty();
        LeaveOutcome::Left { room_empty }
    }

    /// Whether the user's session is in the room.
    pub fn is_member(&self, user_id: &str, room_id: &str) -> bool {
        self.inner
            .lock()
            .rooms
            .get(room_id)
            .is_some_and(|m| m.contains(user_id))
    }

    /// Whether any local session is in the room.
    pub fn has_room(&self, room_id: &str) -> bool {
        self.inner.lock().rooms.contains_key(room_id)
    }

    /// Local sessions in a room.
    pub fn room_members(&self, room_id: &str) -> Vec<Arc<Session>> {
        let inner = self.inner.lock();
        inner
            .rooms
            .get(room_id)
            .into_iter()
            .flatten()
            .filter_map(|user| inner.sessions.get(user).map(|e| e.session.clone()))
            .collect()
    }

    /// Send to every local member of a room, optionally skipping one user.
    /// Returns how many sessions accepted the frame.
    pub fn broadcast_room(&self, room_id: &str, message: &ServerMessage, except: Option<&str>) -> usize {
        let members = self.room_members(room_id);
        if members.is_empty() {
            return 0;
        }
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(room_id, error = %err, "failed to encode room message");
                return 0;
            }
        };
        members
            .iter()
            .filter(|s| except != Some(s.user_id.as_str()))
            .filter(|s| s.send_raw(frame.clone()))
            .count()
    }

    /// Snapshot for health reporting.
    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock();
        RegistryStats {
            active: inner.sessions.len(),
            notification_subscribers: inner.sessions.values().filter(|e| e.notifications).count(),
            rooms: inner
                .rooms
                .iter()
                .map(|(room, members)| (room.clone(), members.len()))
                .collect(),
        }
    }

    /// Close every session with the same code and reason.
    pub fn close_all(&self, code: u16, reason: &str) {
        let sessions: Vec<_> = self
            .inner
            .lock()
            .sessions
            .values()
            .map(|e| e.session.clone())
            .collect();
        for session in sessions {
            session.close(code, reason);
        }
    }
}
