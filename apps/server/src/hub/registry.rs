//! Live roster, room membership, and typing soft-state.
//!
//! One mutex serializes membership mutations and snapshot reads; critical
//! sections only build snapshots and collect sinks. Actual sends happen
//! outside the lock through each connection's bounded outbound queue, so a
//! slow recipient can never stall the registry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::CloseReason;

use super::events::MemberView;

/// High-water mark for a connection's outbound frame queue. Overflow forces
/// the connection to close with a policy code.
pub const OUTBOUND_QUEUE_FRAMES: usize = 256;

/// Sending side of one connection's outbound queue, plus its kill switch.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: String,
    pub user_id: String,
    frames: mpsc::Sender<String>,
    control: mpsc::Sender<CloseReason>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving ends its connection task owns.
    pub fn channel(
        conn_id: String,
        user_id: String,
        queue_frames: usize,
    ) -> (Self, mpsc::Receiver<String>, mpsc::Receiver<CloseReason>) {
        let (frames_tx, frames_rx) = mpsc::channel(queue_frames);
        let (control_tx, control_rx) = mpsc::channel(1);
        (
            Self {
                conn_id,
                user_id,
                frames: frames_tx,
                control: control_tx,
            },
            frames_rx,
            control_rx,
        )
    }

    /// Enqueue a frame without blocking. `false` means the queue is full or
    /// the connection is gone; the caller schedules teardown.
    pub fn send_frame(&self, json: &str) -> bool {
        self.frames.try_send(json.to_string()).is_ok()
    }

    /// Schedule the owning connection for teardown. Idempotent.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.control.try_send(reason);
    }
}

struct UserEntry {
    display_name: String,
    room_id: Option<String>,
    handle: ConnectionHandle,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserEntry>,
    rooms: HashMap<String, HashSet<String>>,
    /// `(room_id, user_id) → generation` of the latest typing mark.
    typing: HashMap<(String, String), u64>,
}

/// Result of removing a connection from the roster.
pub struct DetachOutcome {
    /// Room the user vacated, with its post-leave snapshot.
    pub room: Option<(String, Vec<MemberView>)>,
    pub was_typing: bool,
}

/// Result of registering room membership.
pub struct JoinOutcome {
    /// Post-join snapshot of the joined room.
    pub members: Vec<MemberView>,
    /// Whether the member set actually changed.
    pub changed: bool,
    /// Previous room vacated by this join, with its post-leave snapshot.
    pub left: Option<(String, Vec<MemberView>)>,
    pub was_typing_in_left: bool,
}

/// Result of a display-name change.
pub struct RenameOutcome {
    /// Room whose presence snapshot must be re-emitted.
    pub room: Option<(String, Vec<MemberView>)>,
}

pub struct PresenceRegistry {
    inner: Mutex<Inner>,
    typing_generation: AtomicU64,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            typing_generation: AtomicU64::new(0),
        }
    }

    /// Register (or replace) the user's connection. Returns the prior handle
    /// if one existed, so the caller can close it as superseded. Room
    /// membership carries over to the new connection.
    pub fn attach(
        &self,
        user_id: &str,
        display_name: &str,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut inner = self.inner.lock();
        match inner.users.get_mut(user_id) {
            Some(entry) => {
                let prior = std::mem::replace(&mut entry.handle, handle);
                entry.display_name = display_name.to_string();
                Some(prior)
            }
            None => {
                inner.users.insert(
                    user_id.to_string(),
                    UserEntry {
                        display_name: display_name.to_string(),
                        room_id: None,
                        handle,
                    },
                );
                None
            }
        }
    }

    /// Remove the user's connection, but only if `conn_id` is still the
    /// current one — a superseded connection's late detach is a no-op.
    pub fn detach(&self, user_id: &str, conn_id: &str) -> Option<DetachOutcome> {
        let mut inner = self.inner.lock();
        if inner.users.get(user_id)?.handle.conn_id != conn_id {
            return None;
        }
        let entry = inner.users.remove(user_id)?;

        let mut was_typing = false;
        let room = entry.room_id.map(|room_id| {
            remove_member(&mut inner, &room_id, user_id);
            was_typing = inner
                .typing
                .remove(&(room_id.clone(), user_id.to_string()))
                .is_some();
            let members = snapshot(&inner, &room_id);
            (room_id, members)
        });

        Some(DetachOutcome { room, was_typing })
    }

    /// Register membership in `room_id`, vacating the previous room if the
    /// connection was elsewhere. Ensures the room record exists.
    pub fn join(&self, user_id: &str, room_id: &str) -> Option<JoinOutcome> {
        let mut inner = self.inner.lock();
        let current = inner.users.get(user_id)?.room_id.clone();

        if current.as_deref() == Some(room_id) {
            return Some(JoinOutcome {
                members: snapshot(&inner, room_id),
                changed: false,
                left: None,
                was_typing_in_left: false,
            });
        }

        let mut was_typing_in_left = false;
        let left = current.map(|old_room| {
            remove_member(&mut inner, &old_room, user_id);
            was_typing_in_left = inner
                .typing
                .remove(&(old_room.clone(), user_id.to_string()))
                .is_some();
            let members = snapshot(&inner, &old_room);
            (old_room, members)
        });

        inner
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        if let Some(entry) = inner.users.get_mut(user_id) {
            entry.room_id = Some(room_id.to_string());
        }

        Some(JoinOutcome {
            members: snapshot(&inner, room_id),
            changed: true,
            left,
            was_typing_in_left,
        })
    }

    /// Update the user's display name. Validation happened at the codec.
    pub fn set_name(&self, user_id: &str, new_name: &str) -> Option<RenameOutcome> {
        let mut inner = self.inner.lock();
        let entry = inner.users.get_mut(user_id)?;
        entry.display_name = new_name.to_string();
        let room_id = entry.room_id.clone();
        let room = room_id.map(|room_id| {
            let members = snapshot(&inner, &room_id);
            (room_id, members)
        });
        Some(RenameOutcome { room })
    }

    /// Current member snapshot of a room, ordered by user id.
    pub fn members(&self, room_id: &str) -> Vec<MemberView> {
        snapshot(&self.inner.lock(), room_id)
    }

    /// Insert or refresh a typing mark. Returns the mark's generation; an
    /// expiry only fires if its generation is still current.
    pub fn mark_typing(&self, user_id: &str, room_id: &str) -> u64 {
        let generation = self.typing_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .lock()
            .typing
            .insert((room_id.to_string(), user_id.to_string()), generation);
        generation
    }

    /// Remove a typing mark. Returns whether one was present.
    pub fn clear_typing(&self, user_id: &str, room_id: &str) -> bool {
        self.inner
            .lock()
            .typing
            .remove(&(room_id.to_string(), user_id.to_string()))
            .is_some()
    }

    /// Remove a typing mark only if it still carries `generation` — a
    /// refresh bumps the generation and disarms older expiry timers.
    pub fn expire_typing(&self, user_id: &str, room_id: &str, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        let key = (room_id.to_string(), user_id.to_string());
        if inner.typing.get(&key) == Some(&generation) {
            inner.typing.remove(&key);
            true
        } else {
            false
        }
    }

    /// Deliver a frame to every member of the room except `except`.
    ///
    /// Sinks are collected under the lock but written outside it. A sink
    /// that refuses the frame (queue full or connection gone) gets its
    /// connection scheduled for teardown; other recipients are unaffected.
    pub fn broadcast(&self, room_id: &str, frame_json: &str, except: Option<&str>) {
        let handles: Vec<ConnectionHandle> = {
            let inner = self.inner.lock();
            let Some(members) = inner.rooms.get(room_id) else {
                return;
            };
            members
                .iter()
                .filter(|uid| except != Some(uid.as_str()))
                .filter_map(|uid| inner.users.get(uid).map(|e| e.handle.clone()))
                .collect()
        };

        for handle in handles {
            if !handle.send_frame(frame_json) {
                tracing::warn!(
                    user_id = %handle.user_id,
                    conn_id = %handle.conn_id,
                    room_id,
                    "outbound queue refused frame, scheduling teardown"
                );
                handle.close(CloseReason::Backpressure);
            }
        }
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_member(inner: &mut Inner, room_id: &str, user_id: &str) {
    if let Some(members) = inner.rooms.get_mut(room_id) {
        members.remove(user_id);
        // Room records exist only while they have members.
        if members.is_empty() {
            inner.rooms.remove(room_id);
        }
    }
}

fn snapshot(inner: &Inner, room_id: &str) -> Vec<MemberView> {
    let Some(members) = inner.rooms.get(room_id) else {
        return Vec::new();
    };
    let mut view: Vec<MemberView> = members
        .iter()
        .filter_map(|uid| {
            inner.users.get(uid).map(|entry| MemberView {
                user_id: uid.clone(),
                display_name: entry.display_name.clone(),
            })
        })
        .collect();
    view.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    view
}
