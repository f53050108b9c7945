//! Per-connection session state and frame dispatch.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::Identity;
use crate::error::{CloseReason, ErrorCode, StoreError};

use super::events::{decode, ClientFrame, HistoryCursor, MessageView, ServerFrame};
use super::mentions;
use super::registry::ConnectionHandle;
use super::{Hub, DEFAULT_ROOM};

/// One live connection's view of itself.
pub struct Session {
    pub conn_id: String,
    pub user_id: String,
    pub display_name: String,
    pub room_id: String,
    handle: ConnectionHandle,
}

impl Session {
    /// Admit an authenticated connection: attach (superseding any prior
    /// connection for the user), auto-join the default room, emit the hello
    /// snapshot and initial history, and announce presence.
    pub async fn establish(
        hub: &Hub,
        identity: Identity,
        handle: ConnectionHandle,
    ) -> Result<Session, StoreError> {
        let session = Session {
            conn_id: handle.conn_id.clone(),
            user_id: identity.user_id,
            display_name: identity.display_name,
            room_id: DEFAULT_ROOM.to_string(),
            handle,
        };

        let superseded = match hub.registry.attach(
            &session.user_id,
            &session.display_name,
            session.handle.clone(),
        ) {
            Some(prior) => {
                tracing::info!(
                    user_id = %session.user_id,
                    old_conn_id = %prior.conn_id,
                    new_conn_id = %session.conn_id,
                    "connection superseded"
                );
                prior.send_frame(&ServerFrame::error(ErrorCode::Unauth, "superseded").to_json());
                prior.close(CloseReason::Superseded);
                true
            }
            None => false,
        };

        // Join and the snapshot read happen under the publish lock: no
        // append can land between them, so a message is observed either in
        // the history page or as a live frame, never both.
        let joined;
        {
            let _publish = hub.publish.lock().await;
            joined = hub
                .registry
                .join(&session.user_id, DEFAULT_ROOM)
                .expect("freshly attached user is in the registry");

            session.send(&ServerFrame::Hello {
                self_id: session.user_id.clone(),
                room_id: DEFAULT_ROOM.to_string(),
                members: joined.members.clone(),
            });

            let limit = hub.config.initial_history_limit;
            match hub.history.recent(DEFAULT_ROOM, limit).await {
                Ok(messages) => {
                    session.send(&history_frame(DEFAULT_ROOM, messages, Cursor::Recent));
                }
                Err(err) => {
                    hub.registry.detach(&session.user_id, &session.conn_id);
                    return Err(err);
                }
            }
        }

        // The vacated room (a superseded connection may have been elsewhere)
        // and the default room both get fresh snapshots. Self is excluded
        // from the latter — the hello already carried it.
        if let Some((left_room, left_members)) = joined.left {
            broadcast_presence(hub, &left_room, left_members, None);
        }
        if joined.changed || superseded {
            let members = hub.registry.members(DEFAULT_ROOM);
            broadcast_presence(hub, DEFAULT_ROOM, members, Some(&session.user_id));
        }

        Ok(session)
    }

    /// Decode and dispatch one inbound frame. Never tears the connection
    /// down: failures surface to the sender as `error` frames.
    pub async fn handle_frame(&mut self, hub: &Arc<Hub>, raw: &str) {
        let frame = match decode(raw, hub.frame_limits()) {
            Ok(frame) => frame,
            Err(rejection) => {
                self.send(&ServerFrame::error(ErrorCode::BadRequest, rejection.msg));
                return;
            }
        };

        match frame {
            ClientFrame::Join {
                room_id,
                since_ts,
                before_id,
            } => self.handle_join(hub, room_id, since_ts, before_id).await,
            ClientFrame::Message { room_id, text } => {
                self.handle_message(hub, room_id, text).await
            }
            ClientFrame::SetName { display_name } => self.handle_set_name(hub, display_name),
            ClientFrame::TypingStart { room_id } => self.handle_typing_start(hub, room_id),
            ClientFrame::TypingStop { room_id } => self.handle_typing_stop(hub, room_id),
        }
    }

    async fn handle_join(
        &mut self,
        hub: &Arc<Hub>,
        room_id: String,
        since_ts: Option<i64>,
        before_id: Option<String>,
    ) {
        // Same publish-lock discipline as at connect time: membership and
        // the history read form one atomic step relative to appends.
        let joined;
        {
            let _publish = hub.publish.lock().await;
            let Some(outcome) = hub.registry.join(&self.user_id, &room_id) else {
                self.send(&ServerFrame::error(ErrorCode::ServerError, "not attached"));
                return;
            };
            joined = outcome;
            self.room_id = room_id.clone();

            let limit = hub.config.initial_history_limit;
            let page = match (since_ts, &before_id) {
                (Some(ts), None) => hub
                    .history
                    .since(&room_id, ts)
                    .await
                    .map(|messages| history_frame(&room_id, messages, Cursor::Since)),
                (None, Some(id)) => hub
                    .history
                    .before(&room_id, id, limit)
                    .await
                    .map(|messages| history_frame(&room_id, messages, Cursor::Before { limit })),
                _ => hub
                    .history
                    .recent(&room_id, limit)
                    .await
                    .map(|messages| history_frame(&room_id, messages, Cursor::Recent)),
            };
            match page {
                Ok(frame) => self.send(&frame),
                Err(err) => {
                    tracing::error!(error = %err, room_id, "history load failed");
                    self.send(&ServerFrame::error(
                        ErrorCode::ServerError,
                        "history unavailable",
                    ));
                }
            }
        }

        if joined.changed {
            if let Some((left_room, left_members)) = joined.left {
                if joined.was_typing_in_left {
                    let stop = ServerFrame::UserTypingStop {
                        room_id: left_room.clone(),
                        user_id: self.user_id.clone(),
                    };
                    hub.registry.broadcast(&left_room, &stop.to_json(), None);
                }
                broadcast_presence(hub, &left_room, left_members, None);
            }
            // The joiner has no roster for the new room yet, so no exclusion.
            broadcast_presence(hub, &room_id, joined.members, None);
        }
    }

    async fn handle_message(&mut self, hub: &Arc<Hub>, room_id: String, text: String) {
        if room_id != self.room_id {
            self.send(&ServerFrame::error(
                ErrorCode::BadRequest,
                "not joined to that room",
            ));
            return;
        }

        if !hub.admission.try_admit(&self.user_id, Instant::now()) {
            self.send(&ServerFrame::error(ErrorCode::RateLimit, "slow down"));
            return;
        }

        let members = hub.registry.members(&room_id);
        let mentions = mentions::resolve(&text, &members);
        let mentions = (!mentions.is_empty()).then_some(mentions);

        // Append and fan out under the publish lock: every recipient
        // observes messages in persistence order.
        let _publish = hub.publish.lock().await;
        match hub
            .history
            .append(&room_id, &self.user_id, &self.display_name, &text, mentions)
            .await
        {
            Ok(message) => {
                // The sender is included: the authoritative id/ts echo
                // reaches them on the canonical path.
                hub.registry
                    .broadcast(&room_id, &ServerFrame::message(&message).to_json(), None);
            }
            Err(err) => {
                tracing::error!(error = %err, room_id, user_id = %self.user_id, "append failed");
                self.send(&ServerFrame::error(
                    ErrorCode::ServerError,
                    "message not delivered",
                ));
            }
        }
    }

    fn handle_set_name(&mut self, hub: &Arc<Hub>, display_name: String) {
        self.display_name = display_name.clone();
        if let Some(renamed) = hub.registry.set_name(&self.user_id, &display_name) {
            if let Some((room_id, members)) = renamed.room {
                broadcast_presence(hub, &room_id, members, None);
            }
        }
    }

    fn handle_typing_start(&self, hub: &Arc<Hub>, room_id: String) {
        if room_id != self.room_id {
            self.send(&ServerFrame::error(
                ErrorCode::BadRequest,
                "not joined to that room",
            ));
            return;
        }

        let generation = hub.registry.mark_typing(&self.user_id, &room_id);
        let frame = ServerFrame::UserTyping {
            room_id: room_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        };
        hub.registry
            .broadcast(&room_id, &frame.to_json(), Some(&self.user_id));

        // Arm the idle expiry. A refresh bumps the generation, turning this
        // timer into a no-op.
        let hub = hub.clone();
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(hub.config.typing_idle_timeout).await;
            if hub.registry.expire_typing(&user_id, &room_id, generation) {
                let stop = ServerFrame::UserTypingStop {
                    room_id: room_id.clone(),
                    user_id: user_id.clone(),
                };
                hub.registry
                    .broadcast(&room_id, &stop.to_json(), Some(&user_id));
            }
        });
    }

    fn handle_typing_stop(&self, hub: &Arc<Hub>, room_id: String) {
        if room_id != self.room_id {
            self.send(&ServerFrame::error(
                ErrorCode::BadRequest,
                "not joined to that room",
            ));
            return;
        }

        if hub.registry.clear_typing(&self.user_id, &room_id) {
            let stop = ServerFrame::UserTypingStop {
                room_id: room_id.clone(),
                user_id: self.user_id.clone(),
            };
            hub.registry
                .broadcast(&room_id, &stop.to_json(), Some(&self.user_id));
        }
    }

    /// Deregister and announce departure. Safe to call after supersession:
    /// the registry ignores a stale conn_id.
    pub fn close_cleanup(&self, hub: &Hub) {
        let Some(outcome) = hub.registry.detach(&self.user_id, &self.conn_id) else {
            return;
        };
        if let Some((room_id, members)) = outcome.room {
            if outcome.was_typing {
                let stop = ServerFrame::UserTypingStop {
                    room_id: room_id.clone(),
                    user_id: self.user_id.clone(),
                };
                hub.registry.broadcast(&room_id, &stop.to_json(), None);
            }
            broadcast_presence(hub, &room_id, members, None);
        }
    }

    pub fn send(&self, frame: &ServerFrame) {
        if !self.handle.send_frame(&frame.to_json()) {
            self.handle.close(CloseReason::Backpressure);
        }
    }
}

fn broadcast_presence(
    hub: &Hub,
    room_id: &str,
    members: Vec<super::events::MemberView>,
    except: Option<&str>,
) {
    let frame = ServerFrame::Presence {
        room_id: room_id.to_string(),
        members,
    };
    hub.registry.broadcast(room_id, &frame.to_json(), except);
}

/// Which cursor rule applies to a history response.
enum Cursor {
    Recent,
    Since,
    Before { limit: u32 },
}

fn history_frame(
    room_id: &str,
    messages: Vec<crate::history::Message>,
    cursor: Cursor,
) -> ServerFrame {
    let next_cursor = match cursor {
        // Initial load and forward resume page backward by timestamp from
        // the oldest row returned.
        Cursor::Recent | Cursor::Since => messages.first().map(|oldest| HistoryCursor {
            before_id: None,
            before_ts: Some(oldest.ts),
        }),
        // Backward pagination continues by id, but only while pages come
        // back full.
        Cursor::Before { limit } => {
            (messages.len() as u32 == limit && limit > 0).then(|| HistoryCursor {
                before_id: messages.first().map(|oldest| oldest.id.clone()),
                before_ts: None,
            })
        }
    };

    ServerFrame::History {
        room_id: room_id.to_string(),
        messages: messages.iter().map(MessageView::from).collect(),
        next_cursor,
    }
}
