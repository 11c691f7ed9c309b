#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use marionette_domain::{ElevatedCapability, FriendCode};
use marionette_protocol::pb;
use marionette_protocol::version::PROTOCOL_VERSION_U32;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::server::accounts::AccountService;
use crate::server::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	/// Waiting for the target's `PossessionBeginAck`.
	Pending,
	/// The target accepted; relay samples both ways.
	Active,
}

#[derive(Debug, Clone)]
pub struct Session {
	pub id: Uuid,
	pub possessor: FriendCode,
	pub ghost: FriendCode,
	pub move_mode: i32,
	pub state: SessionState,
}

impl Session {
	fn counterpart(&self, member: &FriendCode) -> FriendCode {
		if self.possessor == *member {
			self.ghost.clone()
		} else {
			self.possessor.clone()
		}
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
	#[error("sender has no active session in the possessor role")]
	SessionMismatch,
}

enum ConfirmOutcome {
	Ack(pb::PossessionBeginAck),
	TargetDisconnected,
}

#[derive(Default)]
struct Inner {
	sessions: HashMap<Uuid, Session>,
	/// Either role; an identity appears here at most once.
	by_member: HashMap<FriendCode, Uuid>,
	waiters: HashMap<Uuid, oneshot::Sender<ConfirmOutcome>>,
}

/// All possession sessions on this server.
///
/// The inner lock is never held across an await; session creation,
/// confirmation and teardown each resolve under a single lock hold so
/// that the forced-teardown notification fires exactly once.
pub struct PossessionManager {
	inner: Mutex<Inner>,
	confirm_timeout: Duration,
}

impl PossessionManager {
	pub fn new(confirm_timeout: Duration) -> Self {
		Self {
			inner: Mutex::new(Inner::default()),
			confirm_timeout,
		}
	}

	/// Start a possession of `target` by `sender`: checks the grant,
	/// reserves both identities, relays the confirmation request and
	/// waits for the target's answer.
	pub async fn begin(
		&self,
		sender: &FriendCode,
		target: &FriendCode,
		move_mode: i32,
		accounts: &AccountService,
		registry: &ConnectionRegistry,
	) -> pb::PossessionBeginResponse {
		if sender == target {
			return failure(pb::ResponseCode::BadDataInRequest);
		}

		let grant = match accounts.resolve_grant(target, sender).await {
			Ok(grant) => grant,
			Err(e) => {
				warn!(sender = %sender, target = %target, error = %e, "grant lookup failed");
				return failure(pb::ResponseCode::Unknown);
			}
		};
		let Some(grant) = grant else {
			return failure(pb::ResponseCode::TargetNotFriends);
		};

		if !registry.is_online(target).await {
			return failure(pb::ResponseCode::TargetOffline);
		}

		if !grant.elevated.contains(ElevatedCapability::Possession) {
			return failure(pb::ResponseCode::TargetHasNotGrantedSenderPermissions);
		}

		let (session_id, rx) = {
			let mut inner = self.inner.lock().await;

			if inner.by_member.contains_key(sender) {
				return failure(pb::ResponseCode::SenderAlreadyInSession);
			}
			if inner.by_member.contains_key(target) {
				return failure(pb::ResponseCode::TargetAlreadyInSession);
			}

			let session_id = Uuid::new_v4();
			let (tx, rx) = oneshot::channel();

			inner.sessions.insert(
				session_id,
				Session {
					id: session_id,
					possessor: sender.clone(),
					ghost: target.clone(),
					move_mode,
					state: SessionState::Pending,
				},
			);
			inner.by_member.insert(sender.clone(), session_id);
			inner.by_member.insert(target.clone(), session_id);
			inner.waiters.insert(session_id, tx);

			(session_id, rx)
		};

		counter!("marionette_server_possession_begin_total").increment(1);

		let command = pb::PossessionBeginCommand {
			session_id: session_id.to_string(),
			possessor_friend_code: sender.to_string(),
			move_mode,
		};
		let envelope = pb::Envelope {
			version: PROTOCOL_VERSION_U32,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::PossessionBeginCommand(command)),
		};

		if !registry.send(target, envelope).await {
			self.remove_session(&session_id).await;
			return failure(pb::ResponseCode::TargetOffline);
		}

		let outcome = match tokio::time::timeout(self.confirm_timeout, rx).await {
			Ok(Ok(outcome)) => outcome,
			Ok(Err(_)) => {
				// Waiter dropped without firing; treat as teardown.
				self.remove_session(&session_id).await;
				return failure(pb::ResponseCode::Unknown);
			}
			Err(_) => {
				counter!("marionette_server_possession_timeout_total").increment(1);
				self.remove_session(&session_id).await;
				return failure(pb::ResponseCode::Timeout);
			}
		};

		match outcome {
			ConfirmOutcome::TargetDisconnected => failure(pb::ResponseCode::TargetOffline),
			ConfirmOutcome::Ack(ack) => {
				if ack.result == pb::BeginResult::Accepted as i32 {
					let mut inner = self.inner.lock().await;
					match inner.sessions.get_mut(&session_id) {
						Some(session) => {
							session.state = SessionState::Active;
							gauge!("marionette_server_possession_sessions_active").increment(1.0);
						}
						// Torn down while the ack was in flight.
						None => return failure(pb::ResponseCode::TargetOffline),
					}
				} else {
					self.remove_session(&session_id).await;
				}

				pb::PossessionBeginResponse {
					code: pb::ResponseCode::Success as i32,
					result: ack.result,
					target_name: ack.character_name,
					target_world: ack.home_world,
				}
			}
		}
	}

	/// Route the target's decision to the waiting `begin` call. Stale or
	/// mismatched acks are dropped.
	pub async fn confirm(&self, from: &FriendCode, ack: pb::PossessionBeginAck) {
		let mut inner = self.inner.lock().await;

		let Ok(session_id) = Uuid::parse_str(&ack.session_id) else {
			counter!("marionette_server_possession_stale_acks_total").increment(1);
			return;
		};

		let Some(session) = inner.sessions.get(&session_id) else {
			counter!("marionette_server_possession_stale_acks_total").increment(1);
			debug!(from = %from, session_id = %session_id, "dropping ack for unknown session");
			return;
		};

		if session.ghost != *from || session.state != SessionState::Pending {
			counter!("marionette_server_possession_stale_acks_total").increment(1);
			warn!(from = %from, session_id = %session_id, "dropping mismatched possession ack");
			return;
		}

		if let Some(tx) = inner.waiters.remove(&session_id) {
			let _ = tx.send(ConfirmOutcome::Ack(ack));
		}
	}

	/// Voluntary end by either member of an active session. The
	/// counterpart, if online, is told the session ended.
	pub async fn end(&self, sender: &FriendCode, registry: &ConnectionRegistry) -> pb::PossessionEndResponse {
		let removed = {
			let mut inner = self.inner.lock().await;

			let Some(&session_id) = inner.by_member.get(sender) else {
				return pb::PossessionEndResponse {
					code: pb::ResponseCode::SenderNotInSession as i32,
				};
			};

			// A pending session is resolved by ack or timeout, not end.
			let is_active = inner
				.sessions
				.get(&session_id)
				.map(|s| s.state == SessionState::Active)
				.unwrap_or(false);
			if !is_active {
				return pb::PossessionEndResponse {
					code: pb::ResponseCode::SenderNotInSession as i32,
				};
			}

			Self::remove_locked(&mut inner, &session_id)
		};

		if let Some(session) = removed {
			gauge!("marionette_server_possession_sessions_active").decrement(1.0);
			let counterpart = session.counterpart(sender);
			let ended = pb::PossessionEndedCommand {
				session_id: session.id.to_string(),
				reason: pb::SessionEndReason::Voluntary as i32,
				counterpart_friend_code: sender.to_string(),
			};
			let envelope = pb::Envelope {
				version: PROTOCOL_VERSION_U32,
				request_id: String::new(),
				msg: Some(pb::envelope::Msg::PossessionEndedCommand(ended)),
			};
			if !registry.send(&counterpart, envelope).await {
				debug!(counterpart = %counterpart, "counterpart offline; skipping session-ended notice");
			}
		}

		pb::PossessionEndResponse {
			code: pb::ResponseCode::Success as i32,
		}
	}

	/// Forward a movement sample from the possessor to the ghost.
	pub async fn relay_movement(
		&self,
		sender: &FriendCode,
		sample: pb::MovementSample,
		registry: &ConnectionRegistry,
	) -> Result<(), RelayError> {
		let (session_id, ghost) = self.active_session_as_possessor(sender).await?;

		let command = pb::MovementCommand {
			session_id: session_id.to_string(),
			sample: Some(sample),
		};
		let envelope = pb::Envelope {
			version: PROTOCOL_VERSION_U32,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::MovementCommand(command)),
		};

		if !registry.send(&ghost, envelope).await {
			counter!("marionette_server_relay_dropped_total").increment(1);
		}
		Ok(())
	}

	/// Forward a camera sample from the possessor to the ghost.
	pub async fn relay_camera(
		&self,
		sender: &FriendCode,
		sample: pb::CameraSample,
		registry: &ConnectionRegistry,
	) -> Result<(), RelayError> {
		let (session_id, ghost) = self.active_session_as_possessor(sender).await?;

		let command = pb::CameraCommand {
			session_id: session_id.to_string(),
			sample: Some(sample),
		};
		let envelope = pb::Envelope {
			version: PROTOCOL_VERSION_U32,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::CameraCommand(command)),
		};

		if !registry.send(&ghost, envelope).await {
			counter!("marionette_server_relay_dropped_total").increment(1);
		}
		Ok(())
	}

	/// Forced teardown when `identity` unregisters. Resolves a pending
	/// waiter for the possessor, and notifies the counterpart of an
	/// active session.
	pub async fn handle_disconnect(&self, identity: &FriendCode, registry: &ConnectionRegistry) {
		let removed = {
			let mut inner = self.inner.lock().await;

			let Some(&session_id) = inner.by_member.get(identity) else {
				return;
			};

			if let Some(tx) = inner.waiters.remove(&session_id) {
				let _ = tx.send(ConfirmOutcome::TargetDisconnected);
			}

			Self::remove_locked(&mut inner, &session_id)
		};

		let Some(session) = removed else { return };

		if session.state == SessionState::Active {
			gauge!("marionette_server_possession_sessions_active").decrement(1.0);

			let counterpart = session.counterpart(identity);
			let ended = pb::PossessionEndedCommand {
				session_id: session.id.to_string(),
				reason: pb::SessionEndReason::Disconnected as i32,
				counterpart_friend_code: identity.to_string(),
			};
			let envelope = pb::Envelope {
				version: PROTOCOL_VERSION_U32,
				request_id: String::new(),
				msg: Some(pb::envelope::Msg::PossessionEndedCommand(ended)),
			};
			if !registry.send(&counterpart, envelope).await {
				debug!(counterpart = %counterpart, "counterpart offline; skipping forced-teardown notice");
			}
		}
	}

	pub async fn active_count(&self) -> usize {
		self.inner
			.lock()
			.await
			.sessions
			.values()
			.filter(|s| s.state == SessionState::Active)
			.count()
	}

	#[cfg(test)]
	pub async fn session_for(&self, member: &FriendCode) -> Option<Session> {
		let inner = self.inner.lock().await;
		let id = inner.by_member.get(member)?;
		inner.sessions.get(id).cloned()
	}

	async fn active_session_as_possessor(&self, sender: &FriendCode) -> Result<(Uuid, FriendCode), RelayError> {
		let inner = self.inner.lock().await;

		let Some(&session_id) = inner.by_member.get(sender) else {
			return Err(RelayError::SessionMismatch);
		};
		let Some(session) = inner.sessions.get(&session_id) else {
			return Err(RelayError::SessionMismatch);
		};
		if session.state != SessionState::Active || session.possessor != *sender {
			return Err(RelayError::SessionMismatch);
		}

		Ok((session_id, session.ghost.clone()))
	}

	async fn remove_session(&self, session_id: &Uuid) {
		let mut inner = self.inner.lock().await;
		Self::remove_locked(&mut inner, session_id);
	}

	fn remove_locked(inner: &mut Inner, session_id: &Uuid) -> Option<Session> {
		let session = inner.sessions.remove(session_id)?;
		inner.by_member.remove(&session.possessor);
		inner.by_member.remove(&session.ghost);
		inner.waiters.remove(session_id);
		Some(session)
	}
}

fn failure(code: pb::ResponseCode) -> pb::PossessionBeginResponse {
	pb::PossessionBeginResponse {
		code: code as i32,
		result: pb::BeginResult::Uninitialized as i32,
		target_name: String::new(),
		target_world: String::new(),
	}
}
