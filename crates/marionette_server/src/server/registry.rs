#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use marionette_domain::FriendCode;
use marionette_protocol::pb;
use marionette_util::time::unix_ms_now;
use metrics::counter;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
	#[error("an online connection is already registered for this identity")]
	AlreadyRegistered,
}

struct ConnectionEntry {
	online: bool,
	/// Sender half of the command stream queue. `None` while offline.
	handle: Option<mpsc::Sender<pb::Envelope>>,
	last_seen_unix_ms: i64,
}

/// All identities the server has seen since startup, keyed by friend code.
///
/// Entries survive disconnects with `online = false` so that presence
/// lookups and `last_seen` stay cheap; the per-entry mutex serializes
/// register/unregister races for the same identity.
#[derive(Default)]
pub struct ConnectionRegistry {
	entries: RwLock<HashMap<FriendCode, Arc<Mutex<ConnectionEntry>>>>,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	async fn entry(&self, identity: &FriendCode) -> Option<Arc<Mutex<ConnectionEntry>>> {
		self.entries.read().await.get(identity).cloned()
	}

	async fn entry_or_insert(&self, identity: &FriendCode) -> Arc<Mutex<ConnectionEntry>> {
		if let Some(entry) = self.entry(identity).await {
			return entry;
		}

		let mut entries = self.entries.write().await;
		entries
			.entry(identity.clone())
			.or_insert_with(|| {
				Arc::new(Mutex::new(ConnectionEntry {
					online: false,
					handle: None,
					last_seen_unix_ms: unix_ms_now(),
				}))
			})
			.clone()
	}

	/// Bind `identity` to a live command queue. Fails while a previous
	/// connection for the same identity is still registered.
	pub async fn register(&self, identity: &FriendCode, handle: mpsc::Sender<pb::Envelope>) -> Result<(), RegisterError> {
		let entry = self.entry_or_insert(identity).await;
		let mut entry = entry.lock().await;

		if entry.online {
			return Err(RegisterError::AlreadyRegistered);
		}

		entry.online = true;
		entry.handle = Some(handle);
		entry.last_seen_unix_ms = unix_ms_now();
		Ok(())
	}

	/// Mark `identity` offline and drop its command queue. Idempotent;
	/// returns whether the identity was online.
	pub async fn unregister(&self, identity: &FriendCode) -> bool {
		let Some(entry) = self.entry(identity).await else {
			return false;
		};
		let mut entry = entry.lock().await;

		let was_online = entry.online;
		entry.online = false;
		entry.handle = None;
		entry.last_seen_unix_ms = unix_ms_now();
		was_online
	}

	pub async fn is_online(&self, identity: &FriendCode) -> bool {
		match self.entry(identity).await {
			Some(entry) => entry.lock().await.online,
			None => false,
		}
	}

	pub async fn touch(&self, identity: &FriendCode) {
		if let Some(entry) = self.entry(identity).await {
			entry.lock().await.last_seen_unix_ms = unix_ms_now();
		}
	}

	#[cfg(test)]
	pub async fn last_seen_unix_ms(&self, identity: &FriendCode) -> Option<i64> {
		match self.entry(identity).await {
			Some(entry) => Some(entry.lock().await.last_seen_unix_ms),
			None => None,
		}
	}

	/// Enqueue an envelope on `identity`'s command stream without blocking.
	/// Returns false when the identity is offline or its queue is full;
	/// a full queue counts toward `marionette_server_command_queue_full_total`.
	pub async fn send(&self, identity: &FriendCode, envelope: pb::Envelope) -> bool {
		let Some(entry) = self.entry(identity).await else {
			return false;
		};
		let entry = entry.lock().await;

		let Some(handle) = entry.handle.as_ref() else {
			return false;
		};

		match handle.try_send(envelope) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(_)) => {
				counter!("marionette_server_command_queue_full_total").increment(1);
				false
			}
			Err(mpsc::error::TrySendError::Closed(_)) => false,
		}
	}

	pub async fn online_count(&self) -> usize {
		let entries = self.entries.read().await.values().cloned().collect::<Vec<_>>();
		let mut online = 0usize;
		for entry in entries {
			if entry.lock().await.online {
				online += 1;
			}
		}
		online
	}
}
