#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use marionette_domain::{ElevatedCapability, FriendCode, UserPermissions};
use marionette_protocol::pb;
use tokio::sync::mpsc;

use crate::server::accounts::AccountService;
use crate::server::possession::{PossessionManager, RelayError, SessionState};
use crate::server::registry::ConnectionRegistry;

fn code(s: &str) -> FriendCode {
	s.parse().expect("friend code")
}

struct Harness {
	manager: Arc<PossessionManager>,
	accounts: AccountService,
	registry: Arc<ConnectionRegistry>,
}

impl Harness {
	fn new(confirm_timeout: Duration) -> Self {
		Self {
			manager: Arc::new(PossessionManager::new(confirm_timeout)),
			accounts: AccountService::in_memory(),
			registry: Arc::new(ConnectionRegistry::new()),
		}
	}

	async fn connect(&self, identity: &FriendCode) -> mpsc::Receiver<pb::Envelope> {
		let (tx, rx) = mpsc::channel(16);
		self.registry.register(identity, tx).await.expect("register");
		rx
	}

	async fn grant_possession(&self, ghost: &FriendCode, possessor: &FriendCode) {
		self.accounts
			.upsert_grant(ghost, possessor, UserPermissions::none().with_elevated(ElevatedCapability::Possession))
			.await
			.expect("upsert");
	}

	/// Drive `begin` on a separate task so the test can play the ghost.
	fn spawn_begin(&self, possessor: &FriendCode, ghost: &FriendCode) -> tokio::task::JoinHandle<pb::PossessionBeginResponse> {
		let manager = Arc::clone(&self.manager);
		let accounts = self.accounts.clone();
		let registry = Arc::clone(&self.registry);
		let possessor = possessor.clone();
		let ghost = ghost.clone();
		tokio::spawn(async move {
			manager
				.begin(&possessor, &ghost, pb::MoveMode::Run as i32, &accounts, &registry)
				.await
		})
	}
}

async fn expect_begin_command(rx: &mut mpsc::Receiver<pb::Envelope>) -> pb::PossessionBeginCommand {
	let envelope = rx.recv().await.expect("begin command");
	match envelope.msg {
		Some(pb::envelope::Msg::PossessionBeginCommand(cmd)) => cmd,
		other => panic!("expected a possession begin command, got {other:?}"),
	}
}

fn accepted_ack(session_id: &str) -> pb::PossessionBeginAck {
	pb::PossessionBeginAck {
		session_id: session_id.to_string(),
		result: pb::BeginResult::Accepted as i32,
		character_name: "Mora Whisper".to_string(),
		home_world: "Balmung".to_string(),
	}
}

#[tokio::test]
async fn begin_rejects_before_reserving_a_session() {
	let h = Harness::new(Duration::from_secs(1));
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");

	let resp = h.manager.begin(&alice, &alice, 0, &h.accounts, &h.registry).await;
	assert_eq!(resp.code, pb::ResponseCode::BadDataInRequest as i32);

	let resp = h.manager.begin(&alice, &bob, 0, &h.accounts, &h.registry).await;
	assert_eq!(resp.code, pb::ResponseCode::TargetNotFriends as i32);

	h.grant_possession(&bob, &alice).await;
	let resp = h.manager.begin(&alice, &bob, 0, &h.accounts, &h.registry).await;
	assert_eq!(resp.code, pb::ResponseCode::TargetOffline as i32);

	// Friend, online, but without the possession bit.
	h.accounts
		.upsert_grant(&bob, &alice, UserPermissions::none())
		.await
		.expect("upsert");
	let _rx = h.connect(&bob).await;
	let resp = h.manager.begin(&alice, &bob, 0, &h.accounts, &h.registry).await;
	assert_eq!(resp.code, pb::ResponseCode::TargetHasNotGrantedSenderPermissions as i32);
	assert_eq!(resp.result, pb::BeginResult::Uninitialized as i32);

	assert!(h.manager.session_for(&alice).await.is_none());
	assert_eq!(h.manager.active_count().await, 0);
}

#[tokio::test]
async fn accepted_session_relays_and_ends_voluntarily() {
	let h = Harness::new(Duration::from_secs(2));
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");

	h.grant_possession(&bob, &alice).await;
	let mut bob_rx = h.connect(&bob).await;

	let begin = h.spawn_begin(&alice, &bob);
	let cmd = expect_begin_command(&mut bob_rx).await;
	assert_eq!(cmd.possessor_friend_code, "AAAA-0001");
	assert_eq!(cmd.move_mode, pb::MoveMode::Run as i32);

	h.manager.confirm(&bob, accepted_ack(&cmd.session_id)).await;

	let resp = begin.await.expect("begin task");
	assert_eq!(resp.code, pb::ResponseCode::Success as i32);
	assert_eq!(resp.result, pb::BeginResult::Accepted as i32);
	assert_eq!(resp.target_name, "Mora Whisper");
	assert_eq!(resp.target_world, "Balmung");

	let session = h.manager.session_for(&alice).await.expect("session");
	assert_eq!(session.state, SessionState::Active);
	assert_eq!(h.manager.active_count().await, 1);

	// Only the possessor may feed samples.
	let sample = pb::MovementSample {
		horizontal: 1.0,
		vertical: 0.0,
		turn: 0.25,
		backward: false,
	};
	h.manager.relay_movement(&alice, sample, &h.registry).await.expect("relay");
	assert_eq!(
		h.manager.relay_movement(&bob, sample, &h.registry).await,
		Err(RelayError::SessionMismatch)
	);

	let envelope = bob_rx.recv().await.expect("movement command");
	match envelope.msg {
		Some(pb::envelope::Msg::MovementCommand(cmd)) => {
			assert_eq!(cmd.session_id, session.id.to_string());
			assert_eq!(cmd.sample.expect("sample").turn, 0.25);
		}
		other => panic!("expected a movement command, got {other:?}"),
	}

	let camera = pb::CameraSample {
		zoom: 6.0,
		x: 0.0,
		y: 1.5,
		z: 0.0,
	};
	h.manager.relay_camera(&alice, camera, &h.registry).await.expect("relay");
	let envelope = bob_rx.recv().await.expect("camera command");
	assert!(matches!(envelope.msg, Some(pb::envelope::Msg::CameraCommand(_))));

	let resp = h.manager.end(&alice, &h.registry).await;
	assert_eq!(resp.code, pb::ResponseCode::Success as i32);

	let envelope = bob_rx.recv().await.expect("ended command");
	match envelope.msg {
		Some(pb::envelope::Msg::PossessionEndedCommand(cmd)) => {
			assert_eq!(cmd.reason, pb::SessionEndReason::Voluntary as i32);
			assert_eq!(cmd.counterpart_friend_code, "AAAA-0001");
		}
		other => panic!("expected a session-ended command, got {other:?}"),
	}

	assert_eq!(
		h.manager.relay_movement(&alice, sample, &h.registry).await,
		Err(RelayError::SessionMismatch)
	);
	let resp = h.manager.end(&alice, &h.registry).await;
	assert_eq!(resp.code, pb::ResponseCode::SenderNotInSession as i32);
	assert_eq!(h.manager.active_count().await, 0);
}

#[tokio::test]
async fn declined_ack_reports_the_result_and_frees_both_members() {
	let h = Harness::new(Duration::from_secs(2));
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");

	h.grant_possession(&bob, &alice).await;
	let mut bob_rx = h.connect(&bob).await;

	let begin = h.spawn_begin(&alice, &bob);
	let cmd = expect_begin_command(&mut bob_rx).await;

	let ack = pb::PossessionBeginAck {
		session_id: cmd.session_id,
		result: pb::BeginResult::SafeMode as i32,
		character_name: String::new(),
		home_world: String::new(),
	};
	h.manager.confirm(&bob, ack).await;

	let resp = begin.await.expect("begin task");
	// The exchange worked; the refusal itself travels in `result`.
	assert_eq!(resp.code, pb::ResponseCode::Success as i32);
	assert_eq!(resp.result, pb::BeginResult::SafeMode as i32);

	assert!(h.manager.session_for(&alice).await.is_none());
	assert!(h.manager.session_for(&bob).await.is_none());
}

#[tokio::test]
async fn unanswered_begin_times_out_and_frees_both_members() {
	let h = Harness::new(Duration::from_millis(50));
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");

	h.grant_possession(&bob, &alice).await;
	let mut bob_rx = h.connect(&bob).await;

	let begin = h.spawn_begin(&alice, &bob);
	let _ = expect_begin_command(&mut bob_rx).await;

	let resp = begin.await.expect("begin task");
	assert_eq!(resp.code, pb::ResponseCode::Timeout as i32);
	assert_eq!(resp.result, pb::BeginResult::Uninitialized as i32);
	assert!(h.manager.session_for(&alice).await.is_none());
	assert!(h.manager.session_for(&bob).await.is_none());

	// The pair is free again: a fresh attempt goes all the way through.
	let begin = h.spawn_begin(&alice, &bob);
	let cmd = expect_begin_command(&mut bob_rx).await;
	h.manager.confirm(&bob, accepted_ack(&cmd.session_id)).await;
	let resp = begin.await.expect("begin task");
	assert_eq!(resp.code, pb::ResponseCode::Success as i32);
	assert_eq!(resp.result, pb::BeginResult::Accepted as i32);
}

#[tokio::test]
async fn members_of_a_pending_session_cannot_start_another() {
	let h = Harness::new(Duration::from_millis(200));
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");
	let carol = code("CCCC-0003");

	h.grant_possession(&bob, &alice).await;
	h.grant_possession(&carol, &alice).await;
	h.grant_possession(&bob, &carol).await;
	let mut bob_rx = h.connect(&bob).await;
	let _carol_rx = h.connect(&carol).await;

	let begin = h.spawn_begin(&alice, &bob);
	let _ = expect_begin_command(&mut bob_rx).await;

	let resp = h.manager.begin(&alice, &carol, 0, &h.accounts, &h.registry).await;
	assert_eq!(resp.code, pb::ResponseCode::SenderAlreadyInSession as i32);

	let resp = h.manager.begin(&carol, &bob, 0, &h.accounts, &h.registry).await;
	assert_eq!(resp.code, pb::ResponseCode::TargetAlreadyInSession as i32);

	// Let the original attempt expire so the task ends cleanly.
	let resp = begin.await.expect("begin task");
	assert_eq!(resp.code, pb::ResponseCode::Timeout as i32);
}

#[tokio::test]
async fn stale_and_mismatched_acks_are_dropped() {
	let h = Harness::new(Duration::from_millis(100));
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");
	let carol = code("CCCC-0003");

	h.grant_possession(&bob, &alice).await;
	let mut bob_rx = h.connect(&bob).await;

	// Ack for a session that never existed.
	h.manager.confirm(&bob, accepted_ack(&uuid::Uuid::new_v4().to_string())).await;
	// Garbage session id.
	h.manager.confirm(&bob, accepted_ack("not-a-uuid")).await;

	let begin = h.spawn_begin(&alice, &bob);
	let cmd = expect_begin_command(&mut bob_rx).await;

	// Only the ghost may answer.
	h.manager.confirm(&carol, accepted_ack(&cmd.session_id)).await;
	h.manager.confirm(&alice, accepted_ack(&cmd.session_id)).await;

	let resp = begin.await.expect("begin task");
	assert_eq!(resp.code, pb::ResponseCode::Timeout as i32);
}

#[tokio::test]
async fn ghost_disconnect_during_confirmation_resolves_begin() {
	let h = Harness::new(Duration::from_secs(5));
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");

	h.grant_possession(&bob, &alice).await;
	let mut bob_rx = h.connect(&bob).await;

	let begin = h.spawn_begin(&alice, &bob);
	let _ = expect_begin_command(&mut bob_rx).await;

	h.registry.unregister(&bob).await;
	h.manager.handle_disconnect(&bob, &h.registry).await;

	let resp = begin.await.expect("begin task");
	assert_eq!(resp.code, pb::ResponseCode::TargetOffline as i32);
	assert!(h.manager.session_for(&alice).await.is_none());
}

#[tokio::test]
async fn active_member_disconnect_notifies_the_counterpart() {
	let h = Harness::new(Duration::from_secs(2));
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");

	h.grant_possession(&bob, &alice).await;
	let _alice_rx = h.connect(&alice).await;
	let mut bob_rx = h.connect(&bob).await;

	let begin = h.spawn_begin(&alice, &bob);
	let cmd = expect_begin_command(&mut bob_rx).await;
	h.manager.confirm(&bob, accepted_ack(&cmd.session_id)).await;
	let resp = begin.await.expect("begin task");
	assert_eq!(resp.result, pb::BeginResult::Accepted as i32);

	// Alice's connection drops mid-session.
	h.registry.unregister(&alice).await;
	h.manager.handle_disconnect(&alice, &h.registry).await;

	let envelope = bob_rx.recv().await.expect("ended command");
	match envelope.msg {
		Some(pb::envelope::Msg::PossessionEndedCommand(cmd)) => {
			assert_eq!(cmd.reason, pb::SessionEndReason::Disconnected as i32);
			assert_eq!(cmd.counterpart_friend_code, "AAAA-0001");
		}
		other => panic!("expected a session-ended command, got {other:?}"),
	}
	assert_eq!(h.manager.active_count().await, 0);
	assert!(h.manager.session_for(&bob).await.is_none());
}
