#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context as _;
use marionette_client_core::{ClientConfig, SessionControl};
use marionette_domain::{ElevatedCapability, FriendCode, PrimaryCapability, UserPermissions};
use marionette_protocol::pb;
use marionette_server::quic::QuicServerConfig;
use marionette_server::server::accounts::AccountService;
use marionette_server::server::audit::AuditService;
use marionette_server::server::connection::ConnectionSettings;
use marionette_server::server::possession::PossessionManager;
use marionette_server::server::rate::ActionRateLimiter;
use marionette_server::server::registry::ConnectionRegistry;
use marionette_server::server::{ServerContext, serve};
use marionette_util::SecretString;
use marionette_util::time::unix_ms_now;
use tokio::sync::mpsc;

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("MARIONETTE_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

const ALICE: &str = "AAAA-0001";
const BOB: &str = "BBBB-0002";
const ALICE_SECRET: &str = "alpha-secret";
const BOB_SECRET: &str = "beta-secret";

fn code(s: &str) -> FriendCode {
	s.parse().expect("friend code")
}

/// Seed two mutual friends: Bob grants Alice emotes and possession, Alice
/// grants Bob nothing.
async fn seed_accounts() -> anyhow::Result<AccountService> {
	let accounts = AccountService::in_memory();
	accounts.create_account(&code(ALICE), ALICE_SECRET).await?;
	accounts.create_account(&code(BOB), BOB_SECRET).await?;

	accounts
		.upsert_grant(
			&code(BOB),
			&code(ALICE),
			UserPermissions::none()
				.with_primary(PrimaryCapability::Emote)
				.with_elevated(ElevatedCapability::Possession),
		)
		.await?;
	accounts.upsert_grant(&code(ALICE), &code(BOB), UserPermissions::none()).await?;

	Ok(accounts)
}

async fn start_server() -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<anyhow::Result<()>>)> {
	init_test_logging();

	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

	let quic = QuicServerConfig::dev("127.0.0.1:0".parse().context("parse bind addr")?);
	let (endpoint, _cert_der) = quic.bind_dev_endpoint()?;
	let addr = endpoint.local_addr().context("server local_addr")?;

	let ctx = Arc::new(ServerContext {
		registry: Arc::new(ConnectionRegistry::new()),
		accounts: seed_accounts().await?,
		possession: Arc::new(PossessionManager::new(Duration::from_secs(2))),
		rate: Arc::new(ActionRateLimiter::unlimited()),
		audit: Arc::new(AuditService::disabled()),
	});

	let settings = ConnectionSettings {
		auth_hmac_secret: SecretString::new("relay-smoke-secret"),
		..ConnectionSettings::default()
	};

	let server_task = tokio::spawn(async move { serve(endpoint, ctx, settings).await });
	Ok((addr, server_task))
}

async fn connect_and_login(addr: SocketAddr, secret: &str) -> anyhow::Result<(SessionControl, pb::LoginResponse)> {
	let cfg = ClientConfig {
		server_host: "localhost".to_string(),
		server_port: addr.port(),
		server_addr: Some(addr),
		..ClientConfig::default()
	};

	let mut control = SessionControl::connect(cfg).await.context("client connect")?;
	let login = control.login_with_secret(secret).await.context("login")?;
	Ok((control, login))
}

/// Open the command stream and forward every pushed command to a channel.
async fn spawn_command_pump(
	control: &mut SessionControl,
) -> anyhow::Result<(mpsc::UnboundedReceiver<pb::envelope::Msg>, tokio::task::JoinHandle<()>)> {
	let mut commands = control.open_command_stream().await.context("open command stream")?;
	let (tx, rx) = mpsc::unbounded_channel();
	let pump = tokio::spawn(async move {
		let _ = commands
			.run_command_loop(|msg| {
				let _ = tx.send(msg);
			})
			.await;
	});
	Ok((rx, pump))
}

/// Receive commands until `pick` matches, skipping the rest (e.g. friend
/// status churn), with a 5s budget.
async fn expect_command<T>(
	rx: &mut mpsc::UnboundedReceiver<pb::envelope::Msg>,
	mut pick: impl FnMut(pb::envelope::Msg) -> Option<T>,
) -> anyhow::Result<T> {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		let msg = tokio::time::timeout_at(deadline, rx.recv())
			.await
			.context("timeout waiting for command")?
			.context("command pump closed")?;
		if let Some(found) = pick(msg) {
			return Ok(found);
		}
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_and_emote_fan_out() -> anyhow::Result<()> {
	let (addr, server_task) = start_server().await?;

	let (mut bob, bob_login) = connect_and_login(addr, BOB_SECRET).await?;
	assert_eq!(bob_login.friend_code, BOB);
	assert!(!bob_login.token.is_empty());
	// Alice is mutual but not yet online.
	let alice_entry = bob_login
		.friends
		.iter()
		.find(|f| f.friend_code == ALICE)
		.expect("alice in bob's friend list");
	assert!(!alice_entry.online);

	let (mut bob_commands, bob_pump) = spawn_command_pump(&mut bob).await?;

	let (mut alice, alice_login) = connect_and_login(addr, ALICE_SECRET).await?;
	assert_eq!(alice_login.friend_code, ALICE);
	let bob_entry = alice_login
		.friends
		.iter()
		.find(|f| f.friend_code == BOB)
		.expect("bob in alice's friend list");
	assert!(bob_entry.online);

	// Bob hears that Alice came online.
	let status = expect_command(&mut bob_commands, |msg| match msg {
		pb::envelope::Msg::FriendStatusCommand(s) if s.friend_code == ALICE => Some(s),
		_ => None,
	})
	.await?;
	assert!(status.online);

	let pong = alice.ping(unix_ms_now()).await?;
	assert!(pong.server_time_unix_ms > 0);

	let resp = alice
		.send_action(pb::ActionRequest {
			target_friend_codes: vec![BOB.to_string()],
			payload: Some(pb::action::Payload::Emote(pb::EmotePayload {
				emote: "wave".to_string(),
				display_log_message: true,
			})),
		})
		.await?;
	assert_eq!(resp.code, pb::ResponseCode::Success as i32);
	assert_eq!(resp.results.len(), 1);
	assert_eq!(resp.results[0].code, pb::ResponseCode::Success as i32);

	let command = expect_command(&mut bob_commands, |msg| match msg {
		pb::envelope::Msg::ActionCommand(c) => Some(c),
		_ => None,
	})
	.await?;
	assert_eq!(command.sender_friend_code, ALICE);
	match command.payload {
		Some(pb::action::Payload::Emote(emote)) => assert_eq!(emote.emote, "wave"),
		other => panic!("expected an emote payload, got {other:?}"),
	}

	// Bob never granted himself anything from Alice's side.
	let resp = bob
		.send_action(pb::ActionRequest {
			target_friend_codes: vec![ALICE.to_string()],
			payload: Some(pb::action::Payload::Emote(pb::EmotePayload {
				emote: "wave".to_string(),
				display_log_message: true,
			})),
		})
		.await?;
	assert_eq!(resp.code, pb::ResponseCode::TargetHasNotGrantedSenderPermissions as i32);

	alice.close(0, "done");
	bob.close(0, "done");
	bob_pump.abort();
	server_task.abort();
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn possession_round_trip() -> anyhow::Result<()> {
	let (addr, server_task) = start_server().await?;

	let (mut bob, _bob_login) = connect_and_login(addr, BOB_SECRET).await?;
	let (mut bob_commands, bob_pump) = spawn_command_pump(&mut bob).await?;

	let (mut alice, _alice_login) = connect_and_login(addr, ALICE_SECRET).await?;

	// `possession_begin` blocks on Bob's answer, so it runs on its own task
	// while the test plays Bob.
	let begin_task = tokio::spawn(async move {
		let resp = alice.possession_begin(BOB, pb::MoveMode::Walk).await;
		(alice, resp)
	});

	let begin_cmd = expect_command(&mut bob_commands, |msg| match msg {
		pb::envelope::Msg::PossessionBeginCommand(c) => Some(c),
		_ => None,
	})
	.await?;
	assert_eq!(begin_cmd.possessor_friend_code, ALICE);
	assert_eq!(begin_cmd.move_mode, pb::MoveMode::Walk as i32);

	bob.send_possession_ack(pb::PossessionBeginAck {
		session_id: begin_cmd.session_id.clone(),
		result: pb::BeginResult::Accepted as i32,
		character_name: "Mora Whisper".to_string(),
		home_world: "Balmung".to_string(),
	})
	.await?;

	let (mut alice, begin_resp) = tokio::time::timeout(Duration::from_secs(5), begin_task)
		.await
		.context("timeout waiting for begin")?
		.context("begin task join")?;
	let begin_resp = begin_resp?;
	assert_eq!(begin_resp.code, pb::ResponseCode::Success as i32);
	assert_eq!(begin_resp.result, pb::BeginResult::Accepted as i32);
	assert_eq!(begin_resp.target_name, "Mora Whisper");

	alice
		.send_movement(pb::MovementSample {
			horizontal: 1.0,
			vertical: 0.0,
			turn: 0.5,
			backward: false,
		})
		.await?;

	let movement = expect_command(&mut bob_commands, |msg| match msg {
		pb::envelope::Msg::MovementCommand(c) => Some(c),
		_ => None,
	})
	.await?;
	assert_eq!(movement.session_id, begin_cmd.session_id);
	assert_eq!(movement.sample.expect("sample").turn, 0.5);

	alice
		.send_camera(pb::CameraSample {
			zoom: 6.0,
			x: 0.0,
			y: 1.5,
			z: 0.0,
		})
		.await?;
	let camera = expect_command(&mut bob_commands, |msg| match msg {
		pb::envelope::Msg::CameraCommand(c) => Some(c),
		_ => None,
	})
	.await?;
	assert_eq!(camera.session_id, begin_cmd.session_id);

	let end_resp = alice.possession_end().await?;
	assert_eq!(end_resp.code, pb::ResponseCode::Success as i32);

	let ended = expect_command(&mut bob_commands, |msg| match msg {
		pb::envelope::Msg::PossessionEndedCommand(c) => Some(c),
		_ => None,
	})
	.await?;
	assert_eq!(ended.session_id, begin_cmd.session_id);
	assert_eq!(ended.reason, pb::SessionEndReason::Voluntary as i32);
	assert_eq!(ended.counterpart_friend_code, ALICE);

	// A second end has no session to tear down.
	let end_resp = alice.possession_end().await?;
	assert_eq!(end_resp.code, pb::ResponseCode::SenderNotInSession as i32);

	alice.close(0, "done");
	bob.close(0, "done");
	bob_pump.abort();
	server_task.abort();
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_login_and_friend_management() -> anyhow::Result<()> {
	let (addr, server_task) = start_server().await?;

	let (alice, alice_login) = connect_and_login(addr, ALICE_SECRET).await?;
	assert!(!alice_login.token.is_empty());

	// A second login for the same identity is refused while the first
	// connection is registered.
	{
		let cfg = ClientConfig {
			server_host: "localhost".to_string(),
			server_port: addr.port(),
			server_addr: Some(addr),
			..ClientConfig::default()
		};
		let mut dup = SessionControl::connect(cfg).await?;
		let err = dup.login_with_secret(ALICE_SECRET).await.expect_err("duplicate login");
		match err {
			marionette_client_core::ClientCoreError::LoginRejected(code) => {
				assert_eq!(code, pb::ResponseCode::AlreadyLoggedIn);
			}
			other => panic!("expected a login rejection, got {other}"),
		}
		dup.close(0, "done");
	}

	alice.close(0, "reconnecting");

	// Reconnect with the issued token instead of the secret.
	let (mut alice, relogin) = retry_token_login(addr, &alice_login.token).await?;
	assert_eq!(relogin.friend_code, ALICE);

	// Adding requires an account on the other end.
	let resp = alice.add_friend("CCCC-0003").await?;
	assert_eq!(resp.code, pb::ResponseCode::TargetNotFound as i32);

	let resp = alice.remove_friend(BOB).await?;
	assert_eq!(resp.code, pb::ResponseCode::Success as i32);
	let resp = alice.remove_friend(BOB).await?;
	assert_eq!(resp.code, pb::ResponseCode::TargetNotFriends as i32);

	// Re-add and open a grant toward Bob.
	let resp = alice.add_friend(BOB).await?;
	assert_eq!(resp.code, pb::ResponseCode::Success as i32);
	let resp = alice
		.update_friend_permissions(BOB, UserPermissions::none().with_primary(PrimaryCapability::Emote))
		.await?;
	assert_eq!(resp.code, pb::ResponseCode::Success as i32);

	alice.close(0, "done");
	server_task.abort();
	Ok(())
}

/// The old connection may still be unregistering, and the server drops a
/// connection after a failed login; reconnect and retry briefly on
/// `AlreadyLoggedIn` instead of racing the teardown.
async fn retry_token_login(addr: SocketAddr, token: &str) -> anyhow::Result<(SessionControl, pb::LoginResponse)> {
	use marionette_client_core::ClientCoreError;

	for _ in 0..50 {
		let cfg = ClientConfig {
			server_host: "localhost".to_string(),
			server_port: addr.port(),
			server_addr: Some(addr),
			..ClientConfig::default()
		};
		let mut control = SessionControl::connect(cfg).await?;
		match control.login_with_token(token).await {
			Ok(resp) => return Ok((control, resp)),
			Err(ClientCoreError::LoginRejected(pb::ResponseCode::AlreadyLoggedIn)) => {
				control.close(0, "retrying");
				tokio::time::sleep(Duration::from_millis(100)).await;
			}
			Err(e) => return Err(e.into()),
		}
	}
	anyhow::bail!("identity never unregistered after close")
}
