#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use marionette_domain::FriendCode;
use marionette_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use marionette_protocol::pb;
use marionette_util::SecretString;
use marionette_util::time::{unix_ms_now, unix_secs_now};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server::ServerContext;
use crate::server::accounts::hash_secret;
use crate::server::auth::{issue_hmac_token, verify_hmac_token};
use crate::server::dispatch::dispatch_action;
use crate::server::possession::RelayError;

/// v1 protocol version written into `pb::Envelope.version`.
pub const PROTOCOL_VERSION: u32 = marionette_protocol::version::PROTOCOL_VERSION_U32;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,

	/// Command stream queue depth; sends beyond this are dropped.
	pub command_queue_capacity: usize,

	pub auth_hmac_secret: SecretString,
	pub token_ttl: Duration,

	/// When set, logins whose client version differs are rejected.
	pub required_client_version: Option<String>,

	pub max_targets: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			command_queue_capacity: 256,
			auth_hmac_secret: SecretString::new(Uuid::new_v4().to_string()),
			token_ttl: Duration::from_secs(240 * 60),
			required_client_version: None,
			max_targets: 8,
		}
	}
}

pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	ctx: Arc<ServerContext>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("marionette_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("marionette_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut control_send, mut control_recv) =
		connection.accept_bi().await.context("accept control bidirectional stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let max_frame = settings.max_frame_bytes as usize;
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("marionette_server_control_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match marionette_protocol::decode_frame::<pb::Envelope>(&buf, max_frame) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("marionette_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(marionette_protocol::FramingError::Truncated { .. }) => break,
					Err(e) => {
						metrics::counter!("marionette_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	let (login_request_id, login_version, login) = wait_for_login(&mut ctrl_rx).await?;
	metrics::counter!("marionette_server_login_attempts_total").increment(1);

	if login_version != PROTOCOL_VERSION {
		warn!(conn_id, version = login_version, "rejecting login with unsupported protocol version");
		metrics::counter!("marionette_server_logins_rejected_total").increment(1);
		send_envelope(
			&mut control_send,
			pb::Envelope {
				version: PROTOCOL_VERSION,
				request_id: login_request_id,
				msg: Some(pb::envelope::Msg::LoginResponse(login_failure(pb::ResponseCode::BadDataInRequest))),
			},
		)
		.await
		.ok();
		return Ok(());
	}

	if let Some(required) = settings.required_client_version.as_deref()
		&& login.client_version.trim() != required
	{
		warn!(
			conn_id,
			client_version = %login.client_version,
			required,
			"rejecting login with unsupported client version"
		);
		metrics::counter!("marionette_server_logins_rejected_total").increment(1);
		send_envelope(
			&mut control_send,
			pb::Envelope {
				version: PROTOCOL_VERSION,
				request_id: login_request_id,
				msg: Some(pb::envelope::Msg::LoginResponse(login_failure(pb::ResponseCode::BadDataInRequest))),
			},
		)
		.await
		.ok();
		return Ok(());
	}

	let identity: FriendCode = {
		let token = login.token.trim();
		let resolved = if !token.is_empty() {
			match verify_hmac_token(token, settings.auth_hmac_secret.expose()) {
				Ok(claims) => claims.sub.parse::<FriendCode>().ok(),
				Err(e) => {
					debug!(conn_id, error = %e, "login token rejected");
					None
				}
			}
		} else {
			let hash = hash_secret(login.secret.trim());
			match ctx.accounts.friend_code_for_secret_hash(&hash).await {
				Ok(found) => found,
				Err(e) => {
					warn!(conn_id, error = %e, "secret lookup failed");
					None
				}
			}
		};

		match resolved {
			Some(identity) => identity,
			None => {
				warn!(conn_id, "unauthorized: unknown secret or invalid token");
				metrics::counter!("marionette_server_logins_rejected_total").increment(1);
				send_envelope(
					&mut control_send,
					pb::Envelope {
						version: PROTOCOL_VERSION,
						request_id: login_request_id,
						msg: Some(pb::envelope::Msg::LoginResponse(login_failure(pb::ResponseCode::Unauthorized))),
					},
				)
				.await
				.ok();
				return Ok(());
			}
		}
	};

	let (cmd_tx, cmd_rx) = mpsc::channel::<pb::Envelope>(settings.command_queue_capacity);
	if ctx.registry.register(&identity, cmd_tx).await.is_err() {
		warn!(conn_id, identity = %identity, "rejecting login: identity already connected");
		metrics::counter!("marionette_server_logins_rejected_total").increment(1);
		send_envelope(
			&mut control_send,
			pb::Envelope {
				version: PROTOCOL_VERSION,
				request_id: login_request_id,
				msg: Some(pb::envelope::Msg::LoginResponse(login_failure(pb::ResponseCode::AlreadyLoggedIn))),
			},
		)
		.await
		.ok();
		return Ok(());
	}

	// Registered from here on: every exit path below must unregister.
	let session_result = run_session(
		conn_id,
		&connection,
		&mut control_send,
		&mut ctrl_rx,
		cmd_rx,
		&ctx,
		&settings,
		&identity,
		login_request_id,
	)
	.await;

	ctx.registry.unregister(&identity).await;
	ctx.possession.handle_disconnect(&identity, &ctx.registry).await;
	notify_friend_status(&ctx, &identity, false).await;
	info!(conn_id, identity = %identity, "connection closed");

	let _ = reader_task.await;

	session_result
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
	conn_id: u64,
	connection: &quinn::Connection,
	control_send: &mut quinn::SendStream,
	ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>,
	mut cmd_rx: mpsc::Receiver<pb::Envelope>,
	ctx: &Arc<ServerContext>,
	settings: &ConnectionSettings,
	identity: &FriendCode,
	login_request_id: String,
) -> anyhow::Result<()> {
	let token = issue_hmac_token(identity.as_str(), settings.token_ttl, settings.auth_hmac_secret.expose());
	let token_exp = unix_secs_now().saturating_add(settings.token_ttl.as_secs());

	let friends = friend_snapshot(ctx, identity).await;

	send_envelope(
		control_send,
		pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: login_request_id,
			msg: Some(pb::envelope::Msg::LoginResponse(pb::LoginResponse {
				code: pb::ResponseCode::Success as i32,
				friend_code: identity.to_string(),
				token,
				friends,
			})),
		},
	)
	.await
	.context("send LoginResponse")?;

	info!(conn_id, identity = %identity, "login accepted");
	metrics::counter!("marionette_server_logins_total").increment(1);

	// The client opens the command stream after a successful login; the
	// server only ever writes on it.
	let connection_for_writer = connection.clone();
	let writer_task: tokio::task::JoinHandle<anyhow::Result<()>> = {
		let writer_conn_id = conn_id;
		tokio::spawn(async move {
			let (mut cmd_send, _cmd_recv) = connection_for_writer
				.accept_bi()
				.await
				.context("accept command bidirectional stream")?;
			debug!(conn_id = writer_conn_id, "accepted command stream");

			while let Some(env) = cmd_rx.recv().await {
				let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
				metrics::counter!("marionette_server_envelopes_out_total").increment(1);
				cmd_send.write_all(&frame).await.context("command stream write failed")?;
			}
			Ok(())
		})
	};

	notify_friend_status(ctx, identity, true).await;

	let loop_result = async {
		while let Some(env) = ctrl_rx.recv().await {
			let Some(msg) = env.msg else { continue };

			if unix_secs_now() >= token_exp {
				warn!(conn_id, identity = %identity, "session token expired; closing connection");
				metrics::counter!("marionette_server_sessions_expired_total").increment(1);
				break;
			}

			ctx.registry.touch(identity).await;

			match msg {
				pb::envelope::Msg::Ping(ping) => {
					let pong = pb::Pong {
						client_time_unix_ms: ping.client_time_unix_ms,
						server_time_unix_ms: unix_ms_now(),
					};

					send_envelope(
						control_send,
						pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::Pong(pong)),
						},
					)
					.await?;
				}

				pb::envelope::Msg::ActionRequest(req) => {
					let response = dispatch_action(ctx, identity, req, settings.max_targets).await;
					send_envelope(
						control_send,
						pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::ActionResponse(response)),
						},
					)
					.await?;
				}

				pb::envelope::Msg::PossessionBeginRequest(req) => {
					let response = match req.target_friend_code.parse::<FriendCode>() {
						Ok(target) => {
							let response = ctx
								.possession
								.begin(identity, &target, req.move_mode, &ctx.accounts, &ctx.registry)
								.await;

							if response.result == pb::BeginResult::Accepted as i32
								&& let Err(e) = ctx.audit.record_possession("begin", identity.as_str(), target.as_str()).await
							{
								metrics::counter!("marionette_server_audit_failures_total").increment(1);
								warn!(conn_id, error = %e, "failed to persist possession audit");
							}

							response
						}
						Err(_) => pb::PossessionBeginResponse {
							code: pb::ResponseCode::BadDataInRequest as i32,
							result: pb::BeginResult::Uninitialized as i32,
							target_name: String::new(),
							target_world: String::new(),
						},
					};

					send_envelope(
						control_send,
						pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::PossessionBeginResponse(response)),
						},
					)
					.await?;
				}

				pb::envelope::Msg::PossessionEndRequest(_) => {
					let response = ctx.possession.end(identity, &ctx.registry).await;

					if response.code == pb::ResponseCode::Success as i32
						&& let Err(e) = ctx.audit.record_possession("end", identity.as_str(), "").await
					{
						metrics::counter!("marionette_server_audit_failures_total").increment(1);
						warn!(conn_id, error = %e, "failed to persist possession audit");
					}

					send_envelope(
						control_send,
						pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::PossessionEndResponse(response)),
						},
					)
					.await?;
				}

				pb::envelope::Msg::MovementSample(sample) => {
					if let Err(RelayError::SessionMismatch) = ctx.possession.relay_movement(identity, sample, &ctx.registry).await {
						metrics::counter!("marionette_server_relay_mismatch_total").increment(1);
						debug!(conn_id, identity = %identity, "dropping movement sample outside an active session");
					}
				}

				pb::envelope::Msg::CameraSample(sample) => {
					if let Err(RelayError::SessionMismatch) = ctx.possession.relay_camera(identity, sample, &ctx.registry).await {
						metrics::counter!("marionette_server_relay_mismatch_total").increment(1);
						debug!(conn_id, identity = %identity, "dropping camera sample outside an active session");
					}
				}

				pb::envelope::Msg::PossessionBeginAck(ack) => {
					ctx.possession.confirm(identity, ack).await;
				}

				pb::envelope::Msg::AddFriendRequest(req) => {
					let response = handle_add_friend(ctx, identity, req).await;
					send_envelope(
						control_send,
						pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::AddFriendResponse(response)),
						},
					)
					.await?;
				}

				pb::envelope::Msg::RemoveFriendRequest(req) => {
					let response = handle_remove_friend(ctx, identity, req).await;
					send_envelope(
						control_send,
						pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::RemoveFriendResponse(response)),
						},
					)
					.await?;
				}

				pb::envelope::Msg::UpdateFriendPermissionsRequest(req) => {
					let response = handle_update_permissions(ctx, identity, req).await;
					send_envelope(
						control_send,
						pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::UpdateFriendPermissionsResponse(response)),
						},
					)
					.await?;
				}

				pb::envelope::Msg::Login(_) => {
					debug!(conn_id, "ignoring duplicate Login");
				}

				other => {
					warn!(conn_id, message = message_name(&other), "unhandled control message");
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	// Unregistering (in the caller) drops the registry's sender which ends
	// the writer loop; abort covers the case where the stream never opened.
	writer_task.abort();
	let _ = writer_task.await;

	loop_result
}

async fn wait_for_login(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<(String, u32, pb::Login)> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let pb::envelope::Msg::Login(login) = msg {
			return Ok((env.request_id, env.version, login));
		}
	}
	Err(anyhow!("connection closed before Login"))
}

fn login_failure(code: pb::ResponseCode) -> pb::LoginResponse {
	pb::LoginResponse {
		code: code as i32,
		friend_code: String::new(),
		token: String::new(),
		friends: Vec::new(),
	}
}

fn message_name(msg: &pb::envelope::Msg) -> &'static str {
	match msg {
		pb::envelope::Msg::Login(_) => "Login",
		pb::envelope::Msg::LoginResponse(_) => "LoginResponse",
		pb::envelope::Msg::Ping(_) => "Ping",
		pb::envelope::Msg::Pong(_) => "Pong",
		pb::envelope::Msg::ActionRequest(_) => "ActionRequest",
		pb::envelope::Msg::ActionResponse(_) => "ActionResponse",
		pb::envelope::Msg::ActionCommand(_) => "ActionCommand",
		pb::envelope::Msg::PossessionBeginRequest(_) => "PossessionBeginRequest",
		pb::envelope::Msg::PossessionBeginResponse(_) => "PossessionBeginResponse",
		pb::envelope::Msg::PossessionEndRequest(_) => "PossessionEndRequest",
		pb::envelope::Msg::PossessionEndResponse(_) => "PossessionEndResponse",
		pb::envelope::Msg::MovementSample(_) => "MovementSample",
		pb::envelope::Msg::CameraSample(_) => "CameraSample",
		pb::envelope::Msg::PossessionBeginCommand(_) => "PossessionBeginCommand",
		pb::envelope::Msg::PossessionBeginAck(_) => "PossessionBeginAck",
		pb::envelope::Msg::PossessionEndedCommand(_) => "PossessionEndedCommand",
		pb::envelope::Msg::MovementCommand(_) => "MovementCommand",
		pb::envelope::Msg::CameraCommand(_) => "CameraCommand",
		pb::envelope::Msg::AddFriendRequest(_) => "AddFriendRequest",
		pb::envelope::Msg::AddFriendResponse(_) => "AddFriendResponse",
		pb::envelope::Msg::RemoveFriendRequest(_) => "RemoveFriendRequest",
		pb::envelope::Msg::RemoveFriendResponse(_) => "RemoveFriendResponse",
		pb::envelope::Msg::UpdateFriendPermissionsRequest(_) => "UpdateFriendPermissionsRequest",
		pb::envelope::Msg::UpdateFriendPermissionsResponse(_) => "UpdateFriendPermissionsResponse",
		pb::envelope::Msg::FriendStatusCommand(_) => "FriendStatusCommand",
	}
}

/// Outgoing friend edges with live presence. A friend reads as online
/// only when the pair is mutual, so one-sided adds leak no presence.
async fn friend_snapshot(ctx: &ServerContext, identity: &FriendCode) -> Vec<pb::FriendEntry> {
	let edges = match ctx.accounts.friends_of(identity).await {
		Ok(edges) => edges,
		Err(e) => {
			warn!(identity = %identity, error = %e, "friend snapshot lookup failed");
			return Vec::new();
		}
	};

	let mut entries = Vec::with_capacity(edges.len());
	for edge in edges {
		let mutual = ctx.accounts.are_mutual_friends(identity, &edge.friend_code).await.unwrap_or(false);
		let online = mutual && ctx.registry.is_online(&edge.friend_code).await;
		entries.push(pb::FriendEntry {
			friend_code: edge.friend_code.to_string(),
			online,
			permissions: Some(edge.permissions.into()),
		});
	}
	entries
}

/// Tell every online mutual friend that `who` went on- or offline.
async fn notify_friend_status(ctx: &ServerContext, who: &FriendCode, online: bool) {
	let edges = match ctx.accounts.friends_of(who).await {
		Ok(edges) => edges,
		Err(e) => {
			warn!(identity = %who, error = %e, "friend status lookup failed");
			return;
		}
	};

	for edge in edges {
		let mutual = ctx.accounts.are_mutual_friends(who, &edge.friend_code).await.unwrap_or(false);
		if !mutual || !ctx.registry.is_online(&edge.friend_code).await {
			continue;
		}

		let command = pb::FriendStatusCommand {
			friend_code: who.to_string(),
			online,
			permissions: None,
		};
		let envelope = pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::FriendStatusCommand(command)),
		};
		if !ctx.registry.send(&edge.friend_code, envelope).await {
			debug!(friend = %edge.friend_code, "friend went offline during status fan-out");
		}
	}
}

async fn handle_add_friend(ctx: &ServerContext, owner: &FriendCode, req: pb::AddFriendRequest) -> pb::AddFriendResponse {
	let Ok(target) = req.target_friend_code.parse::<FriendCode>() else {
		return pb::AddFriendResponse {
			code: pb::ResponseCode::BadDataInRequest as i32,
			online: false,
		};
	};

	if target == *owner {
		return pb::AddFriendResponse {
			code: pb::ResponseCode::BadDataInRequest as i32,
			online: false,
		};
	}

	match ctx.accounts.account_exists(&target).await {
		Ok(true) => {}
		Ok(false) => {
			return pb::AddFriendResponse {
				code: pb::ResponseCode::TargetNotFound as i32,
				online: false,
			};
		}
		Err(e) => {
			warn!(owner = %owner, target = %target, error = %e, "account lookup failed");
			return pb::AddFriendResponse {
				code: pb::ResponseCode::Unknown as i32,
				online: false,
			};
		}
	}

	// Adding grants nothing; permissions are opened explicitly afterwards.
	if let Err(e) = ctx
		.accounts
		.upsert_grant(owner, &target, marionette_domain::UserPermissions::none())
		.await
	{
		warn!(owner = %owner, target = %target, error = %e, "grant upsert failed");
		return pb::AddFriendResponse {
			code: pb::ResponseCode::Unknown as i32,
			online: false,
		};
	}

	let mutual = ctx.accounts.are_mutual_friends(owner, &target).await.unwrap_or(false);
	let online = mutual && ctx.registry.is_online(&target).await;

	if online {
		notify_grant_change(ctx, owner, &target, Some(marionette_domain::UserPermissions::none())).await;
	}

	pb::AddFriendResponse {
		code: pb::ResponseCode::Success as i32,
		online,
	}
}

async fn handle_remove_friend(ctx: &ServerContext, owner: &FriendCode, req: pb::RemoveFriendRequest) -> pb::RemoveFriendResponse {
	let Ok(target) = req.target_friend_code.parse::<FriendCode>() else {
		return pb::RemoveFriendResponse {
			code: pb::ResponseCode::BadDataInRequest as i32,
		};
	};

	let was_mutual = ctx.accounts.are_mutual_friends(owner, &target).await.unwrap_or(false);

	match ctx.accounts.remove_grant(owner, &target).await {
		Ok(true) => {
			if was_mutual && ctx.registry.is_online(&target).await {
				notify_grant_change(ctx, owner, &target, None).await;
			}
			pb::RemoveFriendResponse {
				code: pb::ResponseCode::Success as i32,
			}
		}
		Ok(false) => pb::RemoveFriendResponse {
			code: pb::ResponseCode::TargetNotFriends as i32,
		},
		Err(e) => {
			warn!(owner = %owner, target = %target, error = %e, "grant removal failed");
			pb::RemoveFriendResponse {
				code: pb::ResponseCode::Unknown as i32,
			}
		}
	}
}

async fn handle_update_permissions(
	ctx: &ServerContext,
	owner: &FriendCode,
	req: pb::UpdateFriendPermissionsRequest,
) -> pb::UpdateFriendPermissionsResponse {
	let Ok(target) = req.target_friend_code.parse::<FriendCode>() else {
		return pb::UpdateFriendPermissionsResponse {
			code: pb::ResponseCode::BadDataInRequest as i32,
		};
	};

	let Some(permissions) = req.permissions else {
		return pb::UpdateFriendPermissionsResponse {
			code: pb::ResponseCode::BadDataInRequest as i32,
		};
	};

	// Only an existing edge can be re-granted.
	match ctx.accounts.resolve_grant(owner, &target).await {
		Ok(Some(_)) => {}
		Ok(None) => {
			return pb::UpdateFriendPermissionsResponse {
				code: pb::ResponseCode::TargetNotFriends as i32,
			};
		}
		Err(e) => {
			warn!(owner = %owner, target = %target, error = %e, "grant lookup failed");
			return pb::UpdateFriendPermissionsResponse {
				code: pb::ResponseCode::Unknown as i32,
			};
		}
	}

	let permissions: marionette_domain::UserPermissions = permissions.into();

	if let Err(e) = ctx.accounts.upsert_grant(owner, &target, permissions).await {
		warn!(owner = %owner, target = %target, error = %e, "grant upsert failed");
		return pb::UpdateFriendPermissionsResponse {
			code: pb::ResponseCode::Unknown as i32,
		};
	}

	let mutual = ctx.accounts.are_mutual_friends(owner, &target).await.unwrap_or(false);
	if mutual && ctx.registry.is_online(&target).await {
		notify_grant_change(ctx, owner, &target, Some(permissions)).await;
	}

	pb::UpdateFriendPermissionsResponse {
		code: pb::ResponseCode::Success as i32,
	}
}

/// Tell `target` what `owner` now grants them; `None` means the edge is gone.
async fn notify_grant_change(
	ctx: &ServerContext,
	owner: &FriendCode,
	target: &FriendCode,
	permissions: Option<marionette_domain::UserPermissions>,
) {
	let command = pb::FriendStatusCommand {
		friend_code: owner.to_string(),
		online: ctx.registry.is_online(owner).await,
		permissions: permissions.map(Into::into),
	};
	let envelope = pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: String::new(),
		msg: Some(pb::envelope::Msg::FriendStatusCommand(command)),
	};
	if !ctx.registry.send(target, envelope).await {
		debug!(target = %target, "target went offline during grant-change notice");
	}
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("marionette_server_envelopes_out_total").increment(1);
	metrics::counter!("marionette_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
