#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use marionette_domain::UserPermissions;
use marionette_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use marionette_protocol::pb;
use marionette_protocol::version::{ALPN, PROTOCOL_VERSION_U32};
use marionette_util::endpoint::QuicEndpoint;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Current protocol version used in `pb::Envelope.version`.
pub const PROTOCOL_VERSION: u32 = PROTOCOL_VERSION_U32;

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Version string sent in `Login.client_version`.
	pub client_version: String,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + stream setup.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Parse a `quic://host:port` endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok((e.host, e.port))
	}

	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let (host, port) = Self::parse_quic_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		// Local dev default.
		Self {
			server_host: "localhost".to_string(),
			server_port: 18520,
			server_addr: Some("127.0.0.1:18520".parse().expect("valid default addr")),
			client_version: env!("CARGO_PKG_VERSION").to_string(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server refused the login.
	#[error("login rejected: {0:?}")]
	LoginRejected(pb::ResponseCode),

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// Control half of a session (login, requests, one-way samples).
pub struct SessionControl {
	conn: quinn::Connection,
	control_send: quinn::SendStream,
	control_recv: quinn::RecvStream,
	max_frame_bytes: usize,
	client_version: String,
	commands_opened: bool,
}

/// Server-push reader half of a session.
pub struct SessionCommands {
	commands_recv: quinn::RecvStream,
	// Keep the send half alive so the peer doesn't see an immediate FIN.
	_commands_send_keepalive: quinn::SendStream,
	max_frame_bytes: usize,
}

impl SessionControl {
	/// Connect and open the control stream. Call `login_with_secret` or
	/// `login_with_token` next; the server answers nothing else first.
	pub async fn connect(cfg: ClientConfig) -> Result<Self, ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?;

				let addrs: Vec<SocketAddr> = addrs.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (control_send, control_recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		Ok(Self {
			conn,
			control_send,
			control_recv,
			max_frame_bytes: cfg.max_frame_bytes,
			client_version: cfg.client_version,
			commands_opened: false,
		})
	}

	/// First login for an identity, or a fallback when the token expired.
	pub async fn login_with_secret(&mut self, secret: &str) -> Result<pb::LoginResponse, ClientCoreError> {
		self.login(pb::Login {
			secret: secret.to_string(),
			token: String::new(),
			client_version: self.client_version.clone(),
		})
		.await
	}

	/// Reconnect with a token issued by a previous login.
	pub async fn login_with_token(&mut self, token: &str) -> Result<pb::LoginResponse, ClientCoreError> {
		self.login(pb::Login {
			secret: String::new(),
			token: token.to_string(),
			client_version: self.client_version.clone(),
		})
		.await
	}

	async fn login(&mut self, login: pb::Login) -> Result<pb::LoginResponse, ClientCoreError> {
		let resp = self.request(pb::envelope::Msg::Login(login)).await?;
		match resp {
			pb::envelope::Msg::LoginResponse(r) => {
				if r.code != pb::ResponseCode::Success as i32 {
					return Err(ClientCoreError::LoginRejected(
						pb::ResponseCode::try_from(r.code).unwrap_or(pb::ResponseCode::Unknown),
					));
				}
				debug!(friend_code = %r.friend_code, friends = r.friends.len(), "login accepted");
				Ok(r)
			}
			other => Err(ClientCoreError::Protocol(format!("expected LoginResponse, got {other:?}"))),
		}
	}

	/// Send a keepalive ping and await the pong response.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<pb::Pong, ClientCoreError> {
		let resp = self
			.request(pb::envelope::Msg::Ping(pb::Ping { client_time_unix_ms }))
			.await?;
		match resp {
			pb::envelope::Msg::Pong(p) => Ok(p),
			other => Err(ClientCoreError::Protocol(format!("expected Pong, got {other:?}"))),
		}
	}

	/// Fan an action out to one or more friends.
	pub async fn send_action(&mut self, action: pb::ActionRequest) -> Result<pb::ActionResponse, ClientCoreError> {
		let resp = self.request(pb::envelope::Msg::ActionRequest(action)).await?;
		match resp {
			pb::envelope::Msg::ActionResponse(r) => Ok(r),
			other => Err(ClientCoreError::Protocol(format!("expected ActionResponse, got {other:?}"))),
		}
	}

	/// Ask to possess a friend. Blocks until the friend answered, the
	/// server timed the confirmation out, or the request was rejected.
	pub async fn possession_begin(
		&mut self,
		target_friend_code: &str,
		move_mode: pb::MoveMode,
	) -> Result<pb::PossessionBeginResponse, ClientCoreError> {
		let req = pb::PossessionBeginRequest {
			target_friend_code: target_friend_code.to_string(),
			move_mode: move_mode as i32,
		};
		let resp = self.request(pb::envelope::Msg::PossessionBeginRequest(req)).await?;
		match resp {
			pb::envelope::Msg::PossessionBeginResponse(r) => Ok(r),
			other => Err(ClientCoreError::Protocol(format!(
				"expected PossessionBeginResponse, got {other:?}"
			))),
		}
	}

	/// End the caller's active possession session, in either role.
	pub async fn possession_end(&mut self) -> Result<pb::PossessionEndResponse, ClientCoreError> {
		let resp = self
			.request(pb::envelope::Msg::PossessionEndRequest(pb::PossessionEndRequest {}))
			.await?;
		match resp {
			pb::envelope::Msg::PossessionEndResponse(r) => Ok(r),
			other => Err(ClientCoreError::Protocol(format!(
				"expected PossessionEndResponse, got {other:?}"
			))),
		}
	}

	/// One-way movement sample; only meaningful with an active session.
	pub async fn send_movement(&mut self, sample: pb::MovementSample) -> Result<(), ClientCoreError> {
		self.send_one_way(pb::envelope::Msg::MovementSample(sample)).await
	}

	/// One-way camera sample; only meaningful with an active session.
	pub async fn send_camera(&mut self, sample: pb::CameraSample) -> Result<(), ClientCoreError> {
		self.send_one_way(pb::envelope::Msg::CameraSample(sample)).await
	}

	/// Answer a `PossessionBeginCommand` received on the command stream.
	pub async fn send_possession_ack(&mut self, ack: pb::PossessionBeginAck) -> Result<(), ClientCoreError> {
		self.send_one_way(pb::envelope::Msg::PossessionBeginAck(ack)).await
	}

	pub async fn add_friend(&mut self, friend_code: &str) -> Result<pb::AddFriendResponse, ClientCoreError> {
		let req = pb::AddFriendRequest {
			target_friend_code: friend_code.to_string(),
		};
		let resp = self.request(pb::envelope::Msg::AddFriendRequest(req)).await?;
		match resp {
			pb::envelope::Msg::AddFriendResponse(r) => Ok(r),
			other => Err(ClientCoreError::Protocol(format!("expected AddFriendResponse, got {other:?}"))),
		}
	}

	pub async fn remove_friend(&mut self, friend_code: &str) -> Result<pb::RemoveFriendResponse, ClientCoreError> {
		let req = pb::RemoveFriendRequest {
			target_friend_code: friend_code.to_string(),
		};
		let resp = self.request(pb::envelope::Msg::RemoveFriendRequest(req)).await?;
		match resp {
			pb::envelope::Msg::RemoveFriendResponse(r) => Ok(r),
			other => Err(ClientCoreError::Protocol(format!(
				"expected RemoveFriendResponse, got {other:?}"
			))),
		}
	}

	/// Replace the grant the caller extends to `friend_code`.
	pub async fn update_friend_permissions(
		&mut self,
		friend_code: &str,
		permissions: UserPermissions,
	) -> Result<pb::UpdateFriendPermissionsResponse, ClientCoreError> {
		let req = pb::UpdateFriendPermissionsRequest {
			target_friend_code: friend_code.to_string(),
			permissions: Some(permissions.into()),
		};
		let resp = self.request(pb::envelope::Msg::UpdateFriendPermissionsRequest(req)).await?;
		match resp {
			pb::envelope::Msg::UpdateFriendPermissionsResponse(r) => Ok(r),
			other => Err(ClientCoreError::Protocol(format!(
				"expected UpdateFriendPermissionsResponse, got {other:?}"
			))),
		}
	}

	/// Open the server-push command stream after a successful login.
	pub async fn open_command_stream(&mut self) -> Result<SessionCommands, ClientCoreError> {
		if self.commands_opened {
			return Err(ClientCoreError::Protocol(
				"command stream already opened; reuse the existing SessionCommands".to_string(),
			));
		}

		debug!("open_command_stream(): opening command stream (client open_bi)");
		let (mut send, recv) = self
			.conn
			.open_bi()
			.await
			.map_err(|e| ClientCoreError::Io(format!("open_bi(commands) failed: {e}")))?;

		// Force a STREAM frame so the server observes the stream promptly.
		send.write_all(&[0u8])
			.await
			.map_err(|e| ClientCoreError::Io(format!("failed to write command stream activation byte: {e}")))?;
		send.flush()
			.await
			.map_err(|e| ClientCoreError::Io(format!("failed to flush command stream activation byte: {e}")))?;

		self.commands_opened = true;

		Ok(SessionCommands {
			commands_recv: recv,
			_commands_send_keepalive: send,
			max_frame_bytes: self.max_frame_bytes,
		})
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	/// Send one request and wait for the response carrying its request id.
	async fn request(&mut self, msg: pb::envelope::Msg) -> Result<pb::envelope::Msg, ClientCoreError> {
		let request_id = Uuid::new_v4().to_string();
		let env = pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: request_id.clone(),
			msg: Some(msg),
		};
		write_envelope(&mut self.control_send, &env, self.max_frame_bytes).await?;

		loop {
			let resp = read_one_envelope(&mut self.control_recv, self.max_frame_bytes).await?;
			if resp.request_id != request_id {
				warn!(
					request_id = %resp.request_id,
					expected = %request_id,
					"dropping response for a different request"
				);
				continue;
			}
			let Some(msg) = resp.msg else {
				return Err(ClientCoreError::Protocol("response envelope carried no message".to_string()));
			};
			return Ok(msg);
		}
	}

	async fn send_one_way(&mut self, msg: pb::envelope::Msg) -> Result<(), ClientCoreError> {
		let env = pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Some(msg),
		};
		write_envelope(&mut self.control_send, &env, self.max_frame_bytes).await
	}
}

impl SessionCommands {
	/// Run the command loop until EOF or error. The callback sees every
	/// server-pushed command; requests/responses never travel here.
	pub async fn run_command_loop<F>(&mut self, mut on_command: F) -> Result<(), ClientCoreError>
	where
		F: FnMut(pb::envelope::Msg),
	{
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match self.commands_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					info!("command stream closed");
					return Ok(());
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			};

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, self.max_frame_bytes) {
					Ok(Some(env)) => {
						let Some(msg) = env.msg else { continue };
						match &msg {
							pb::envelope::Msg::ActionCommand(_)
							| pb::envelope::Msg::PossessionBeginCommand(_)
							| pb::envelope::Msg::PossessionEndedCommand(_)
							| pb::envelope::Msg::MovementCommand(_)
							| pb::envelope::Msg::CameraCommand(_)
							| pb::envelope::Msg::FriendStatusCommand(_) => {
								debug!(command_kind = command_kind(&msg), "command stream decoded");
								on_command(msg)
							}
							other => warn!("unexpected message on command stream: {other:?}"),
						}
					}
					Ok(None) => break,
					Err(e) => return Err(ClientCoreError::Framing(e)),
				}
			}
		}
	}
}

async fn write_envelope(
	send: &mut quinn::SendStream,
	env: &pb::Envelope,
	max_frame_bytes: usize,
) -> Result<(), ClientCoreError> {
	let frame = encode_frame(env, max_frame_bytes).map_err(ClientCoreError::Framing)?;
	send.write_all(&frame).await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	send.flush().await.map_err(|e| ClientCoreError::Io(e.to_string()))?;
	Ok(())
}

fn command_kind(msg: &pb::envelope::Msg) -> &'static str {
	match msg {
		pb::envelope::Msg::ActionCommand(_) => "action",
		pb::envelope::Msg::PossessionBeginCommand(_) => "possession_begin",
		pb::envelope::Msg::PossessionEndedCommand(_) => "possession_ended",
		pb::envelope::Msg::MovementCommand(_) => "movement",
		pb::envelope::Msg::CameraCommand(_) => "camera",
		pb::envelope::Msg::FriendStatusCommand(_) => "friend_status",
		_ => "other",
	}
}

async fn read_one_envelope(recv: &mut quinn::RecvStream, max_frame_bytes: usize) -> Result<pb::Envelope, ClientCoreError> {
	let mut buf = BytesMut::with_capacity(8 * 1024);
	let mut tmp = [0u8; 8192];

	loop {
		// Try decoding first in case buffer already has a full frame.
		match try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, max_frame_bytes) {
			Ok(Some(env)) => return Ok(env),
			Ok(None) => {}
			Err(e) => return Err(ClientCoreError::Framing(e)),
		}

		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => {
				return Err(ClientCoreError::Protocol(
					"stream closed before receiving full message".to_string(),
				));
			}
			Err(e) => return Err(ClientCoreError::Io(e.to_string())),
		};

		buf.extend_from_slice(&tmp[..n]);
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr: SocketAddr = "0.0.0.0:0".parse().context("parse wildcard addr")?;
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<QuinnClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	// Allow multiple streams (control + commands at minimum).
	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(64));
	transport.max_concurrent_uni_streams(VarInt::from_u32(64));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn from_quic_endpoint_clears_the_addr_override() {
		let cfg = ClientConfig::from_quic_endpoint("quic://relay.example.com:443").expect("endpoint");
		assert_eq!(cfg.server_host, "relay.example.com");
		assert_eq!(cfg.server_port, 443);
		assert!(cfg.server_addr.is_none());
	}
}
