#![forbid(unsafe_code)]

use std::net::SocketAddr;

use marionette_client_core::{ClientConfig, SessionControl};
use marionette_protocol::pb;
use marionette_util::time::unix_ms_now;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: marionette_client --secret <secret> [--connect quic://host:port] [--addr ip:port] [--sni name] [--emote name --target code]\n\
\n\
Options:\n\
	--connect   Server endpoint (default: quic://127.0.0.1:18520)\n\
	            Format: quic://host:port\n\
	--addr      Server SocketAddr (overrides DNS resolution from --connect)\n\
	--sni       TLS server name/SNI (overrides the host from --connect)\n\
	--secret    Account secret for login (or MARIONETTE_CLIENT_SECRET)\n\
	--emote     Emote to send after login (requires --target)\n\
	--target    Friend code to send the emote to (repeatable)\n\
	--help      Show this help\n\
\n\
Notes:\n\
	Server-pushed commands arrive over a second bidirectional QUIC stream.\n\
\n\
Examples:\n\
	marionette_client --connect quic://127.0.0.1:18520 --secret hunter2\n\
	marionette_client --secret hunter2 --emote wave --target AAAA-0001\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,marionette_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	addr: SocketAddr,
	sni: String,
	secret: String,
	emote: Option<String>,
	targets: Vec<String>,
}

fn parse_args() -> Args {
	let mut endpoint = "quic://127.0.0.1:18520".to_string();

	let mut addr_override: Option<SocketAddr> = None;
	let mut sni_override: Option<String> = None;
	let mut secret: Option<String> = None;
	let mut emote: Option<String> = None;
	let mut targets: Vec<String> = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--addr" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let parsed: SocketAddr = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --addr value: {v}");
					usage_and_exit()
				});
				addr_override = Some(parsed);
			}
			"--sni" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--sni must be non-empty");
					usage_and_exit();
				}
				sni_override = Some(v);
			}
			"--secret" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--secret must be non-empty");
					usage_and_exit();
				}
				secret = Some(v);
			}
			"--emote" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--emote must be non-empty");
					usage_and_exit();
				}
				emote = Some(v);
			}
			"--target" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--target must be non-empty");
					usage_and_exit();
				}
				targets.push(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let (host, port) = ClientConfig::parse_quic_endpoint(&endpoint).unwrap_or_else(|e| {
		eprintln!("Invalid --endpoint value: {endpoint}\n{e}");
		usage_and_exit();
	});

	let secret = secret
		.or_else(|| {
			std::env::var("MARIONETTE_CLIENT_SECRET").ok().and_then(|v| {
				let v = v.trim().to_string();
				(!v.is_empty()).then_some(v)
			})
		})
		.unwrap_or_else(|| {
			eprintln!("Missing --secret (or MARIONETTE_CLIENT_SECRET)");
			usage_and_exit();
		});

	if emote.is_some() && targets.is_empty() {
		eprintln!("--emote requires at least one --target");
		usage_and_exit();
	}

	let addr: SocketAddr = addr_override.unwrap_or_else(|| {
		// Placeholder when host isn't an IP literal; DNS resolves during connect.
		let ip_try: Result<SocketAddr, _> = format!("{host}:{port}").parse();
		ip_try.unwrap_or_else(|_| "0.0.0.0:0".parse().expect("valid placeholder addr"))
	});

	let sni: String = sni_override.unwrap_or(host);

	Args {
		addr,
		sni,
		secret,
		emote,
		targets,
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let cfg = ClientConfig {
		server_host: args.sni.clone(),
		server_port: args.addr.port(),
		server_addr: if args.addr.ip().is_unspecified() && args.addr.port() == 0 {
			None
		} else {
			Some(args.addr)
		},
		..ClientConfig::default()
	};

	let resolved = cfg.server_addr.map(|a| a.to_string()).unwrap_or_else(|| "<dns>".to_string());
	info!(server = %resolved, sni = %cfg.server_host, "connecting");

	let mut control = SessionControl::connect(cfg).await?;
	let login = control.login_with_secret(&args.secret).await?;
	info!(friend_code = %login.friend_code, friends = login.friends.len(), "logged in");

	for friend in &login.friends {
		let status = if friend.online { "online" } else { "offline" };
		println!("friend {} ({status})", friend.friend_code);
	}

	let pong = control.ping(unix_ms_now()).await?;
	info!(server_time_unix_ms = pong.server_time_unix_ms, "pong");

	if let Some(emote) = args.emote {
		let resp = control
			.send_action(pb::ActionRequest {
				target_friend_codes: args.targets.clone(),
				payload: Some(pb::action::Payload::Emote(pb::EmotePayload {
					emote,
					display_log_message: true,
				})),
			})
			.await?;
		for result in &resp.results {
			println!(
				"emote -> {}: {:?}",
				result.friend_code,
				pb::ResponseCode::try_from(result.code).unwrap_or(pb::ResponseCode::Unknown)
			);
		}
	}

	info!("opening command stream and entering command loop");
	let mut commands = control.open_command_stream().await?;

	commands
		.run_command_loop(|msg| match msg {
			pb::envelope::Msg::ActionCommand(cmd) => {
				println!("action from {}: {:?}", cmd.sender_friend_code, cmd.payload);
			}
			pb::envelope::Msg::FriendStatusCommand(cmd) => {
				let status = if cmd.online { "online" } else { "offline" };
				println!("friend {} is now {status}", cmd.friend_code);
			}
			pb::envelope::Msg::PossessionBeginCommand(cmd) => {
				warn!(
					possessor = %cmd.possessor_friend_code,
					session_id = %cmd.session_id,
					"possession request received; this demo client cannot accept"
				);
			}
			other => {
				println!("command: {other:?}");
			}
		})
		.await?;

	Ok(())
}
