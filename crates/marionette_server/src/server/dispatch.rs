#![forbid(unsafe_code)]

use std::collections::HashSet;

use futures::future::join_all;
use marionette_domain::{ActionKind, ActionOptions, FriendCode, SpeakChannel, UserPermissions, required_permissions};
use marionette_protocol::pb;
use marionette_protocol::version::PROTOCOL_VERSION_U32;
use metrics::counter;
use tracing::warn;

use crate::server::ServerContext;

/// Upper bound on chat message bytes relayed through Speak actions.
pub const MAX_CHAT_MESSAGE_BYTES: usize = 500;

/// Upper bound on emote name bytes.
pub const MAX_EMOTE_NAME_BYTES: usize = 64;

/// Upper bound on opaque appearance/state blobs carried by an action.
pub const MAX_DATA_BLOB_BYTES: usize = 128 * 1024;

pub fn action_kind(payload: &pb::action::Payload) -> ActionKind {
	match payload {
		pb::action::Payload::Emote(_) => ActionKind::Emote,
		pb::action::Payload::Speak(_) => ActionKind::Speak,
		pb::action::Payload::Transform(_) => ActionKind::Transform,
		pb::action::Payload::BodySwap(_) => ActionKind::BodySwap,
		pb::action::Payload::Twinning(_) => ActionKind::Twinning,
		pb::action::Payload::Customize(_) => ActionKind::Customize,
		pb::action::Payload::Moodles(_) => ActionKind::Moodles,
		pb::action::Payload::Honorific(_) => ActionKind::Honorific,
		pb::action::Payload::Hypnosis(_) => ActionKind::Hypnosis,
		pb::action::Payload::HypnosisStop(_) => ActionKind::HypnosisStop,
	}
}

/// Extract the option flags that widen an action's required grant.
/// Fails only when a Speak payload names a channel outside the class.
pub fn action_options(payload: &pb::action::Payload) -> Result<ActionOptions, &'static str> {
	let mut opts = ActionOptions::default();
	match payload {
		pb::action::Payload::Speak(speak) => {
			let Some(channel) = SpeakChannel::from_index(speak.channel) else {
				return Err("unknown speak channel");
			};
			opts.channel = Some(channel);
		}
		pb::action::Payload::Transform(t) => {
			opts.apply_customization = t.apply_customization;
			opts.apply_equipment = t.apply_equipment;
			opts.permanent = t.permanent;
		}
		pb::action::Payload::BodySwap(b) => {
			opts.swap_mods = b.swap_mods;
		}
		pb::action::Payload::Twinning(t) => {
			opts.swap_mods = t.swap_mods;
		}
		_ => {}
	}
	Ok(opts)
}

/// Structural payload checks that hold regardless of sender or target.
pub fn validate_payload(payload: &pb::action::Payload) -> Result<(), &'static str> {
	match payload {
		pb::action::Payload::Emote(e) => {
			if e.emote.trim().is_empty() {
				return Err("empty emote name");
			}
			if e.emote.len() > MAX_EMOTE_NAME_BYTES {
				return Err("emote name too long");
			}
		}
		pb::action::Payload::Speak(s) => {
			if s.message.trim().is_empty() {
				return Err("empty message");
			}
			if s.message.len() > MAX_CHAT_MESSAGE_BYTES {
				return Err("message too long");
			}
		}
		pb::action::Payload::Transform(t) => {
			if t.glamourer_data.is_empty() {
				return Err("missing appearance data");
			}
			if t.glamourer_data.len() > MAX_DATA_BLOB_BYTES {
				return Err("appearance data too large");
			}
		}
		pb::action::Payload::BodySwap(b) => {
			if b.character_data.is_empty() {
				return Err("missing character data");
			}
			if b.character_data.len() > MAX_DATA_BLOB_BYTES {
				return Err("character data too large");
			}
		}
		pb::action::Payload::Twinning(t) => {
			if t.character_data.is_empty() {
				return Err("missing character data");
			}
			if t.character_data.len() > MAX_DATA_BLOB_BYTES {
				return Err("character data too large");
			}
		}
		pb::action::Payload::Customize(c) => {
			if c.customize_data.len() > MAX_DATA_BLOB_BYTES {
				return Err("customize data too large");
			}
		}
		pb::action::Payload::Moodles(m) => {
			if m.moodle_data.len() > MAX_DATA_BLOB_BYTES {
				return Err("moodle data too large");
			}
		}
		pb::action::Payload::Honorific(h) => {
			if h.honorific_data.len() > MAX_DATA_BLOB_BYTES {
				return Err("honorific data too large");
			}
		}
		pb::action::Payload::Hypnosis(h) => {
			if h.spiral_data.is_empty() {
				return Err("missing spiral data");
			}
			if h.spiral_data.len() > MAX_DATA_BLOB_BYTES {
				return Err("spiral data too large");
			}
		}
		pb::action::Payload::HypnosisStop(_) => {}
	}
	Ok(())
}

fn rejected(code: pb::ResponseCode) -> pb::ActionResponse {
	pb::ActionResponse {
		code: code as i32,
		results: Vec::new(),
	}
}

/// Collapse the per-target outcomes into the top-level response code:
/// any success wins, a unanimous failure is reported as itself, and a
/// mixed bag of failures degrades to `Unknown`.
fn aggregate(results: &[pb::TargetResult]) -> pb::ResponseCode {
	if results.iter().any(|r| r.code == pb::ResponseCode::Success as i32) {
		return pb::ResponseCode::Success;
	}

	let Some(first) = results.first() else {
		return pb::ResponseCode::Unknown;
	};

	if results.iter().all(|r| r.code == first.code) {
		pb::ResponseCode::try_from(first.code).unwrap_or(pb::ResponseCode::Unknown)
	} else {
		pb::ResponseCode::Unknown
	}
}

/// Validate, rate-limit and fan an action out to every named target.
///
/// Structural and rate failures return an empty per-target map; once
/// per-target work starts the response carries one entry per requested
/// target, in request order.
pub async fn dispatch_action(
	ctx: &ServerContext,
	sender: &FriendCode,
	req: pb::ActionRequest,
	max_targets: usize,
) -> pb::ActionResponse {
	let Some(payload) = req.payload else {
		counter!("marionette_server_actions_bad_data_total").increment(1);
		return rejected(pb::ResponseCode::BadDataInRequest);
	};

	if req.target_friend_codes.is_empty() || req.target_friend_codes.len() > max_targets {
		counter!("marionette_server_actions_bad_data_total").increment(1);
		return rejected(pb::ResponseCode::BadDataInRequest);
	}

	let mut targets = Vec::with_capacity(req.target_friend_codes.len());
	let mut seen = HashSet::new();
	for raw in &req.target_friend_codes {
		let Ok(target) = raw.parse::<FriendCode>() else {
			counter!("marionette_server_actions_bad_data_total").increment(1);
			return rejected(pb::ResponseCode::BadDataInRequest);
		};
		if target == *sender || !seen.insert(target.clone()) {
			counter!("marionette_server_actions_bad_data_total").increment(1);
			return rejected(pb::ResponseCode::BadDataInRequest);
		}
		targets.push(target);
	}

	if let Err(reason) = validate_payload(&payload) {
		warn!(sender = %sender, reason, "rejecting malformed action payload");
		counter!("marionette_server_actions_bad_data_total").increment(1);
		return rejected(pb::ResponseCode::BadDataInRequest);
	}

	let kind = action_kind(&payload);
	let opts = match action_options(&payload) {
		Ok(opts) => opts,
		Err(reason) => {
			warn!(sender = %sender, reason, "rejecting action with invalid options");
			counter!("marionette_server_actions_bad_data_total").increment(1);
			return rejected(pb::ResponseCode::BadDataInRequest);
		}
	};

	if !ctx.rate.allow(sender).await {
		counter!("marionette_server_actions_rate_limited_total").increment(1);
		return rejected(pb::ResponseCode::TooManyRequests);
	}

	let required = required_permissions(kind, &opts);

	let results = join_all(
		targets
			.iter()
			.map(|target| forward_to_target(ctx, sender, target, &payload, &required)),
	)
	.await;

	counter!("marionette_server_actions_total").increment(1);
	counter!("marionette_server_action_targets_total").increment(results.len() as u64);

	if let Err(e) = ctx.audit.record_action(sender.as_str(), kind.as_str(), results.len()).await {
		counter!("marionette_server_audit_failures_total").increment(1);
		warn!(sender = %sender, error = %e, "failed to persist action audit");
	}

	pb::ActionResponse {
		code: aggregate(&results) as i32,
		results,
	}
}

async fn forward_to_target(
	ctx: &ServerContext,
	sender: &FriendCode,
	target: &FriendCode,
	payload: &pb::action::Payload,
	required: &UserPermissions,
) -> pb::TargetResult {
	let code = resolve_and_send(ctx, sender, target, payload, required).await;
	pb::TargetResult {
		friend_code: target.to_string(),
		code: code as i32,
	}
}

async fn resolve_and_send(
	ctx: &ServerContext,
	sender: &FriendCode,
	target: &FriendCode,
	payload: &pb::action::Payload,
	required: &UserPermissions,
) -> pb::ResponseCode {
	let grant = match ctx.accounts.resolve_grant(target, sender).await {
		Ok(grant) => grant,
		Err(e) => {
			warn!(sender = %sender, target = %target, error = %e, "grant lookup failed");
			return pb::ResponseCode::Unknown;
		}
	};

	let Some(grant) = grant else {
		return pb::ResponseCode::TargetNotFriends;
	};

	if !ctx.registry.is_online(target).await {
		return pb::ResponseCode::TargetOffline;
	}

	if !grant.covers(required) {
		return pb::ResponseCode::TargetHasNotGrantedSenderPermissions;
	}

	let command = pb::ActionCommand {
		sender_friend_code: sender.to_string(),
		payload: Some(payload.clone()),
	};

	let envelope = pb::Envelope {
		version: PROTOCOL_VERSION_U32,
		request_id: String::new(),
		msg: Some(pb::envelope::Msg::ActionCommand(command)),
	};

	// A full or just-closed command queue reads as the target having
	// dropped off, the same as losing the race with a disconnect.
	if ctx.registry.send(target, envelope).await {
		pb::ResponseCode::Success
	} else {
		pb::ResponseCode::TargetOffline
	}
}
