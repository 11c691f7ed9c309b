#![forbid(unsafe_code)]

//! Wire protocol message types (`marionette.v1`).
//!
//! Every frame on either stream is an [`Envelope`]. Responses echo the
//! request's `request_id`; one-way messages leave it empty.

use marionette_domain::UserPermissions;

/// Stable response taxonomy shared by every response message.
///
/// Each code maps to exactly one condition; no code is reused to mean two
/// different things within one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResponseCode {
	Unknown = 0,
	Success = 1,
	BadDataInRequest = 2,
	Unauthorized = 3,
	AlreadyLoggedIn = 4,
	TooManyRequests = 5,
	TargetNotFriends = 6,
	TargetOffline = 7,
	TargetHasNotGrantedSenderPermissions = 8,
	SenderAlreadyInSession = 9,
	TargetAlreadyInSession = 10,
	SenderNotInSession = 11,
	SessionMismatch = 12,
	Timeout = 13,
	TargetNotFound = 14,
}

/// The possession target's local decision, relayed back to the sender.
///
/// `Uninitialized` means the confirmation request never reached the target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum BeginResult {
	Uninitialized = 0,
	Accepted = 1,
	SafeMode = 2,
	FeaturePaused = 3,
	LackingPermissions = 4,
	AlreadyBeingPossessedOrPossessing = 5,
	BadData = 6,
}

/// Movement interpretation requested for a possession session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MoveMode {
	MoveModeUnspecified = 0,
	Walk = 1,
	Run = 2,
}

/// Why a possession session ended without the recipient asking for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SessionEndReason {
	EndReasonUnspecified = 0,
	/// The counterpart ended the session voluntarily.
	Voluntary = 1,
	/// The counterpart's connection unregistered; forced teardown.
	Disconnected = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,

	/// Correlates a response with its request; empty on one-way messages.
	#[prost(string, tag = "2")]
	pub request_id: String,

	#[prost(
		oneof = "envelope::Msg",
		tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34"
	)]
	pub msg: Option<envelope::Msg>,
}

pub mod envelope {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Login(super::Login),
		#[prost(message, tag = "11")]
		LoginResponse(super::LoginResponse),
		#[prost(message, tag = "12")]
		Ping(super::Ping),
		#[prost(message, tag = "13")]
		Pong(super::Pong),

		#[prost(message, tag = "14")]
		ActionRequest(super::ActionRequest),
		#[prost(message, tag = "15")]
		ActionResponse(super::ActionResponse),
		#[prost(message, tag = "16")]
		ActionCommand(super::ActionCommand),

		#[prost(message, tag = "17")]
		PossessionBeginRequest(super::PossessionBeginRequest),
		#[prost(message, tag = "18")]
		PossessionBeginResponse(super::PossessionBeginResponse),
		#[prost(message, tag = "19")]
		PossessionEndRequest(super::PossessionEndRequest),
		#[prost(message, tag = "20")]
		PossessionEndResponse(super::PossessionEndResponse),
		#[prost(message, tag = "21")]
		MovementSample(super::MovementSample),
		#[prost(message, tag = "22")]
		CameraSample(super::CameraSample),
		#[prost(message, tag = "23")]
		PossessionBeginCommand(super::PossessionBeginCommand),
		#[prost(message, tag = "24")]
		PossessionBeginAck(super::PossessionBeginAck),
		#[prost(message, tag = "25")]
		PossessionEndedCommand(super::PossessionEndedCommand),
		#[prost(message, tag = "26")]
		MovementCommand(super::MovementCommand),
		#[prost(message, tag = "27")]
		CameraCommand(super::CameraCommand),

		#[prost(message, tag = "28")]
		AddFriendRequest(super::AddFriendRequest),
		#[prost(message, tag = "29")]
		AddFriendResponse(super::AddFriendResponse),
		#[prost(message, tag = "30")]
		RemoveFriendRequest(super::RemoveFriendRequest),
		#[prost(message, tag = "31")]
		RemoveFriendResponse(super::RemoveFriendResponse),
		#[prost(message, tag = "32")]
		UpdateFriendPermissionsRequest(super::UpdateFriendPermissionsRequest),
		#[prost(message, tag = "33")]
		UpdateFriendPermissionsResponse(super::UpdateFriendPermissionsResponse),
		#[prost(message, tag = "34")]
		FriendStatusCommand(super::FriendStatusCommand),
	}
}

/// First message on every connection. Carries either a secret or a
/// previously issued, unexpired token.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Login {
	#[prost(string, tag = "1")]
	pub secret: String,

	#[prost(string, tag = "2")]
	pub token: String,

	#[prost(string, tag = "3")]
	pub client_version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginResponse {
	#[prost(enumeration = "ResponseCode", tag = "1")]
	pub code: i32,

	#[prost(string, tag = "2")]
	pub friend_code: String,

	/// Bearer token for reconnects; empty on failure.
	#[prost(string, tag = "3")]
	pub token: String,

	/// Snapshot of the caller's friend list so clients need no bootstrap query.
	#[prost(message, repeated, tag = "4")]
	pub friends: Vec<FriendEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FriendEntry {
	#[prost(string, tag = "1")]
	pub friend_code: String,

	#[prost(bool, tag = "2")]
	pub online: bool,

	/// The grant the list owner extends to this friend.
	#[prost(message, optional, tag = "3")]
	pub permissions: Option<Permissions>,
}

/// Wire form of a capability grant: one bitset per class.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Permissions {
	#[prost(uint64, tag = "1")]
	pub primary: u64,

	#[prost(uint64, tag = "2")]
	pub speak: u64,

	#[prost(uint64, tag = "3")]
	pub elevated: u64,
}

impl From<UserPermissions> for Permissions {
	fn from(p: UserPermissions) -> Self {
		Self {
			primary: p.primary.bits(),
			speak: p.speak.bits(),
			elevated: p.elevated.bits(),
		}
	}
}

impl From<Permissions> for UserPermissions {
	fn from(p: Permissions) -> Self {
		UserPermissions::from_bits(p.primary, p.speak, p.elevated)
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,

	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

/// Shared action payload oneof, used by both [`ActionRequest`] and the
/// per-target [`ActionCommand`] so the dispatcher never hand-copies fields.
pub mod action {
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Payload {
		#[prost(message, tag = "10")]
		Emote(super::EmotePayload),
		#[prost(message, tag = "11")]
		Speak(super::SpeakPayload),
		#[prost(message, tag = "12")]
		Transform(super::TransformPayload),
		#[prost(message, tag = "13")]
		BodySwap(super::BodySwapPayload),
		#[prost(message, tag = "14")]
		Twinning(super::TwinningPayload),
		#[prost(message, tag = "15")]
		Customize(super::CustomizePayload),
		#[prost(message, tag = "16")]
		Moodles(super::MoodlesPayload),
		#[prost(message, tag = "17")]
		Honorific(super::HonorificPayload),
		#[prost(message, tag = "18")]
		Hypnosis(super::HypnosisPayload),
		#[prost(message, tag = "19")]
		HypnosisStop(super::HypnosisStopPayload),
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionRequest {
	/// Ordered list of distinct targets, 1..=max_targets.
	#[prost(string, repeated, tag = "1")]
	pub target_friend_codes: Vec<String>,

	#[prost(oneof = "action::Payload", tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19")]
	pub payload: Option<action::Payload>,
}

/// The request re-addressed to a single target. This is what is forwarded,
/// never the original request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionCommand {
	#[prost(string, tag = "1")]
	pub sender_friend_code: String,

	#[prost(oneof = "action::Payload", tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19")]
	pub payload: Option<action::Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionResponse {
	#[prost(enumeration = "ResponseCode", tag = "1")]
	pub code: i32,

	/// Exactly one entry per originally requested target; empty only when the
	/// request was rejected before per-target work started.
	#[prost(message, repeated, tag = "2")]
	pub results: Vec<TargetResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TargetResult {
	#[prost(string, tag = "1")]
	pub friend_code: String,

	#[prost(enumeration = "ResponseCode", tag = "2")]
	pub code: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EmotePayload {
	#[prost(string, tag = "1")]
	pub emote: String,

	#[prost(bool, tag = "2")]
	pub display_log_message: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpeakPayload {
	/// Bit index into the speak channel class.
	#[prost(uint32, tag = "1")]
	pub channel: u32,

	#[prost(string, tag = "2")]
	pub message: String,

	/// Channel argument: tell recipient or linkshell number, empty otherwise.
	#[prost(string, tag = "3")]
	pub extra: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransformPayload {
	#[prost(string, tag = "1")]
	pub glamourer_data: String,

	#[prost(bool, tag = "2")]
	pub apply_customization: bool,

	#[prost(bool, tag = "3")]
	pub apply_equipment: bool,

	#[prost(bool, tag = "4")]
	pub permanent: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BodySwapPayload {
	#[prost(string, tag = "1")]
	pub character_data: String,

	#[prost(bool, tag = "2")]
	pub swap_mods: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TwinningPayload {
	#[prost(string, tag = "1")]
	pub character_data: String,

	#[prost(bool, tag = "2")]
	pub swap_mods: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CustomizePayload {
	#[prost(string, tag = "1")]
	pub customize_data: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MoodlesPayload {
	#[prost(string, tag = "1")]
	pub moodle_data: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HonorificPayload {
	#[prost(string, tag = "1")]
	pub honorific_data: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HypnosisPayload {
	#[prost(string, tag = "1")]
	pub spiral_data: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct HypnosisStopPayload {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PossessionBeginRequest {
	#[prost(string, tag = "1")]
	pub target_friend_code: String,

	#[prost(enumeration = "MoveMode", tag = "2")]
	pub move_mode: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PossessionBeginResponse {
	/// Server-observed outcome; `Success` means the target answered.
	#[prost(enumeration = "ResponseCode", tag = "1")]
	pub code: i32,

	/// Target-local decision; the session is active only on `Accepted`.
	#[prost(enumeration = "BeginResult", tag = "2")]
	pub result: i32,

	#[prost(string, tag = "3")]
	pub target_name: String,

	#[prost(string, tag = "4")]
	pub target_world: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PossessionEndRequest {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PossessionEndResponse {
	#[prost(enumeration = "ResponseCode", tag = "1")]
	pub code: i32,
}

/// One-way possessor -> server movement sample.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct MovementSample {
	#[prost(float, tag = "1")]
	pub horizontal: f32,

	#[prost(float, tag = "2")]
	pub vertical: f32,

	#[prost(float, tag = "3")]
	pub turn: f32,

	#[prost(bool, tag = "4")]
	pub backward: bool,
}

/// One-way possessor -> server camera sample.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CameraSample {
	#[prost(float, tag = "1")]
	pub zoom: f32,

	#[prost(float, tag = "2")]
	pub x: f32,

	#[prost(float, tag = "3")]
	pub y: f32,

	#[prost(float, tag = "4")]
	pub z: f32,
}

/// Server -> target confirmation request for a pending possession session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PossessionBeginCommand {
	/// Tags the pending session so stale acks are detectable.
	#[prost(string, tag = "1")]
	pub session_id: String,

	#[prost(string, tag = "2")]
	pub possessor_friend_code: String,

	#[prost(enumeration = "MoveMode", tag = "3")]
	pub move_mode: i32,
}

/// Target -> server decision, echoing the session id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PossessionBeginAck {
	#[prost(string, tag = "1")]
	pub session_id: String,

	#[prost(enumeration = "BeginResult", tag = "2")]
	pub result: i32,

	/// Character name shown to the possessor; set on acceptance.
	#[prost(string, tag = "3")]
	pub character_name: String,

	#[prost(string, tag = "4")]
	pub home_world: String,
}

/// Server -> party notification that a session is gone.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PossessionEndedCommand {
	#[prost(string, tag = "1")]
	pub session_id: String,

	#[prost(enumeration = "SessionEndReason", tag = "2")]
	pub reason: i32,

	#[prost(string, tag = "3")]
	pub counterpart_friend_code: String,
}

/// Server -> ghost movement relay.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MovementCommand {
	#[prost(string, tag = "1")]
	pub session_id: String,

	#[prost(message, optional, tag = "2")]
	pub sample: Option<MovementSample>,
}

/// Server -> ghost camera relay.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CameraCommand {
	#[prost(string, tag = "1")]
	pub session_id: String,

	#[prost(message, optional, tag = "2")]
	pub sample: Option<CameraSample>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddFriendRequest {
	#[prost(string, tag = "1")]
	pub target_friend_code: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddFriendResponse {
	#[prost(enumeration = "ResponseCode", tag = "1")]
	pub code: i32,

	/// True only when the pair is mutual and the target is online.
	#[prost(bool, tag = "2")]
	pub online: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveFriendRequest {
	#[prost(string, tag = "1")]
	pub target_friend_code: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RemoveFriendResponse {
	#[prost(enumeration = "ResponseCode", tag = "1")]
	pub code: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateFriendPermissionsRequest {
	#[prost(string, tag = "1")]
	pub target_friend_code: String,

	#[prost(message, optional, tag = "2")]
	pub permissions: Option<Permissions>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct UpdateFriendPermissionsResponse {
	#[prost(enumeration = "ResponseCode", tag = "1")]
	pub code: i32,
}

/// Server -> client notification: a mutual friend's online flag changed, or
/// the grant toward the recipient changed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FriendStatusCommand {
	#[prost(string, tag = "1")]
	pub friend_code: String,

	#[prost(bool, tag = "2")]
	pub online: bool,

	/// Present when the grant toward the recipient changed.
	#[prost(message, optional, tag = "3")]
	pub permissions: Option<Permissions>,
}
