#![forbid(unsafe_code)]

pub mod framing;
pub mod pb;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, try_decode_frame_from_buffer};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;

	/// Value written into `pb::Envelope.version`.
	pub const PROTOCOL_VERSION_U32: u32 = PROTOCOL_MAJOR;

	/// ALPN identifier negotiated on every QUIC connection.
	pub const ALPN: &[u8] = b"marionette-v1";
}
