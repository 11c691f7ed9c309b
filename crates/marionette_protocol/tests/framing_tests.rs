#![forbid(unsafe_code)]

use bytes::BytesMut;
use marionette_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use marionette_protocol::pb;
use proptest::prelude::*;

fn arb_payload() -> impl Strategy<Value = pb::action::Payload> {
	prop_oneof![
		("[a-z]{1,32}", any::<bool>()).prop_map(|(emote, display_log_message)| {
			pb::action::Payload::Emote(pb::EmotePayload {
				emote,
				display_log_message,
			})
		}),
		(0u32..26, ".{0,200}", "[a-z]{0,12}").prop_map(|(channel, message, extra)| {
			pb::action::Payload::Speak(pb::SpeakPayload { channel, message, extra })
		}),
		(".{1,512}", any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
			|(glamourer_data, apply_customization, apply_equipment, permanent)| {
				pb::action::Payload::Transform(pb::TransformPayload {
					glamourer_data,
					apply_customization,
					apply_equipment,
					permanent,
				})
			}
		),
	]
}

fn arb_envelope() -> impl Strategy<Value = pb::Envelope> {
	(any::<u32>(), "[a-z0-9-]{0,36}", proptest::option::of(arb_payload())).prop_map(|(version, request_id, payload)| {
		pb::Envelope {
			version,
			request_id,
			msg: Some(pb::envelope::Msg::ActionRequest(pb::ActionRequest {
				target_friend_codes: vec!["AAAA-0001".to_string()],
				payload,
			})),
		}
	})
}

proptest! {
	/// Concatenated frames split at arbitrary byte boundaries decode back
	/// to the original envelopes, in order.
	#[test]
	fn chunked_stream_decodes_in_order(
		envelopes in proptest::collection::vec(arb_envelope(), 1..8),
		chunk_size in 1usize..64,
	) {
		let mut stream = Vec::new();
		for env in &envelopes {
			stream.extend_from_slice(&encode_frame(env, DEFAULT_MAX_FRAME_SIZE).expect("encode"));
		}

		let mut buf = BytesMut::new();
		let mut decoded = Vec::new();

		for chunk in stream.chunks(chunk_size) {
			buf.extend_from_slice(chunk);
			while let Some(env) = try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
				decoded.push(env);
			}
		}

		prop_assert!(buf.is_empty());
		prop_assert_eq!(decoded, envelopes);
	}

	/// Arbitrary bytes never panic the decoder; a frame whose prefix
	/// exceeds the limit is always rejected.
	#[test]
	fn garbage_input_is_rejected_not_panicked(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
		let mut buf = BytesMut::from(&bytes[..]);
		// Small limit so random prefixes routinely exceed it.
		let max = 1024usize;

		match try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, max) {
			Ok(_) => {}
			Err(FramingError::FrameTooLarge { len, max: m }) => {
				prop_assert!(len > m);
			}
			Err(FramingError::Decode(_)) => {}
			Err(other) => prop_assert!(false, "unexpected error: {other:?}"),
		}
	}

	/// Encoding refuses payloads above the caller's limit instead of
	/// emitting a frame the peer would reject.
	#[test]
	fn oversized_payloads_fail_at_encode(padding in 1usize..64) {
		let env = pb::Envelope {
			version: 1,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::ActionRequest(pb::ActionRequest {
				target_friend_codes: vec!["A".repeat(128 + padding)],
				payload: None,
			})),
		};

		let max = 64usize;
		match encode_frame(&env, max) {
			Err(FramingError::FrameTooLarge { len, max: m }) => {
				prop_assert_eq!(m, max);
				prop_assert!(len > max);
			}
			other => prop_assert!(false, "expected FrameTooLarge, got {other:?}"),
		}
	}
}
