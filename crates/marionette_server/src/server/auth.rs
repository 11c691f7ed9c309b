#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use marionette_util::time::unix_secs_now;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Issue a stateless access token: `v1.<claims_b64>.<sig_b64>`.
pub fn issue_hmac_token(friend_code: &str, ttl: Duration, secret: &str) -> String {
	let claims = AuthClaims {
		sub: friend_code.to_string(),
		exp: unix_secs_now().saturating_add(ttl.as_secs()),
	};
	// Serializing a struct of a string and an integer cannot fail.
	let payload = serde_json::to_vec(&claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn issued_token_round_trips() {
		let token = issue_hmac_token("ABCD-1234", Duration::from_secs(60), "s3cret");
		let claims = verify_hmac_token(&token, "s3cret").expect("verify");
		assert_eq!(claims.sub, "ABCD-1234");
		assert!(claims.exp > unix_secs_now());
	}

	#[test]
	fn rejects_wrong_secret() {
		let token = issue_hmac_token("ABCD-1234", Duration::from_secs(60), "s3cret");
		assert!(verify_hmac_token(&token, "other").is_err());
	}

	#[test]
	fn rejects_expired_token() {
		let token = issue_hmac_token("ABCD-1234", Duration::from_secs(0), "s3cret");
		assert!(verify_hmac_token(&token, "s3cret").is_err());
	}

	#[test]
	fn rejects_tampered_payload() {
		let token = issue_hmac_token("ABCD-1234", Duration::from_secs(60), "s3cret");
		let mut parts = token.split('.').map(String::from).collect::<Vec<_>>();
		parts[1] = URL_SAFE_NO_PAD.encode(br#"{"sub":"EVIL-0000","exp":99999999999}"#);
		assert!(verify_hmac_token(&parts.join("."), "s3cret").is_err());
	}

	#[test]
	fn rejects_malformed_token() {
		assert!(verify_hmac_token("v2.a.b", "s3cret").is_err());
		assert!(verify_hmac_token("not-a-token", "s3cret").is_err());
	}
}
