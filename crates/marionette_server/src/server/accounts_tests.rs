#![forbid(unsafe_code)]

use marionette_domain::{ElevatedCapability, FriendCode, PrimaryCapability, SpeakChannel, UserPermissions};

use crate::server::accounts::{AccountService, hash_secret};

fn code(s: &str) -> FriendCode {
	s.parse().expect("friend code")
}

#[test]
fn hash_secret_is_stable_hex() {
	let a = hash_secret("hunter2");
	let b = hash_secret("hunter2");
	assert_eq!(a, b);
	assert_eq!(a.len(), 64);
	assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
	assert_ne!(a, hash_secret("hunter3"));
}

#[tokio::test]
async fn secret_lookup_resolves_account() {
	let accounts = AccountService::in_memory();
	let alice = code("AAAA-0001");
	accounts.create_account(&alice, "alpha-secret").await.expect("create");

	let found = accounts
		.friend_code_for_secret_hash(&hash_secret("alpha-secret"))
		.await
		.expect("lookup");
	assert_eq!(found, Some(alice.clone()));

	let missing = accounts
		.friend_code_for_secret_hash(&hash_secret("wrong"))
		.await
		.expect("lookup");
	assert_eq!(missing, None);

	assert!(accounts.account_exists(&alice).await.expect("exists"));
	assert!(!accounts.account_exists(&code("ZZZZ-9999")).await.expect("exists"));
}

#[tokio::test]
async fn grants_are_directional() {
	let accounts = AccountService::in_memory();
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");

	let grant = UserPermissions::none().with_primary(PrimaryCapability::Emote);
	accounts.upsert_grant(&bob, &alice, grant).await.expect("upsert");

	// Bob granted Alice; the reverse edge does not exist.
	assert_eq!(accounts.resolve_grant(&bob, &alice).await.expect("resolve"), Some(grant));
	assert_eq!(accounts.resolve_grant(&alice, &bob).await.expect("resolve"), None);
	assert!(!accounts.are_mutual_friends(&alice, &bob).await.expect("mutual"));

	accounts
		.upsert_grant(&alice, &bob, UserPermissions::none())
		.await
		.expect("upsert");
	assert!(accounts.are_mutual_friends(&alice, &bob).await.expect("mutual"));
}

#[tokio::test]
async fn resolved_grants_carry_every_class() {
	let accounts = AccountService::in_memory();
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");

	let grant = UserPermissions::none()
		.with_primary(PrimaryCapability::Emote)
		.with_speak(SpeakChannel::Say);
	accounts.upsert_grant(&bob, &alice, grant).await.expect("upsert");

	let resolved = accounts.resolve_grant(&bob, &alice).await.expect("resolve").expect("grant");
	let emote = UserPermissions::none().with_primary(PrimaryCapability::Emote);
	assert!(resolved.covers(&emote));

	let possession = UserPermissions::none().with_elevated(ElevatedCapability::Possession);
	assert!(!resolved.covers(&possession));

	// No edge at all.
	assert_eq!(accounts.resolve_grant(&alice, &bob).await.expect("resolve"), None);
}

#[tokio::test]
async fn upsert_replaces_and_remove_reports_presence() {
	let accounts = AccountService::in_memory();
	let alice = code("AAAA-0001");
	let bob = code("BBBB-0002");

	let wide = UserPermissions::none()
		.with_primary(PrimaryCapability::Emote)
		.with_primary(PrimaryCapability::Hypnosis);
	accounts.upsert_grant(&bob, &alice, wide).await.expect("upsert");

	let narrow = UserPermissions::none().with_primary(PrimaryCapability::Emote);
	accounts.upsert_grant(&bob, &alice, narrow).await.expect("upsert");
	assert_eq!(accounts.resolve_grant(&bob, &alice).await.expect("resolve"), Some(narrow));

	assert!(accounts.remove_grant(&bob, &alice).await.expect("remove"));
	assert!(!accounts.remove_grant(&bob, &alice).await.expect("remove"));
	assert_eq!(accounts.resolve_grant(&bob, &alice).await.expect("resolve"), None);
}

#[tokio::test]
async fn friends_of_lists_outgoing_edges_sorted() {
	let accounts = AccountService::in_memory();
	let owner = code("AAAA-0001");

	accounts
		.upsert_grant(&owner, &code("CCCC-0003"), UserPermissions::none())
		.await
		.expect("upsert");
	accounts
		.upsert_grant(&owner, &code("BBBB-0002"), UserPermissions::none())
		.await
		.expect("upsert");
	// Incoming edge must not appear in the owner's list.
	accounts
		.upsert_grant(&code("DDDD-0004"), &owner, UserPermissions::none())
		.await
		.expect("upsert");

	let edges = accounts.friends_of(&owner).await.expect("friends");
	let codes = edges.iter().map(|e| e.friend_code.as_str().to_string()).collect::<Vec<_>>();
	assert_eq!(codes, vec!["BBBB-0002".to_string(), "CCCC-0003".to_string()]);
}
