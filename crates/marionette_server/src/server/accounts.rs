#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use marionette_domain::{FriendCode, UserPermissions};
use sha2::{Digest, Sha256};
use sqlx::Row as _;
use tokio::sync::Mutex;

/// Lowercase hex SHA-256 of a login secret. Secrets are never stored
/// or compared in the clear.
pub fn hash_secret(secret: &str) -> String {
	let digest = Sha256::digest(secret.as_bytes());
	let mut out = String::with_capacity(digest.len() * 2);
	for byte in digest {
		out.push_str(&format!("{byte:02x}"));
	}
	out
}

/// A directed permission grant: `friend_code` has granted the owner of
/// the edge list these capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendEdge {
	pub friend_code: FriendCode,
	pub permissions: UserPermissions,
}

/// Storage backend for accounts and directed permission grants.
///
/// Grants are directed: `upsert_grant(owner, target, perms)` records what
/// `owner` allows `target` to do to them. `resolve_grant(granter, grantee)`
/// reads the same edge back.
#[async_trait]
pub trait AccountStore: Send + Sync {
	async fn create_account(&self, friend_code: &FriendCode, secret_hash: &str) -> anyhow::Result<()>;

	async fn friend_code_for_secret(&self, secret_hash: &str) -> anyhow::Result<Option<FriendCode>>;

	async fn account_exists(&self, friend_code: &FriendCode) -> anyhow::Result<bool>;

	async fn upsert_grant(&self, owner: &FriendCode, target: &FriendCode, permissions: UserPermissions) -> anyhow::Result<()>;

	/// Returns whether a grant existed.
	async fn remove_grant(&self, owner: &FriendCode, target: &FriendCode) -> anyhow::Result<bool>;

	async fn resolve_grant(&self, granter: &FriendCode, grantee: &FriendCode) -> anyhow::Result<Option<UserPermissions>>;

	/// Outgoing edges of `owner`: everyone they have added, with the
	/// permissions they granted.
	async fn friends_of(&self, owner: &FriendCode) -> anyhow::Result<Vec<FriendEdge>>;
}

#[derive(Default)]
struct InMemoryState {
	secrets: HashMap<String, FriendCode>,
	accounts: HashSet<FriendCode>,
	grants: HashMap<(FriendCode, FriendCode), UserPermissions>,
}

/// Process-local account store for dev runs and tests.
#[derive(Default)]
pub struct InMemoryAccountStore {
	state: Mutex<InMemoryState>,
}

impl InMemoryAccountStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
	async fn create_account(&self, friend_code: &FriendCode, secret_hash: &str) -> anyhow::Result<()> {
		let mut state = self.state.lock().await;
		state.secrets.insert(secret_hash.to_string(), friend_code.clone());
		state.accounts.insert(friend_code.clone());
		Ok(())
	}

	async fn friend_code_for_secret(&self, secret_hash: &str) -> anyhow::Result<Option<FriendCode>> {
		Ok(self.state.lock().await.secrets.get(secret_hash).cloned())
	}

	async fn account_exists(&self, friend_code: &FriendCode) -> anyhow::Result<bool> {
		Ok(self.state.lock().await.accounts.contains(friend_code))
	}

	async fn upsert_grant(&self, owner: &FriendCode, target: &FriendCode, permissions: UserPermissions) -> anyhow::Result<()> {
		self.state
			.lock()
			.await
			.grants
			.insert((owner.clone(), target.clone()), permissions);
		Ok(())
	}

	async fn remove_grant(&self, owner: &FriendCode, target: &FriendCode) -> anyhow::Result<bool> {
		Ok(self.state.lock().await.grants.remove(&(owner.clone(), target.clone())).is_some())
	}

	async fn resolve_grant(&self, granter: &FriendCode, grantee: &FriendCode) -> anyhow::Result<Option<UserPermissions>> {
		Ok(self.state.lock().await.grants.get(&(granter.clone(), grantee.clone())).copied())
	}

	async fn friends_of(&self, owner: &FriendCode) -> anyhow::Result<Vec<FriendEdge>> {
		let state = self.state.lock().await;
		let mut edges = state
			.grants
			.iter()
			.filter(|((from, _), _)| from == owner)
			.map(|((_, to), perms)| FriendEdge {
				friend_code: to.clone(),
				permissions: *perms,
			})
			.collect::<Vec<_>>();
		edges.sort_by(|a, b| a.friend_code.as_str().cmp(b.friend_code.as_str()));
		Ok(edges)
	}
}

/// SQLite-backed account store. Runs pending migrations on connect.
pub struct SqliteAccountStore {
	pool: sqlx::SqlitePool,
}

impl SqliteAccountStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite").run(&pool).await.context("run sqlite migrations")?;
		Ok(Self { pool })
	}

	pub fn pool(&self) -> &sqlx::SqlitePool {
		&self.pool
	}
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
	async fn create_account(&self, friend_code: &FriendCode, secret_hash: &str) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO accounts (friend_code, secret_hash) VALUES (?, ?)")
			.bind(friend_code.as_str())
			.bind(secret_hash)
			.execute(&self.pool)
			.await
			.context("insert account (sqlite)")?;
		Ok(())
	}

	async fn friend_code_for_secret(&self, secret_hash: &str) -> anyhow::Result<Option<FriendCode>> {
		let row = sqlx::query("SELECT friend_code FROM accounts WHERE secret_hash = ?")
			.bind(secret_hash)
			.fetch_optional(&self.pool)
			.await
			.context("select account by secret (sqlite)")?;

		let Some(row) = row else {
			return Ok(None);
		};
		let code: String = row.try_get("friend_code").context("read friend_code column")?;
		Ok(Some(code.parse().context("parse stored friend code")?))
	}

	async fn account_exists(&self, friend_code: &FriendCode) -> anyhow::Result<bool> {
		let row = sqlx::query("SELECT 1 FROM accounts WHERE friend_code = ?")
			.bind(friend_code.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("select account (sqlite)")?;
		Ok(row.is_some())
	}

	async fn upsert_grant(&self, owner: &FriendCode, target: &FriendCode, permissions: UserPermissions) -> anyhow::Result<()> {
		sqlx::query(
			"INSERT INTO relationships (owner, target, primary_bits, speak_bits, elevated_bits) \
			VALUES (?, ?, ?, ?, ?) \
			ON CONFLICT (owner, target) DO UPDATE SET \
			primary_bits = excluded.primary_bits, speak_bits = excluded.speak_bits, elevated_bits = excluded.elevated_bits",
		)
		.bind(owner.as_str())
		.bind(target.as_str())
		.bind(permissions.primary.bits() as i64)
		.bind(permissions.speak.bits() as i64)
		.bind(permissions.elevated.bits() as i64)
		.execute(&self.pool)
		.await
		.context("upsert relationship (sqlite)")?;
		Ok(())
	}

	async fn remove_grant(&self, owner: &FriendCode, target: &FriendCode) -> anyhow::Result<bool> {
		let result = sqlx::query("DELETE FROM relationships WHERE owner = ? AND target = ?")
			.bind(owner.as_str())
			.bind(target.as_str())
			.execute(&self.pool)
			.await
			.context("delete relationship (sqlite)")?;
		Ok(result.rows_affected() > 0)
	}

	async fn resolve_grant(&self, granter: &FriendCode, grantee: &FriendCode) -> anyhow::Result<Option<UserPermissions>> {
		let row = sqlx::query("SELECT primary_bits, speak_bits, elevated_bits FROM relationships WHERE owner = ? AND target = ?")
			.bind(granter.as_str())
			.bind(grantee.as_str())
			.fetch_optional(&self.pool)
			.await
			.context("select relationship (sqlite)")?;

		let Some(row) = row else {
			return Ok(None);
		};
		let primary: i64 = row.try_get("primary_bits").context("read primary_bits column")?;
		let speak: i64 = row.try_get("speak_bits").context("read speak_bits column")?;
		let elevated: i64 = row.try_get("elevated_bits").context("read elevated_bits column")?;
		Ok(Some(UserPermissions::from_bits(primary as u64, speak as u64, elevated as u64)))
	}

	async fn friends_of(&self, owner: &FriendCode) -> anyhow::Result<Vec<FriendEdge>> {
		let rows = sqlx::query(
			"SELECT target, primary_bits, speak_bits, elevated_bits FROM relationships WHERE owner = ? ORDER BY target",
		)
		.bind(owner.as_str())
		.fetch_all(&self.pool)
		.await
		.context("select relationships (sqlite)")?;

		let mut edges = Vec::with_capacity(rows.len());
		for row in rows {
			let target: String = row.try_get("target").context("read target column")?;
			let primary: i64 = row.try_get("primary_bits").context("read primary_bits column")?;
			let speak: i64 = row.try_get("speak_bits").context("read speak_bits column")?;
			let elevated: i64 = row.try_get("elevated_bits").context("read elevated_bits column")?;
			edges.push(FriendEdge {
				friend_code: target.parse().context("parse stored friend code")?,
				permissions: UserPermissions::from_bits(primary as u64, speak as u64, elevated as u64),
			});
		}
		Ok(edges)
	}
}

/// Shared handle over whichever `AccountStore` backend is configured.
#[derive(Clone)]
pub struct AccountService {
	store: Arc<dyn AccountStore>,
}

impl AccountService {
	pub fn new(store: Arc<dyn AccountStore>) -> Self {
		Self { store }
	}

	pub fn in_memory() -> Self {
		Self::new(Arc::new(InMemoryAccountStore::new()))
	}

	pub async fn create_account(&self, friend_code: &FriendCode, secret: &str) -> anyhow::Result<()> {
		self.store.create_account(friend_code, &hash_secret(secret)).await
	}

	pub async fn friend_code_for_secret_hash(&self, secret_hash: &str) -> anyhow::Result<Option<FriendCode>> {
		self.store.friend_code_for_secret(secret_hash).await
	}

	pub async fn account_exists(&self, friend_code: &FriendCode) -> anyhow::Result<bool> {
		self.store.account_exists(friend_code).await
	}

	pub async fn upsert_grant(&self, owner: &FriendCode, target: &FriendCode, permissions: UserPermissions) -> anyhow::Result<()> {
		self.store.upsert_grant(owner, target, permissions).await
	}

	pub async fn remove_grant(&self, owner: &FriendCode, target: &FriendCode) -> anyhow::Result<bool> {
		self.store.remove_grant(owner, target).await
	}

	pub async fn resolve_grant(&self, granter: &FriendCode, grantee: &FriendCode) -> anyhow::Result<Option<UserPermissions>> {
		self.store.resolve_grant(granter, grantee).await
	}

	pub async fn friends_of(&self, owner: &FriendCode) -> anyhow::Result<Vec<FriendEdge>> {
		self.store.friends_of(owner).await
	}

	/// Both edges exist, regardless of what either grants.
	pub async fn are_mutual_friends(&self, a: &FriendCode, b: &FriendCode) -> anyhow::Result<bool> {
		Ok(self.resolve_grant(a, b).await?.is_some() && self.resolve_grant(b, a).await?.is_some())
	}
}
