#![forbid(unsafe_code)]

use anyhow::Context;

/// Best-effort audit trail for relayed actions and possession sessions.
///
/// Failures here are logged by callers and never fail the request that
/// triggered the write.
#[derive(Clone)]
pub struct AuditService {
	pool: Option<sqlx::SqlitePool>,
}

impl AuditService {
	/// Reuse the account store's pool; migrations already ran there.
	pub fn with_pool(pool: sqlx::SqlitePool) -> Self {
		Self { pool: Some(pool) }
	}

	pub fn disabled() -> Self {
		Self { pool: None }
	}

	pub async fn record_action(&self, sender: &str, action_kind: &str, target_count: usize) -> anyhow::Result<()> {
		let Some(pool) = &self.pool else {
			return Ok(());
		};

		sqlx::query(
			"INSERT INTO action_audit (sender, action_kind, target_count, created_at) \
			VALUES (?, ?, ?, strftime('%s','now'))",
		)
		.bind(sender)
		.bind(action_kind)
		.bind(target_count as i64)
		.execute(pool)
		.await
		.context("insert action_audit (sqlite)")?;

		Ok(())
	}

	pub async fn record_possession(&self, event: &str, possessor: &str, ghost: &str) -> anyhow::Result<()> {
		let Some(pool) = &self.pool else {
			return Ok(());
		};

		sqlx::query(
			"INSERT INTO possession_audit (event, possessor, ghost, created_at) \
			VALUES (?, ?, ?, strftime('%s','now'))",
		)
		.bind(event)
		.bind(possessor)
		.bind(ghost)
		.execute(pool)
		.await
		.context("insert possession_audit (sqlite)")?;

		Ok(())
	}
}
