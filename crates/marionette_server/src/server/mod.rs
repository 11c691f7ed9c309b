#![forbid(unsafe_code)]

pub mod accounts;
pub mod audit;
pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod health;
pub mod possession;
pub mod rate;
pub mod registry;

#[cfg(test)]
mod accounts_tests;


#[cfg(test)]
mod possession_tests;


use std::sync::Arc;

use anyhow::Context as _;
use tracing::{error, info};

use crate::server::accounts::AccountService;
use crate::server::audit::AuditService;
use crate::server::connection::ConnectionSettings;
use crate::server::possession::PossessionManager;
use crate::server::rate::ActionRateLimiter;
use crate::server::registry::ConnectionRegistry;

/// Shared state handed to every connection task.
pub struct ServerContext {
	pub registry: Arc<ConnectionRegistry>,
	pub accounts: AccountService,
	pub possession: Arc<PossessionManager>,
	pub rate: Arc<ActionRateLimiter>,
	pub audit: Arc<AuditService>,
}

/// Accept QUIC connections forever, one task per connection.
pub async fn serve(endpoint: quinn::Endpoint, ctx: Arc<ServerContext>, settings: ConnectionSettings) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	while let Some(connecting) = endpoint.accept().await {
		let conn_id = next_conn_id;
		next_conn_id = next_conn_id.wrapping_add(1);

		let ctx = Arc::clone(&ctx);
		let settings = settings.clone();

		tokio::spawn(async move {
			let connection = match connecting.await.context("quic handshake") {
				Ok(c) => c,
				Err(e) => {
					error!(conn_id, error = %e, "connection handshake failed");
					return;
				}
			};

			metrics::counter!("marionette_server_connections_total").increment(1);
			info!(conn_id, remote = %connection.remote_address(), "accepted connection");

			if let Err(e) = connection::handle_connection(conn_id, connection, ctx, settings).await {
				error!(conn_id, error = %e, "connection task failed");
			}
		});
	}

	Ok(())
}
