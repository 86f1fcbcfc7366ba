//! Environment coordinator: one server plus a fleet of simulated clients.

use crate::client::{ClientReport, ClientSession, Pacing};
use crate::config::{ClientOptions, ServerOptions};
use crate::server::{Server, ServerError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Aggregate of every client outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSummary {
    pub completed: usize,
    pub failed: usize,
    /// Request/response rounds across all completed clients.
    pub rounds: usize,
    /// Rounds whose response echoed the request exactly.
    pub matched: usize,
}

pub struct Environment {
    server: Server,
    clients: Vec<JoinHandle<Option<ClientReport>>>,
}

impl Environment {
    /// Start the server, then launch `clients.count` simulators against it.
    ///
    /// The server is bound before any client is spawned, so clients never
    /// race the listener.
    pub async fn start(
        server_options: &ServerOptions,
        clients: &ClientOptions,
    ) -> Result<Self, ServerError> {
        let server = Server::start(server_options).await?;
        let endpoint = server.local_addr();
        let pacing = Pacing::new(clients.min_delay, clients.max_delay);

        let handles: Vec<_> = (1..=clients.count)
            .map(|id| ClientSession::new(id, endpoint, clients.messages, pacing))
            .map(|session| tokio::spawn(run_client(session)))
            .collect();

        info!(endpoint = %endpoint, clients = handles.len(), "Environment started");
        Ok(Self {
            server,
            clients: handles,
        })
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Stop the server. Clients are left to finish on their own.
    pub async fn stop(&self) {
        self.server.stop().await;
        info!("Environment stopped");
    }

    /// Wait for every client launched so far and summarize them.
    pub async fn join_clients(&mut self) -> EnvironmentSummary {
        let mut summary = EnvironmentSummary::default();

        for handle in self.clients.drain(..) {
            match handle.await {
                Ok(Some(report)) => {
                    summary.completed += 1;
                    summary.rounds += report.rounds;
                    summary.matched += report.matched;
                }
                Ok(None) => summary.failed += 1,
                Err(e) => {
                    error!(error = %e, "Client task failed");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}

async fn run_client(session: ClientSession) -> Option<ClientReport> {
    match session.run().await {
        Ok(report) => {
            info!(
                client = report.client,
                rounds = report.rounds,
                all_matched = report.all_matched(),
                "Client finished"
            );
            Some(report)
        }
        Err(e) => {
            warn!(client = session.id(), error = %e, "Client stopped early");
            None
        }
    }
}
