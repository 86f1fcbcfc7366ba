//! Simulated client.
//!
//! A session connects once, then runs a fixed number of request/response
//! rounds with a random pause between sending and reading so that clients
//! drift out of lockstep.

use crate::echo::transform;
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Upper bound on a single response read.
const RESPONSE_CHUNK: usize = 1024;

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client {client} failed to connect to {endpoint}: {source}")]
    Connect {
        client: usize,
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("client {client} I/O error in round {round}: {source}")]
    Io {
        client: usize,
        round: usize,
        #[source]
        source: io::Error,
    },
    #[error("client {client}: server closed the connection in round {round}")]
    ConnectionClosed { client: usize, round: usize },
}

/// Uniform range for the pause between send and receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    min: Duration,
    max: Duration,
}

impl Pacing {
    /// Bounds are reordered if given backwards.
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        rng.gen_range(self.min..=self.max)
    }
}

/// Outcome of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReport {
    pub client: usize,
    pub rounds: usize,
    /// Responses that echoed their request exactly.
    pub matched: usize,
}

impl ClientReport {
    pub fn all_matched(&self) -> bool {
        self.matched == self.rounds
    }
}

/// One simulated client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    id: usize,
    endpoint: SocketAddr,
    messages: usize,
    pacing: Pacing,
}

impl ClientSession {
    pub fn new(id: usize, endpoint: SocketAddr, messages: usize, pacing: Pacing) -> Self {
        Self {
            id,
            endpoint,
            messages,
            pacing,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Message sent in the given round.
    pub fn message(&self, round: usize) -> String {
        format!("Client {} message {}", self.id, round)
    }

    /// Connect and run every round. Any failure ends the session; the
    /// connection is closed when the stream drops.
    pub async fn run(&self) -> Result<ClientReport, ClientError> {
        let mut stream =
            TcpStream::connect(self.endpoint)
                .await
                .map_err(|source| ClientError::Connect {
                    client: self.id,
                    endpoint: self.endpoint,
                    source,
                })?;
        info!(client = self.id, endpoint = %self.endpoint, "Client connected to server");

        let mut report = ClientReport {
            client: self.id,
            rounds: 0,
            matched: 0,
        };
        let mut buffer = [0u8; RESPONSE_CHUNK];

        for round in 0..self.messages {
            let io_error = |source| ClientError::Io {
                client: self.id,
                round,
                source,
            };

            let message = self.message(round);
            stream.write_all(message.as_bytes()).await.map_err(io_error)?;

            let delay = self.pacing.sample(&mut rand::thread_rng());
            tokio::time::sleep(delay).await;

            // One read per round; a response split across segments shows up
            // as a mismatch rather than an error.
            let n = stream.read(&mut buffer).await.map_err(io_error)?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed {
                    client: self.id,
                    round,
                });
            }

            let response = &buffer[..n];
            info!(
                client = self.id,
                round,
                response = %String::from_utf8_lossy(response),
                "Client received response"
            );

            report.rounds += 1;
            if transform::echoed_payload(response) == Some(message.as_bytes()) {
                report.matched += 1;
            } else {
                warn!(client = self.id, round, "Response did not echo the request");
            }
        }

        if let Err(e) = stream.shutdown().await {
            debug!(client = self.id, error = %e, "Shutdown after final round failed");
        }
        Ok(report)
    }
}
