//! Per-connection echo handler.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::transform;
use crate::server::{RunState, ServerStats};

/// Upper bound on a single read.
pub const READ_CHUNK: usize = 1024;

/// Errors that end a handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
}

/// Serve one connection until the peer closes, the server stops, or I/O
/// fails. Returns the number of messages answered.
///
/// Each read is treated as one message. TCP gives no message boundaries, so
/// a read may hold part of a client write or several writes at once; the
/// response covers whatever bytes arrived. Requests are answered strictly
/// one at a time: the full response is written before the next read.
pub async fn handle_connection<S>(
    stream: &mut S,
    run_state: &RunState,
    stats: &ServerStats,
) -> Result<u64, HandlerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = [0u8; READ_CHUNK];
    let mut handled = 0;

    while run_state.is_accepting() {
        let n = tokio::select! {
            biased;
            _ = run_state.stopped() => {
                trace!("Server stopping, leaving connection");
                break;
            }
            result = stream.read(&mut buffer) => result.map_err(HandlerError::Read)?,
        };

        if n == 0 {
            trace!("Connection closed by peer");
            break;
        }

        let payload = &buffer[..n];
        debug!(data = %String::from_utf8_lossy(payload), "Received data");

        let response = transform::respond(payload);
        stream
            .write_all(&response)
            .await
            .map_err(HandlerError::Write)?;

        stats.record_message();
        handled += 1;
    }

    Ok(handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_echoes_each_read() {
        let run_state = RunState::new();
        let stats = ServerStats::default();
        let mut stream = Builder::new()
            .read(b"Client 1 message 0")
            .write(b"Processed data: Client 1 message 0")
            .read(b"Client 1 message 1")
            .write(b"Processed data: Client 1 message 1")
            .build();

        let handled = handle_connection(&mut stream, &run_state, &stats)
            .await
            .unwrap();

        assert_eq!(handled, 2);
        assert_eq!(stats.snapshot().messages_handled, 2);
    }

    #[tokio::test]
    async fn test_peer_close_ends_handler() {
        let run_state = RunState::new();
        let stats = ServerStats::default();
        let mut stream = Builder::new().build();

        let handled = handle_connection(&mut stream, &run_state, &stats)
            .await
            .unwrap();
        assert_eq!(handled, 0);
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let run_state = RunState::new();
        let stats = ServerStats::default();
        let mut stream = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let result = handle_connection(&mut stream, &run_state, &stats).await;
        assert!(matches!(result, Err(HandlerError::Read(_))));
    }

    #[tokio::test]
    async fn test_write_error_is_reported() {
        let run_state = RunState::new();
        let stats = ServerStats::default();
        let mut stream = Builder::new()
            .read(b"ping")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let result = handle_connection(&mut stream, &run_state, &stats).await;
        assert!(matches!(result, Err(HandlerError::Write(_))));
        assert_eq!(stats.snapshot().messages_handled, 0);
    }

    #[tokio::test]
    async fn test_stopped_server_reads_nothing() {
        let run_state = RunState::new();
        run_state.begin_shutdown();
        let stats = ServerStats::default();
        let mut stream = Builder::new().build();

        let handled = handle_connection(&mut stream, &run_state, &stats)
            .await
            .unwrap();
        assert_eq!(handled, 0);
    }
}
