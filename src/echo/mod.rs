//! Echo service spoken between the server and the simulated clients.
//!
//! There is no framing: the server answers every chunk it reads with
//! `Processed data: <chunk>`.
//!
//! ```text
//! Request:  Client 3 message 7
//! Response: Processed data: Client 3 message 7
//! ```
//!
//! Message boundaries only line up because each client waits for a response
//! before sending its next request. A slow or fragmented network can still
//! split or merge chunks; both sides treat that as a property of the toy
//! protocol rather than an error.

pub mod handler;
pub mod transform;

pub use handler::handle_connection;
