//! Request to response transform.

use bytes::BytesMut;

/// Prefix placed in front of every echoed payload.
pub const RESPONSE_MARKER: &str = "Processed data: ";

/// Build the response for one received chunk.
///
/// The payload is embedded unchanged when it is valid UTF-8; invalid
/// sequences are replaced with U+FFFD so the response is always text.
pub fn respond(payload: &[u8]) -> BytesMut {
    let text = String::from_utf8_lossy(payload);
    let mut response = BytesMut::with_capacity(RESPONSE_MARKER.len() + text.len());
    response.extend_from_slice(RESPONSE_MARKER.as_bytes());
    response.extend_from_slice(text.as_bytes());
    response
}

/// Strip the marker from a response, returning the echoed payload.
pub fn echoed_payload(response: &[u8]) -> Option<&[u8]> {
    response.strip_prefix(RESPONSE_MARKER.as_bytes())
}
