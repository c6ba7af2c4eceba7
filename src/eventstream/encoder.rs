//! EventStream frame encoder.
//!
//! The gateway itself only decodes upstream frames; the encoder exists so
//! test suites and local tooling can fabricate upstream traffic byte-for-byte.
//! CRC words are written as zeros, which the decoder does not check.

use super::HeaderValue;

/// Encode one message with the given headers and payload.
#[must_use]
pub fn encode_message(headers: &[(&str, HeaderValue)], payload: &[u8]) -> Vec<u8> {
    let mut header_block = Vec::new();
    for (name, value) in headers {
        encode_header(&mut header_block, name, value);
    }

    let total_length = 12 + header_block.len() + payload.len() + 4;
    let mut frame = Vec::with_capacity(total_length);
    frame.extend_from_slice(&(total_length as u32).to_be_bytes());
    frame.extend_from_slice(&(header_block.len() as u32).to_be_bytes());
    frame.extend_from_slice(&[0u8; 4]);
    frame.extend_from_slice(&header_block);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[0u8; 4]);
    frame
}

/// Encode a JSON event frame the way the upstream frames its responses:
/// `:message-type = event`, `:event-type = <event_type>`,
/// `:content-type = application/json`.
#[must_use]
pub fn encode_event(event_type: &str, payload: &serde_json::Value) -> Vec<u8> {
    let body = serde_json::to_vec(payload).unwrap_or_default();
    encode_message(
        &[
            (
                super::MESSAGE_TYPE_HEADER,
                HeaderValue::String("event".to_string()),
            ),
            (
                super::EVENT_TYPE_HEADER,
                HeaderValue::String(event_type.to_string()),
            ),
            (
                super::CONTENT_TYPE_HEADER,
                HeaderValue::String("application/json".to_string()),
            ),
        ],
        &body,
    )
}

fn encode_header(out: &mut Vec<u8>, name: &str, value: &HeaderValue) {
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    match value {
        HeaderValue::Bool(true) => out.push(0),
        HeaderValue::Bool(false) => out.push(1),
        HeaderValue::Int8(v) => {
            out.push(2);
            out.push(*v as u8);
        }
        HeaderValue::Int16(v) => {
            out.push(3);
            out.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Int32(v) => {
            out.push(4);
            out.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Int64(v) => {
            out.push(5);
            out.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Bytes(v) => {
            out.push(6);
            out.extend_from_slice(&(v.len() as u16).to_be_bytes());
            out.extend_from_slice(v);
        }
        HeaderValue::String(v) => {
            out.push(7);
            out.extend_from_slice(&(v.len() as u16).to_be_bytes());
            out.extend_from_slice(v.as_bytes());
        }
        HeaderValue::Timestamp(v) => {
            out.push(8);
            out.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Uuid(v) => {
            out.push(9);
            let parsed = v
                .parse::<uuid::Uuid>()
                .unwrap_or(uuid::Uuid::nil());
            out.extend_from_slice(parsed.as_bytes());
        }
    }
}
