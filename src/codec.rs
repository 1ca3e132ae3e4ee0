use log::debug;

use crate::{error::CodecError, protocol::InstantMessage};

/// Turns semantic messages into opaque shipment payloads and back.
/// Signing and encryption live behind this seam.
pub trait EnvelopeCodec: Send + Sync + 'static {
    fn encode(&self, msg: &InstantMessage) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<InstantMessage, CodecError>;
}

/// Unsigned JSON envelopes, for loopback transports and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn encode(&self, msg: &InstantMessage) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(msg)?)
    }

    fn decode(&self, data: &[u8]) -> Result<InstantMessage, CodecError> {
        if data.is_empty() {
            return Err(CodecError::MalformedEnvelope("empty payload".to_string()));
        }
        let msg: InstantMessage = serde_json::from_slice(data)?;
        debug!("Decoded message {} -> {}", msg.sender, msg.receiver);
        Ok(msg)
    }
}
