//! Wire codecs for operations
//!
//! JSON is the interchange format; CBOR is the compact encoding the loopback
//! network uses between replicas. Both carry the same flat operation object.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::TransportError;
use crate::convergent::Operation;

/// Anything that travels between replicas: single operations or batches
pub trait WireMessage: Serialize + DeserializeOwned {}

impl WireMessage for Operation {}
impl WireMessage for Vec<Operation> {}

pub fn to_json<T: WireMessage>(message: &T) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::SerializationError(e.to_string()))
}

pub fn from_json<T: WireMessage>(json: &str) -> Result<T, TransportError> {
    serde_json::from_str(json).map_err(|e| TransportError::SerializationError(e.to_string()))
}

pub fn to_cbor<T: WireMessage>(message: &T) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| TransportError::SerializationError(e.to_string()))?;
    Ok(buf)
}

pub fn from_cbor<T: WireMessage>(data: &[u8]) -> Result<T, TransportError> {
    ciborium::from_reader(data).map_err(|e| TransportError::SerializationError(e.to_string()))
}
