//! Payload encoding for bus messages.
//!
//! Payloads are self-describing JSON maps. Optional fields are omitted rather
//! than written as `null`, so "absent" and "zero" stay distinguishable.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

pub fn pack<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

pub fn unpack<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::Decode)
}
