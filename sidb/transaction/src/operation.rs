//! Transport encoding of transaction context.
//!
//! A request executed in a different process than the one that opened the transaction
//! carries the handle as bytes: a format version byte followed by a postcard payload.

use serde::{Deserialize, Serialize};

use crate::error::ContextError;
use crate::timestamp::Timestamp;
use crate::transaction::{IsolationLevel, TxnHandle};

const FORMAT_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct EncodedTxn {
    id: Timestamp,
    ancestors: Vec<Timestamp>,
    isolation_level: IsolationLevel,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OperationFactory;

impl OperationFactory {
    pub fn new() -> Self {
        Self
    }

    pub fn write_txn(&self, txn: &TxnHandle) -> Result<Vec<u8>, ContextError> {
        let encoded = EncodedTxn {
            id: txn.id(),
            ancestors: txn.ancestors().to_vec(),
            isolation_level: txn.isolation_level(),
        };
        let payload =
            postcard::to_allocvec(&encoded).map_err(|e| ContextError::Encode(e.to_string()))?;
        let mut bytes = Vec::with_capacity(payload.len() + 1);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Rebuild a handle. Either the whole context is valid or nothing is returned.
    pub fn read_txn(&self, bytes: &[u8]) -> Result<TxnHandle, ContextError> {
        let (version, payload) = bytes
            .split_first()
            .ok_or_else(|| ContextError::Deserialization("empty input".to_string()))?;
        if *version != FORMAT_VERSION {
            return Err(ContextError::Deserialization(format!(
                "unsupported format version {version}"
            )));
        }
        let (encoded, rest): (EncodedTxn, _) = postcard::take_from_bytes(payload)
            .map_err(|e| ContextError::Deserialization(e.to_string()))?;
        if !rest.is_empty() {
            return Err(ContextError::Deserialization(format!(
                "{} trailing bytes",
                rest.len()
            )));
        }
        TxnHandle::new(encoded.id, encoded.ancestors, encoded.isolation_level)
            .map_err(|e| ContextError::Deserialization(e.to_string()))
    }
}
