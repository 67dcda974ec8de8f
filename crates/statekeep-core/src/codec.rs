// ABOUTME: Pluggable encoding of persisted records to and from the string values storage holds.
// ABOUTME: JSON is the default; YAML is available for stores meant to be read by humans.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::record::PersistedRecord;

/// Errors produced while encoding or decoding a record.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Converts a record to the string stored under a key, and back.
pub trait Codec<S>: Send + Sync {
    fn encode(&self, record: &PersistedRecord<S>) -> Result<String, CodecError>;
    fn decode(&self, raw: &str) -> Result<PersistedRecord<S>, CodecError>;
}

/// Compact JSON, the default codec.
pub struct JsonCodec<S>(PhantomData<fn() -> S>);

impl<S> JsonCodec<S> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<S> Default for JsonCodec<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for JsonCodec<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<S> Codec<S> for JsonCodec<S>
where
    S: Serialize + DeserializeOwned,
{
    fn encode(&self, record: &PersistedRecord<S>) -> Result<String, CodecError> {
        Ok(serde_json::to_string(record)?)
    }

    fn decode(&self, raw: &str) -> Result<PersistedRecord<S>, CodecError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// YAML documents, handy when the backing store is a directory people edit.
pub struct YamlCodec<S>(PhantomData<fn() -> S>);

impl<S> YamlCodec<S> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<S> Default for YamlCodec<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for YamlCodec<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("YamlCodec")
    }
}

impl<S> Codec<S> for YamlCodec<S>
where
    S: Serialize + DeserializeOwned,
{
    fn encode(&self, record: &PersistedRecord<S>) -> Result<String, CodecError> {
        Ok(serde_yaml::to_string(record)?)
    }

    fn decode(&self, raw: &str) -> Result<PersistedRecord<S>, CodecError> {
        Ok(serde_yaml::from_str(raw)?)
    }
}
