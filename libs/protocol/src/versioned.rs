//! Embedded-version framing with forward migrations.
//!
//! Every durable record and wire message is framed as a 4-byte
//! little-endian schema version followed by the schema payload. Data written
//! by an older build is upgraded one version at a time by registered
//! migrations before the current decoder runs. Data from a newer build is
//! rejected.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use crate::bare::SchemaCodec;
use crate::error::CodecError;

const VERSION_HEADER_LEN: usize = 4;

/// Rewrites a payload of version `n` into a payload of version `n + 1`.
pub type Migration = fn(&[u8]) -> Result<Vec<u8>, CodecError>;

pub struct VersionedCodec<T> {
    current_version: u32,
    migrations: BTreeMap<u32, Migration>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for VersionedCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedCodec")
            .field("current_version", &self.current_version)
            .field("migrations", &self.migrations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: SchemaCodec> VersionedCodec<T> {
    pub fn new(current_version: u32) -> Self {
        Self {
            current_version,
            migrations: BTreeMap::new(),
            _marker: PhantomData,
        }
    }

    /// Registers the migration that upgrades `from_version` payloads.
    pub fn with_migration(mut self, from_version: u32, migration: Migration) -> Self {
        self.migrations.insert(from_version, migration);
        self
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Encodes the payload without a version header.
    pub fn serialize(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(value.to_bare()?.to_vec())
    }

    /// Decodes a payload written at `version`, migrating it first if needed.
    pub fn deserialize(&self, payload: &[u8], version: u32) -> Result<T, CodecError> {
        if version > self.current_version {
            return Err(CodecError::FutureVersion {
                version,
                current: self.current_version,
            });
        }

        if version == self.current_version {
            return T::from_bare(payload);
        }

        let mut upgraded = payload.to_vec();
        for step in version..self.current_version {
            let migrate = self
                .migrations
                .get(&step)
                .ok_or(CodecError::MissingMigration { version: step })?;
            upgraded = migrate(&upgraded)?;
        }
        T::from_bare(&upgraded)
    }

    pub fn serialize_with_embedded_version(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let payload = value.to_bare()?;
        let mut out = Vec::with_capacity(VERSION_HEADER_LEN + payload.len());
        out.extend_from_slice(&self.current_version.to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn deserialize_with_embedded_version(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let Some((header, payload)) = bytes.split_first_chunk::<VERSION_HEADER_LEN>() else {
            return Err(CodecError::TooShort { len: bytes.len() });
        };
        self.deserialize(payload, u32::from_le_bytes(*header))
    }
}
