// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Export and import of device state.
//!
//! Device state travels as a typed payload tagged with a [SchemaId].  The
//! serialization format is left to the caller through `erased_serde`.

use crate::vmm::MemCtx;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateStateError {
    /// Work is still in flight, so state cannot be captured.
    #[error("device's state is not ready to be exported")]
    NotReadyForExport,

    #[error("could not deserialize device state: {0}")]
    DeserializationFailed(String),

    /// The payload parsed but could not be applied.
    #[error("failed to apply deserialized device state: {0}")]
    ImportFailed(String),

    #[error("kind/version of payload not expected: {0} v{1}")]
    UnexpectedPayload(String, u32),
}

impl From<erased_serde::Error> for MigrateStateError {
    fn from(err: erased_serde::Error) -> Self {
        MigrateStateError::DeserializationFailed(err.to_string())
    }
}

pub enum Migrator<'a> {
    /// The device carries no state worth transferring.
    Empty,

    /// State is carried in a single payload.
    Single(&'a dyn MigrateSingle),
}

pub trait MigrateSingle: Send + Sync + 'static {
    fn export(
        &self,
        ctx: &MigrateCtx,
    ) -> Result<PayloadOutput, MigrateStateError>;
    fn import(
        &self,
        offer: PayloadOffer,
        ctx: &MigrateCtx,
    ) -> Result<(), MigrateStateError>;
}

pub struct MigrateCtx<'a> {
    pub mem: &'a MemCtx,
}

/// Serialized state handed to a device on import.
pub struct PayloadOffer<'a> {
    pub kind: &'a str,
    pub version: u32,
    pub payload: Box<dyn erased_serde::Deserializer<'a> + 'a>,
}
impl<'a> PayloadOffer<'a> {
    /// Deserialize the payload as `T`, provided its kind and version match.
    pub fn parse<T: Schema<'a>>(&mut self) -> Result<T, MigrateStateError> {
        let (kind, version) = T::id();
        if kind != self.kind || version != self.version {
            return Err(MigrateStateError::UnexpectedPayload(
                self.kind.into(),
                self.version,
            ));
        }
        Ok(erased_serde::deserialize(&mut self.payload)?)
    }
}

/// State produced by a device on export.
///
/// Build one from a [Schema] type with [From] so that the tag always matches
/// the payload.
pub struct PayloadOutput {
    pub kind: &'static str,
    pub version: u32,
    pub payload: Box<dyn erased_serde::Serialize>,
}

/// Kind and version of a payload.
pub type SchemaId = (&'static str, u32);

pub trait Schema<'de>: Serialize + Deserialize<'de> + Sized + 'static {
    fn id() -> SchemaId;
}

impl<'a, T: Schema<'a>> From<T> for PayloadOutput {
    fn from(value: T) -> Self {
        let (kind, version) = T::id();
        PayloadOutput { kind, version, payload: Box::new(value) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Counter {
        count: u32,
    }
    impl Schema<'_> for Counter {
        fn id() -> SchemaId {
            ("counter", 2)
        }
    }

    fn offer<'a>(
        kind: &'a str,
        version: u32,
        de: &'a mut serde_json::Deserializer<serde_json::de::StrRead<'a>>,
    ) -> PayloadOffer<'a> {
        PayloadOffer {
            kind,
            version,
            payload: Box::new(<dyn erased_serde::Deserializer>::erase(de)),
        }
    }

    #[test]
    fn parse_checks_tag() {
        let out = PayloadOutput::from(Counter { count: 7 });
        assert_eq!((out.kind, out.version), ("counter", 2));
        let json = serde_json::to_string(&out.payload).unwrap();

        let mut de = serde_json::Deserializer::from_str(&json);
        let parsed: Counter = offer("counter", 2, &mut de).parse().unwrap();
        assert_eq!(parsed, Counter { count: 7 });

        let mut de = serde_json::Deserializer::from_str(&json);
        assert!(matches!(
            offer("counter", 1, &mut de).parse::<Counter>(),
            Err(MigrateStateError::UnexpectedPayload(_, 1))
        ));

        let mut de = serde_json::Deserializer::from_str("{\"count\": -1}");
        assert!(matches!(
            offer("counter", 2, &mut de).parse::<Counter>(),
            Err(MigrateStateError::DeserializationFailed(_))
        ));
    }
}
