use serde::de::DeserializeOwned;
use serde::Serialize;

/// A business entity persisted alongside outbox events.
///
/// Entities are stored as JSON documents keyed by `(KIND, entity_id)`.
pub trait Entity: Serialize + DeserializeOwned {
    /// Storage collection, e.g. `"users"`.
    const KIND: &'static str;

    fn entity_id(&self) -> String;
}
