use serde_json::Value;

use super::Entity;

/// A business-entity side effect applied in the same unit of work as an
/// outbox event.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert or replace the entity document.
    Persist {
        kind: String,
        id: String,
        data: Value,
    },
    /// Delete the entity. Fails the whole unit if the entity does not exist.
    Remove { kind: String, id: String },
}

impl Mutation {
    pub fn persist<T: Entity>(entity: &T) -> Result<Self, serde_json::Error> {
        Ok(Mutation::Persist {
            kind: T::KIND.to_string(),
            id: entity.entity_id(),
            data: serde_json::to_value(entity)?,
        })
    }

    pub fn remove<T: Entity>(entity: &T) -> Self {
        Self::remove_by_id::<T>(entity.entity_id())
    }

    pub fn remove_by_id<T: Entity>(id: impl Into<String>) -> Self {
        Mutation::Remove {
            kind: T::KIND.to_string(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Mutation::Persist { kind, .. } | Mutation::Remove { kind, .. } => kind,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Mutation::Persist { id, .. } | Mutation::Remove { id, .. } => id,
        }
    }
}
