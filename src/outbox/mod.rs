mod record;

pub use record::{NewOutboxRecord, OutboxRecord};

pub(crate) use record::after;
