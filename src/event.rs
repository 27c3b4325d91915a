use serde::de::DeserializeOwned;
use serde::Serialize;

/// An event that can be written to the outbox.
///
/// The `EVENT_NAME` is the key into the configuration table and the
/// listener registry. The rest of the type is the payload: it is stored as
/// JSON and deserialized back into `Self` before listeners run.
///
/// Usually derived:
///
/// ```ignore
/// #[derive(Serialize, Deserialize, OutboxEvent)]
/// #[outbox(name = "UserCreated")]
/// struct UserCreated {
///     user_id: String,
/// }
/// ```
pub trait OutboxEvent: Serialize + DeserializeOwned + Send + 'static {
    const EVENT_NAME: &'static str;

    fn event_name(&self) -> &'static str {
        Self::EVENT_NAME
    }
}
