mod entity;
mod outbox_event;

use proc_macro::TokenStream;

/// Derive macro for the `OutboxEvent` trait.
///
/// ```ignore
/// #[derive(Serialize, Deserialize, OutboxEvent)]
/// #[outbox(name = "UserCreated")]
/// struct UserCreated {
///     user_id: String,
/// }
/// ```
///
/// The event name defaults to the type name.
#[proc_macro_derive(OutboxEvent, attributes(outbox))]
pub fn derive_outbox_event(input: TokenStream) -> TokenStream {
    outbox_event::derive_outbox_event(input)
}

/// Derive macro for the `Entity` trait.
///
/// ```ignore
/// #[derive(Serialize, Deserialize, Entity)]
/// #[entity(kind = "users")]
/// struct User {
///     #[entity(id)]
///     pub user_id: String,
///     pub email: String,
/// }
/// ```
///
/// - `#[entity(kind = "...")]` sets the storage collection. If omitted,
///   defaults to snake_case type name + "s".
/// - The id field is marked with `#[entity(id)]`, named with
///   `#[entity(id = "field")]` on the struct, or else is the field named `id`.
///   Its value must implement `Display`.
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    entity::derive_entity(input)
}
