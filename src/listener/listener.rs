use std::future::Future;

use async_trait::async_trait;

use crate::event::OutboxEvent;

/// Error returned by a listener. Any `std::error::Error` converts with `?`,
/// and so does a plain `String` or `&str`.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// A handler invoked once per outbox record until it succeeds.
///
/// ```ignore
/// struct WelcomeMailer;
///
/// #[async_trait]
/// impl Listener<UserCreated> for WelcomeMailer {
///     async fn handle(&self, event: UserCreated) -> Result<(), ListenerError> {
///         send_welcome(&event.email).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Listener<E: OutboxEvent>: Send + Sync + 'static {
    async fn handle(&self, event: E) -> Result<(), ListenerError>;
}

/// Listener backed by an async closure. Built with [`listener_fn`].
pub struct FnListener<F> {
    f: F,
}

/// Wrap an async closure as a [`Listener`].
pub fn listener_fn<E, F, Fut>(f: F) -> FnListener<F>
where
    E: OutboxEvent,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    FnListener { f }
}

#[async_trait]
impl<E, F, Fut> Listener<E> for FnListener<F>
where
    E: OutboxEvent,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
{
    async fn handle(&self, event: E) -> Result<(), ListenerError> {
        (self.f)(event).await
    }
}
