mod listener;
mod registry;

pub use listener::{listener_fn, FnListener, Listener, ListenerError};
pub use registry::{ListenerRegistry, RegisteredListener};
