mod entity;
mod mutation;

pub use entity::Entity;
pub use mutation::Mutation;
