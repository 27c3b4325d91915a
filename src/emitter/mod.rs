mod emitter;
mod unit_of_work;

pub use emitter::TransactionalEmitter;
pub use unit_of_work::UnitOfWork;
