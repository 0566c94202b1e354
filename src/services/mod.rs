pub mod connection_service;
pub mod coordinator;
pub mod executor;
pub mod progress;
pub mod state_machine;
pub mod task_service;

#[cfg(test)]
pub(crate) mod testing;

pub use connection_service::*;
pub use coordinator::*;
pub use executor::*;
pub use progress::*;
pub use task_service::*;
