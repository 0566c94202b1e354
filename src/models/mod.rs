pub mod instance;
pub mod outcome;
pub mod target;
pub mod task;

pub use instance::*;
pub use outcome::*;
pub use target::*;
pub use task::*;
