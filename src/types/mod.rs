//! Type definitions

pub mod import;
pub mod import_job;
pub mod messages;
pub mod ticket;

pub use import::*;
pub use import_job::*;
pub use messages::*;
pub use ticket::*;
