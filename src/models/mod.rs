//! RustReach Models

pub mod email;
pub mod campaign;
pub mod job;
pub mod quota;
pub mod event;
pub mod report;

pub use email::*;
pub use campaign::*;
pub use job::*;
pub use quota::*;
pub use event::*;
pub use report::*;
