//! Retry control around single CLI attempts.

mod classify;
mod controller;
mod policy;

pub use classify::{Signal, detect, interpret};
pub use controller::RetryController;
pub use policy::RetryPolicy;
