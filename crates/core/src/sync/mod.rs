//! Cache priming, live reference data and sync scheduling.

mod lock;
mod model;
mod priming_service;
mod reference_data;
mod scheduler;

pub use lock::*;
pub use model::*;
pub use priming_service::*;
pub use reference_data::*;
pub use scheduler::*;

#[cfg(test)]
mod tests;
