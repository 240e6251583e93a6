//! Background reconcilers that keep conversations and sessions converged.

pub mod dedup;
pub mod fanout;
pub mod rehydrate;

pub use dedup::BoundedDedup;
pub use fanout::FanoutReconciler;
pub use rehydrate::RehydrationReconciler;
