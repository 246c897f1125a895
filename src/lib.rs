//! pbproc - Personal best consolidation worker
//!
//! Consumes record-submitted notifications from the broker, recomputes the
//! personal best for each affected (participant, level) pair against the
//! store, and announces which records changed.

pub mod bus;
pub mod config;
pub mod queue;
pub mod store;
pub mod worker;
