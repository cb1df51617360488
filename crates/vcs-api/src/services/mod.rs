//! Background services.

pub mod expiry_sweeper;

pub use expiry_sweeper::{ExpirySweeper, SweepReport};
