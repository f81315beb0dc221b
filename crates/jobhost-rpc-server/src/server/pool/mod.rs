//! Channel pool management.
//!
//! - [`manager`]: owns the live channels, round-robin selection and the
//!   phased drain-then-dispose shutdown.

pub mod manager;

pub use manager::ChannelPool;
