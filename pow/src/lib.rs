//! Asynchronous proof-of-work solving for outbound objects.
//!
//! Peer sessions never block on this: jobs queue behind a dedicated
//! engine running on blocking threads, and finished nonces come back
//! over a channel.

pub mod worker;

pub use worker::{PowJob, PowService, PowSolution};
