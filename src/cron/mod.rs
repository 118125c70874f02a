//! Cooperative periodic task scheduling, used by the lifecycle reaper
//! (§4.4) to sweep idle containers on a fixed interval.

mod scheduler;

pub use scheduler::{JobHandle, Scheduler};
