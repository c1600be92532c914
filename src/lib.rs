//! Scheduled pull/push of local git working copies.

pub mod daemon;
