//! Coordination primitives shared by the pool maintenance task and long-running workers.

pub mod shutdown;
