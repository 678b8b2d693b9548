//! Core services: the drop lifecycle store, upload admission, client rate
//! limiting and the background tasks that keep them tidy.

pub mod admission;
pub mod object_store;
pub mod periodic;
pub mod rate_limiter;
pub mod reaper;
