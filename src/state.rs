//! Shared state handed to every handler through `Router::with_state`.

use crate::services::{
    admission::AdmissionPolicy, object_store::ObjectStore, rate_limiter::RateLimiter,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: ObjectStore,
    pub admission: AdmissionPolicy,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(store: ObjectStore, admission: AdmissionPolicy, limiter: Arc<RateLimiter>) -> Self {
        Self {
            store,
            admission,
            limiter,
        }
    }
}
