//! Backend API bindings: the reqwest client used in production and a
//! scripted mock for tests.

pub mod client;
pub mod mock;

pub use client::{HttpBackendApi, DEFAULT_BASE_URL};
pub use mock::{ApiCall, MockBackendApi};
