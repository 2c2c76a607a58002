//! Process runtime for the recurring-order service: component wiring, the
//! local HTTP surface, and scheduler crash recovery.

pub mod http;
pub mod runtime;

pub use http::{spawn_http_server, HttpState};
pub use runtime::run_service;
