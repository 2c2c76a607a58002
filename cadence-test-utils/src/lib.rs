//! Shared test infrastructure: a scriptable mock of the broker's web API
//! (with a real token handshake), a webhook capture sink, and disposable
//! OAuth key material.

pub mod broker;
pub mod keys;
pub mod webhook;

pub use broker::{BrokerState, MockBroker};
pub use keys::{TestKeys, TEST_DH_PRIME_HEX};
pub use webhook::{MockWebhook, WebhookState};
