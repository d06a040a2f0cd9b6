//! gq-client: Transport for the genqueue generation backend
//!
//! The REST client talks to the backend's HTTP API with a retry policy for
//! idempotent requests; the push channel keeps a websocket to the progress
//! stream open, reconnecting after a fixed delay. [`TransportAdapter`] ties
//! both together and reports validated data through [`TransportCallbacks`].

pub mod adapter;
pub mod api;
pub mod connection;
pub mod endpoint;
pub mod push;
pub mod rest;
pub mod retry;

pub use adapter::{JobsSource, JobsUpdate, TransportAdapter, TransportCallbacks};
pub use api::{Download, GenerationApi, ResultsQuery};
pub use connection::{ConnectionState, ConnectionTracker};
pub use endpoint::{normalize_base_url, push_url_for, Endpoint, API_KEY_HEADER};
pub use push::{PushChannel, PushEnvelope, PushEvent};
pub use rest::RestClient;
pub use retry::{ExponentialBackoff, RetryPolicy};
