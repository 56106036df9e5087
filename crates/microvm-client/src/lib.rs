//! MicroVM service client
//!
//! A client for the HTTP/JSON gateway of the microvm provisioning service that runs
//! on every host of a static pool. Each host is addressed by its endpoint; one client
//! instance talks to exactly one host.
//!
//! # Example
//!
//! ```no_run
//! use microvm_client::{ClientOptions, MicrovmClient, MicrovmClientTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MicrovmClient::new("10.0.0.1:9090", &ClientOptions::default())?;
//!
//! match client.get_microvm("default", "worker-0").await {
//!     Ok(microvm) => println!("state: {:?}", microvm.state()),
//!     Err(e) if e.is_not_found() => println!("not created yet"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Typed outcomes**: not-found is distinguishable from every other failure
//! - **Per-host credentials**: basic auth token, mutual TLS, HTTP(S) proxy
//! - **Mocking**: an in-memory client and factory behind the `test-util` feature

pub mod client;
pub mod error;
pub mod models;
pub mod options;
#[path = "trait.rs"]
pub mod microvm_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{HttpClientFactory, MicrovmClient};
pub use error::MicrovmError;
pub use models::*;
pub use microvm_trait::{MicrovmClientFactory, MicrovmClientTrait};
pub use options::{ClientOptions, TlsConfig};
#[cfg(feature = "test-util")]
pub use mock::{MockClientFactory, MockMicrovmClient, MockOperation};
