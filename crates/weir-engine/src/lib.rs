//! Transactional session protocol and engine wiring.
//!
//! The [`Engine`] owns the content store, the record repository, the
//! provenance log, and the connection queues. Stages interact with records
//! only through a [`Session`]: pull from input queues, create and modify
//! records and content, then commit atomically or roll back.
//!
//! Commit durably appends one transaction to the record repository, applies
//! claim reference-count deltas, appends provenance events, and only then
//! publishes outbound records into their destination queues. A crash before
//! the durable append leaves no visible effect; a crash after it is
//! replayed from the repository on the next [`Engine::open`].

pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod stage;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use session::Session;
pub use stage::Stage;
