//! The local agent daemon.
//!
//! Long-polls the backend for commands, enforces per-project policy, starts
//! and supervises the worker CLI, and reports results. The dispatcher turns
//! at-least-once delivery into at-most-once execution via the idempotency
//! cache; mutating commands run strictly serialized.

pub mod client;
pub mod credentials;
pub mod dispatcher;
pub mod idempotency;
pub mod poll;
pub mod ports;
pub mod registry;
pub mod worker;

pub use {
    client::BackendClient,
    credentials::AgentCredentials,
    dispatcher::Dispatcher,
    idempotency::IdempotencyCache,
    poll::{PollConfig, run_poll_loop},
    ports::{PortAllocator, PortExhausted},
    registry::{LocalProject, ProjectRegistry, RegistryError},
    worker::{WorkerConfig, WorkerError, WorkerSupervisor},
};
