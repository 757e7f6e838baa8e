//! # Telemetry Engine Module
//!
//! A self-contained sensor telemetry service: a periodic reading generator, a
//! bounded persisted history, and a realtime fan-out to WebSocket subscribers
//! who can in turn steer the simulated speed.
//!
//! ## Components:
//!
//! - **`generator`**: builds one reading per tick from the control value,
//!   persists it and hands it to the fanout through a bounded buffer.
//! - **`control`**: the shared, clamped speed setting.
//! - **`store`**: the append/latest/history/trim contract with in-memory and
//!   SQLite backends.
//! - **`trimmer`**: periodic retention down to the newest rows.
//! - **`registry`**: the live subscriber set.
//! - **`fanout`**: delivery of each reading to every subscriber, pruning
//!   broken ones.
//! - **`gateway`**: WebSocket attach, history replay and inbound control
//!   messages.
//! - **`http`**: the latest/history queries and the router.
//! - **`engine`**: the shared context and task supervision.

#![forbid(unsafe_code)]

pub mod config;
pub mod control;
pub mod engine;
pub mod fanout;
pub mod gateway;
pub mod generator;
pub mod http;
pub mod reading;
pub mod registry;
pub mod store;
pub mod trimmer;

pub use config::{ConfigError, EngineConfig};
pub use control::{ControlBounds, ControlParameter};
pub use engine::{AppContext, Engine};
pub use http::router;
pub use reading::Reading;
pub use registry::{ClientRegistry, DeliveryError};
pub use store::{MemoryStore, ReadingStore, SqliteStore, Store, StoreError};
