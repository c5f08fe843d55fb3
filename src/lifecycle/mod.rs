//! Runtime orchestration and lifecycle management.
//!
//! This module contains the pieces an application touches to run agents:
//!
//! - **Dispatcher registry**: Creating, starting, resizing and destroying named dispatchers
//! - **Agent routing**: Creating agents and moving them between dispatchers
//! - **Shutdown coordination**: Draining everything and reporting leftovers
//! - **Observability setup**: Initializing tracing and logging
//!
//! # Main Components
//!
//! - [`Supervisor`] - Owns the dispatchers, the binding table and the event stream
//! - [`setup_tracing`] - Initializes the tracing/logging infrastructure

pub mod supervisor;
pub mod tracing;

pub use self::supervisor::*;
pub use self::tracing::*;
