//! Shared domain types for the SignalZero kernel.
//!
//! Everything that crosses a crate boundary lives here: the symbol and
//! domain model, context sessions and turns, traces, agents, test sets,
//! users and auth contexts, the provider-agnostic tool/message types,
//! configuration, and the error taxonomy.

pub mod agent;
pub mod auth;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod stamp;
pub mod symbol;
pub mod testset;
pub mod tool;
pub mod trace;
pub mod user;

pub use error::{Error, Result};
