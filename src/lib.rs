//! Snare - request interception and script evaluation over a rendering engine
//!
//! Loads pages in a headless engine, captures the requests they issue through
//! a bounded filter, and polls scripts until they produce a value. One engine
//! instance is pooled per process and driven from a dedicated thread.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::multiple_crate_versions
)]

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod pool;
pub mod predicate;
pub mod request;
pub mod session;

pub use capture::InterceptionConfig;
pub use config::Config;
pub use error::{Result, SnareError};
pub use extractor::Extractor;
pub use request::InterceptedRequest;
