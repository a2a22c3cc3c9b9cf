//! Shared test utilities for revtree crates.
//!
//! - [`TestDir`] - Managed temporary directory with a default store path
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`strategies`] - Proptest strategies for names, values and edit scripts
//! - [`CrashInjector`] - Deterministic failure points for the commit protocol

#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod test_dir;
pub use test_dir::{STORE_FILE_NAME, TestDir};

mod assertions;
pub use assertions::assert_eventually;

mod crash_injector;
pub use crash_injector::{CrashInjector, CrashPoint};

pub mod strategies;
