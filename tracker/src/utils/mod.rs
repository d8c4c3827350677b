//! Shared utilities.
//!
//! - [`debounce`]: keyed request coalescing with cancellation, used for
//!   delayed checklist saves

pub mod debounce;

pub use debounce::{Debouncer, DebouncerError, DEFAULT_DEBOUNCE_MS};
