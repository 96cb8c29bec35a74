//! rampartd — daemon wiring.
//!
//! The binary itself lives in `main.rs`; the apply pipeline is exported
//! here so integration tests can drive the full merge → render → persist
//! path without a running platform.

pub mod pipeline;
