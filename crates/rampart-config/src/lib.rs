//! rampart-config — the Configurator.
//!
//! Turns static setting descriptors plus user overrides into one validated
//! flat configuration map. Descriptors come from a base schema file and
//! from every feature module's `plugin.json`; overrides are validated
//! against their descriptor's pattern and dropped (with a warning) when
//! they do not match. In multisite mode every site gets a fully populated
//! `<site>_` namespace, defaulting to the global values.

pub mod configurator;
pub mod schema;

pub use configurator::{ConfigMap, Configurator, MergeOutput, MergeWarning, WarnReason};
pub use schema::{Schema, SchemaError};
