//! rampart-template — the Templator.
//!
//! Renders the merged configuration map into the file tree the proxy engine
//! consumes. Templates are discovered by scanning the search path (core
//! template dir plus every plugin's `confs/` folder), categorized by their
//! top-level folder, and rendered in two passes: one global pass, then one
//! pass per site. A render error aborts the whole pass before anything is
//! written, so a partial artifact tree is never left behind.

pub mod funcs;
pub mod templator;

pub use templator::{TemplateError, TemplateResult, Templator};
