//! Functions exposed to every template.
//!
//! All of these are pure functions of their arguments except `read_lines`
//! and `is_custom_conf`, which are the two explicit filesystem helpers
//! templates use for static includes and aux-config probing.

use std::path::Path;

use minijinja::Value;
use rand::distributions::Alphanumeric;
use rand::Rng;

use rampart_core::hash::sha256_hex;

/// True when `variable` carries `value`, either globally or under any
/// site's `<site>_` prefix when multisite is active.
pub fn has_variable(all: Value, variable: String, value: Value) -> bool {
    if attr(&all, &variable) == Some(value.clone()) {
        return true;
    }
    if attr_str(&all, "MULTISITE").as_deref() != Some("yes") {
        return false;
    }
    let server_name = attr_str(&all, "SERVER_NAME").unwrap_or_default();
    server_name
        .split_whitespace()
        .any(|site| attr(&all, &format!("{site}_{variable}")) == Some(value.clone()))
}

/// True when the directory holds at least one user-supplied `.conf` file.
pub fn is_custom_conf(path: String) -> bool {
    let Ok(entries) = std::fs::read_dir(Path::new(&path)) else {
        return false;
    };
    entries.flatten().any(|e| {
        e.path().extension().map(|ext| ext == "conf").unwrap_or(false) && e.path().is_file()
    })
}

/// Random alphanumeric string, used for placeholder secrets.
pub fn random(nb: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(nb)
        .map(char::from)
        .collect()
}

/// Lines of a file, or an empty list when it does not exist.
pub fn read_lines(file: String) -> Vec<String> {
    std::fs::read_to_string(Path::new(&file))
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Hex sha256 of `salt` prepended to `value`, for credential fields.
pub fn salted_hash(value: String, salt: String) -> String {
    sha256_hex(format!("{salt}{value}").as_bytes())
}

fn attr(all: &Value, key: &str) -> Option<Value> {
    match all.get_attr(key) {
        Ok(v) if !v.is_undefined() => Some(v),
        _ => None,
    }
}

fn attr_str(all: &Value, key: &str) -> Option<String> {
    attr(all, key).map(|v| v.to_string())
}
