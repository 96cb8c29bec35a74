//! Label and annotation conventions.
//!
//! Every platform backend marks its objects the same way, modulo the
//! namespace prefix: `rampart.` for docker/swarm labels, `rampart.io/`
//! for kubernetes annotations. The extraction rules are compiled once and
//! shared so the backends cannot drift apart.

use std::sync::LazyLock;

use regex::Regex;

/// Marks an object as a proxy instance.
pub const INSTANCE_MARKER: &str = "INSTANCE";
/// Marks an object as a site definition.
pub const SERVER_NAME_MARKER: &str = "SERVER_NAME";
/// Swarm config objects carry their target folder under this key.
pub const CONFIG_TYPE_MARKER: &str = "CONFIG_TYPE";
/// Swarm config objects may scope themselves to one site.
pub const CONFIG_SITE_MARKER: &str = "CONFIG_SITE";

/// Auxiliary config folders a backend may target. Keep `MODSEC_CRS` ahead
/// of `MODSEC` in the alternation so the longer tag wins.
static CUSTOM_CONF_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^CUSTOM_CONF_(SERVER_HTTP|SERVER_STREAM|MODSEC_CRS|MODSEC)_(.+)$").unwrap()
});

/// One platform's label namespace.
#[derive(Debug, Clone, Copy)]
pub struct LabelConvention {
    prefix: &'static str,
}

/// Docker and swarm label namespace.
pub const DOCKER_LABELS: LabelConvention = LabelConvention { prefix: "rampart." };
/// Kubernetes annotation namespace.
pub const K8S_ANNOTATIONS: LabelConvention = LabelConvention {
    prefix: "rampart.io/",
};

impl LabelConvention {
    /// The fully-qualified form of a marker, e.g. `rampart.INSTANCE`.
    pub fn qualify(&self, marker: &str) -> String {
        format!("{}{marker}", self.prefix)
    }

    /// Strip the namespace prefix; `None` when the key belongs to someone
    /// else.
    pub fn setting<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix)
    }

    /// Parse an auxiliary-config key into its target folder and file name,
    /// e.g. `rampart.CUSTOM_CONF_MODSEC_CRS_overrides` into
    /// `("modsec-crs", "overrides")`.
    pub fn custom_conf(&self, key: &str) -> Option<(String, String)> {
        let bare = self.setting(key)?;
        let captures = CUSTOM_CONF_RX.captures(bare)?;
        let conf_type = captures[1].to_lowercase().replace('_', "-");
        Some((conf_type, captures[2].to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_markers() {
        assert_eq!(DOCKER_LABELS.qualify(INSTANCE_MARKER), "rampart.INSTANCE");
        assert_eq!(
            K8S_ANNOTATIONS.qualify(SERVER_NAME_MARKER),
            "rampart.io/SERVER_NAME"
        );
    }

    #[test]
    fn setting_strips_only_own_namespace() {
        assert_eq!(DOCKER_LABELS.setting("rampart.USE_GZIP"), Some("USE_GZIP"));
        assert_eq!(DOCKER_LABELS.setting("traefik.enable"), None);
        assert_eq!(
            K8S_ANNOTATIONS.setting("rampart.io/USE_GZIP"),
            Some("USE_GZIP")
        );
    }

    #[test]
    fn custom_conf_parses_type_and_name() {
        assert_eq!(
            DOCKER_LABELS.custom_conf("rampart.CUSTOM_CONF_SERVER_HTTP_my-rules"),
            Some(("server-http".to_string(), "my-rules".to_string()))
        );
        // The longer tag must win over its prefix.
        assert_eq!(
            DOCKER_LABELS.custom_conf("rampart.CUSTOM_CONF_MODSEC_CRS_overrides"),
            Some(("modsec-crs".to_string(), "overrides".to_string()))
        );
        assert_eq!(
            DOCKER_LABELS.custom_conf("rampart.CUSTOM_CONF_MODSEC_tweaks"),
            Some(("modsec".to_string(), "tweaks".to_string()))
        );
        assert_eq!(DOCKER_LABELS.custom_conf("rampart.USE_GZIP"), None);
    }
}
