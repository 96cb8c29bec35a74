//! Two-pass template rendering.
//!
//! The global pass renders top-level templates once against the full
//! configuration. The site pass renders the site categories once per site
//! (multisite) or once total (single-site), against an overlay where the
//! site's prefixed keys shadow the globals. Every output is rendered into
//! memory first and only written once the whole pass succeeded.

use std::collections::BTreeMap;
use std::path::PathBuf;

use minijinja::{Environment, Value};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use rampart_config::ConfigMap;

use crate::funcs;

/// Result alias for render operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Template folders rendered once per site. Anything else with a folder
/// prefix belongs to another tool and is skipped.
const SITE_CATEGORIES: &[&str] = &["server-http", "server-stream", "modsec", "modsec-crs"];

/// Context keys synthesized for rendering; never written to the
/// `variables.env` dumps.
const SYNTHESIZED: &[&str] = &["FIRST_SERVER", "OUTPUT_PREFIX"];

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read template {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to render template {template}: {source}")]
    Render {
        template: String,
        source: minijinja::Error,
    },

    #[error("failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Renders the merged configuration into the proxy artifact tree.
pub struct Templator<'a> {
    templates: PathBuf,
    plugin_dirs: Vec<PathBuf>,
    output: PathBuf,
    /// Path prefix used *inside* rendered files; differs from `output` when
    /// the proxy reads the tree from another filesystem namespace.
    target: PathBuf,
    config: &'a ConfigMap,
}

impl<'a> Templator<'a> {
    pub fn new(
        templates: impl Into<PathBuf>,
        plugin_dirs: Vec<PathBuf>,
        output: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        config: &'a ConfigMap,
    ) -> Self {
        Self {
            templates: templates.into(),
            plugin_dirs,
            output: output.into(),
            target: target.into(),
            config,
        }
    }

    /// Render everything. On error nothing has been written.
    pub fn render(&self) -> TemplateResult<()> {
        let sources = self.discover()?;
        let env = build_env(&sources)?;

        let globals: Vec<&str> = sources
            .keys()
            .filter(|name| !name.contains('/'))
            .map(String::as_str)
            .collect();
        let site_templates: Vec<&str> = SITE_CATEGORIES
            .iter()
            .flat_map(|cat| {
                sources
                    .keys()
                    .filter(move |name| name.starts_with(&format!("{cat}/")))
                    .map(String::as_str)
            })
            .collect();

        let mut outputs: Vec<(PathBuf, String)> = Vec::new();

        // Global pass.
        let multisite = self.config.get("MULTISITE").map(String::as_str) == Some("yes");
        let sites = self.sites(multisite);
        outputs.push((
            self.output.join("variables.env"),
            dump_env(self.config, &sites),
        ));
        let global_ctx = context_value(self.config);
        for name in &globals {
            let rendered = render_one(&env, name, &global_ctx)?;
            outputs.push((self.output.join(name), rendered));
        }

        // Site pass.
        if multisite {
            for site in &sites {
                let overlay = self.site_overlay(site, multisite);
                outputs.push((
                    self.output.join(site).join("variables.env"),
                    dump_env(&overlay, &sites),
                ));
                let ctx = context_value(&overlay);
                for name in &site_templates {
                    let rendered = render_one(&env, name, &ctx)?;
                    outputs.push((self.output.join(site).join(name), rendered));
                }
            }
        } else {
            let overlay = self.site_overlay("", multisite);
            let ctx = context_value(&overlay);
            for name in &site_templates {
                let rendered = render_one(&env, name, &ctx)?;
                outputs.push((self.output.join(name), rendered));
            }
        }

        // Write phase: everything rendered, nothing can fail but I/O now.
        for (path, content) in outputs {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| TemplateError::Write {
                    path: path.clone(),
                    source,
                })?;
            }
            std::fs::write(&path, content).map_err(|source| TemplateError::Write {
                path: path.clone(),
                source,
            })?;
        }
        debug!(output = %self.output.display(), "artifact tree rendered");
        Ok(())
    }

    /// Scan the search path: the core template dir plus every plugin's
    /// `confs/` folder. First occurrence of a name wins, so core templates
    /// shadow plugin templates of the same name.
    fn discover(&self) -> TemplateResult<BTreeMap<String, String>> {
        let mut roots = vec![self.templates.clone()];
        for dir in &self.plugin_dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut confs: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path().join("confs"))
                .filter(|p| p.is_dir())
                .collect();
            confs.sort();
            roots.extend(confs);
        }

        let mut sources = BTreeMap::new();
        for root in &roots {
            for entry in WalkDir::new(root).into_iter().flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(root) else {
                    continue;
                };
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if let Some(folder) = name.split_once('/').map(|(f, _)| f) {
                    if !SITE_CATEGORIES.contains(&folder) {
                        continue;
                    }
                }
                if sources.contains_key(&name) {
                    warn!(template = %name, root = %root.display(), "shadowed by an earlier search path entry");
                    continue;
                }
                let content = std::fs::read_to_string(entry.path()).map_err(|source| {
                    TemplateError::Read {
                        path: entry.path().to_path_buf(),
                        source,
                    }
                })?;
                sources.insert(name, content);
            }
        }
        Ok(sources)
    }

    fn sites(&self, multisite: bool) -> Vec<String> {
        if !multisite {
            return Vec::new();
        }
        self.config
            .get("SERVER_NAME")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// The per-site view: prefixed keys unprefixed over the globals, plus
    /// the synthesized context values. Computed fresh per site; the shared
    /// map is never mutated.
    fn site_overlay(&self, site: &str, multisite: bool) -> ConfigMap {
        let mut overlay = self.config.clone();
        if multisite {
            let prefix = format!("{site}_");
            for (key, value) in self.config.range(prefix.clone()..) {
                let Some(rest) = key.strip_prefix(&prefix) else {
                    break;
                };
                overlay.insert(rest.to_string(), value.clone());
            }
            if !self.config.contains_key(&format!("{site}_SERVER_NAME")) {
                overlay.insert("SERVER_NAME".into(), site.to_string());
            }
        }

        let first_server = overlay
            .get("SERVER_NAME")
            .and_then(|s| s.split_whitespace().next())
            .unwrap_or(site)
            .to_string();
        // Per-site document root, unless the site set its own.
        if multisite && !self.config.contains_key(&format!("{site}_ROOT_FOLDER")) {
            if let Some(root) = self.config.get("ROOT_FOLDER") {
                overlay.insert("ROOT_FOLDER".into(), format!("{root}/{first_server}"));
            }
        }
        let output_prefix = if multisite {
            format!("{}/{site}/", self.target.display())
        } else {
            format!("{}/", self.target.display())
        };
        overlay.insert("FIRST_SERVER".into(), first_server);
        overlay.insert("OUTPUT_PREFIX".into(), output_prefix);
        overlay
    }
}

fn build_env(sources: &BTreeMap<String, String>) -> TemplateResult<Environment<'static>> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_keep_trailing_newline(true);
    env.add_function("has_variable", funcs::has_variable);
    env.add_function("is_custom_conf", funcs::is_custom_conf);
    env.add_function("random", funcs::random);
    env.add_function("read_lines", funcs::read_lines);
    env.add_function("salted_hash", funcs::salted_hash);
    for (name, source) in sources {
        env.add_template_owned(name.clone(), source.clone())
            .map_err(|source| TemplateError::Render {
                template: name.clone(),
                source,
            })?;
    }
    Ok(env)
}

fn render_one(env: &Environment<'_>, name: &str, ctx: &Value) -> TemplateResult<String> {
    let template = env
        .get_template(name)
        .map_err(|source| TemplateError::Render {
            template: name.to_string(),
            source,
        })?;
    template.render(ctx).map_err(|source| TemplateError::Render {
        template: name.to_string(),
        source,
    })
}

/// Template context: every configuration key as a top-level variable, plus
/// `all` carrying the whole map for the lookup helpers.
fn context_value(config: &ConfigMap) -> Value {
    let mut ctx: BTreeMap<String, Value> = config
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(v.clone())))
        .collect();
    ctx.insert("all".into(), Value::from_serialize(config));
    Value::from_serialize(&ctx)
}

/// `variable=value` dump for one scope. Site-prefixed keys never appear in
/// a dump (each site's values are already unprefixed in its overlay), and
/// synthesized context keys are excluded.
fn dump_env(config: &ConfigMap, sites: &[String]) -> String {
    config
        .iter()
        .filter(|(key, _)| {
            !SYNTHESIZED.contains(&key.as_str())
                && !sites.iter().any(|s| key.starts_with(&format!("{s}_")))
        })
        .map(|(key, value)| format!("{key}={value}\n"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn write_template(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn multisite_render_produces_per_site_trees() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        let out = dir.path().join("out");
        write_template(&templates, "main.conf", "sites: {{ SERVER_NAME }}\n");
        write_template(
            &templates,
            "server-http/server.conf",
            "server {{ FIRST_SERVER }} bar={{ BAR }}\n",
        );

        let cfg = config(&[
            ("MULTISITE", "yes"),
            ("SERVER_NAME", "a.com b.com"),
            ("BAR", "global"),
            ("a.com_SERVER_NAME", "a.com"),
            ("a.com_BAR", "hello"),
            ("b.com_SERVER_NAME", "b.com"),
            ("b.com_BAR", "global"),
        ]);
        Templator::new(&templates, vec![], &out, "/etc/proxy", &cfg)
            .render()
            .unwrap();

        let main = std::fs::read_to_string(out.join("main.conf")).unwrap();
        assert_eq!(main, "sites: a.com b.com\n");
        let a = std::fs::read_to_string(out.join("a.com/server-http/server.conf")).unwrap();
        assert_eq!(a, "server a.com bar=hello\n");
        // The b.com overlay must not see a.com's value.
        let b = std::fs::read_to_string(out.join("b.com/server-http/server.conf")).unwrap();
        assert_eq!(b, "server b.com bar=global\n");
    }

    #[test]
    fn env_dumps_filter_prefixed_and_synthesized_keys() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        let out = dir.path().join("out");

        let cfg = config(&[
            ("MULTISITE", "yes"),
            ("SERVER_NAME", "a.com"),
            ("BAR", "global"),
            ("a.com_SERVER_NAME", "a.com"),
            ("a.com_BAR", "hello"),
        ]);
        Templator::new(&templates, vec![], &out, "/etc/proxy", &cfg)
            .render()
            .unwrap();

        let global = std::fs::read_to_string(out.join("variables.env")).unwrap();
        assert!(global.contains("BAR=global\n"));
        assert!(!global.contains("a.com_BAR"));

        let site = std::fs::read_to_string(out.join("a.com/variables.env")).unwrap();
        assert!(site.contains("BAR=hello\n"));
        assert!(site.contains("SERVER_NAME=a.com\n"));
        assert!(!site.contains("a.com_BAR"));
        assert!(!site.contains("FIRST_SERVER"));
        assert!(!site.contains("OUTPUT_PREFIX"));
    }

    #[test]
    fn single_site_renders_site_templates_at_root() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        let out = dir.path().join("out");
        write_template(
            &templates,
            "server-http/server.conf",
            "root {{ OUTPUT_PREFIX }}\n",
        );

        let cfg = config(&[("MULTISITE", "no"), ("SERVER_NAME", "www.example.com")]);
        Templator::new(&templates, vec![], &out, "/etc/proxy", &cfg)
            .render()
            .unwrap();

        let rendered = std::fs::read_to_string(out.join("server-http/server.conf")).unwrap();
        assert_eq!(rendered, "root /etc/proxy/\n");
    }

    #[test]
    fn render_error_leaves_no_partial_tree() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        let out = dir.path().join("out");
        write_template(&templates, "good.conf", "fine\n");
        write_template(&templates, "bad.conf", "{% broken\n");

        let cfg = config(&[("SERVER_NAME", "www.example.com")]);
        let err = Templator::new(&templates, vec![], &out, "/etc/proxy", &cfg)
            .render()
            .unwrap_err();
        assert!(matches!(err, TemplateError::Render { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn plugin_confs_join_the_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        let plugins = dir.path().join("plugins");
        write_template(
            &plugins.join("gzip/confs"),
            "server-http/gzip.conf",
            "gzip {{ USE_GZIP }};\n",
        );
        let out = dir.path().join("out");

        let cfg = config(&[("SERVER_NAME", "www.example.com"), ("USE_GZIP", "on")]);
        Templator::new(&templates, vec![plugins], &out, "/etc/proxy", &cfg)
            .render()
            .unwrap();

        let rendered = std::fs::read_to_string(out.join("server-http/gzip.conf")).unwrap();
        assert_eq!(rendered, "gzip on;\n");
    }

    #[test]
    fn rerender_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("templates");
        let out = dir.path().join("out");
        write_template(&templates, "main.conf", "{{ SERVER_NAME }}\n");

        let cfg = config(&[("MULTISITE", "yes"), ("SERVER_NAME", "a.com"), ("X", "1")]);
        let templator = Templator::new(&templates, vec![], &out, "/etc/proxy", &cfg);
        templator.render().unwrap();
        let first = std::fs::read_to_string(out.join("variables.env")).unwrap();
        templator.render().unwrap();
        let second = std::fs::read_to_string(out.join("variables.env")).unwrap();
        assert_eq!(first, second);
    }
}
