//! Generated configuration files pushed to hosts.
//!
//! The local settings file is rendered with `minijinja` from the deployment
//! configuration. A built-in template is used unless the environment names
//! its own with `settings_template`; relative template paths are resolved
//! against the directory of the configuration file. Templates get a
//! `pyrepr` filter that writes values as Python literals.
//!
//! The worker configuration is plain YAML serialized with `serde_yaml`.

use indexmap::IndexMap;
use minijinja::Environment;
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

use crate::config::{expand, DeploymentConfig};
use crate::error::{Error, Result};

const LOCAL_SETTINGS_TEMPLATE: &str = r#"# Generated by rollout for the '{{ label }}' environment ({{ git_tag }}). Do not edit.
import os

CONFIGURATION = {{ configuration | pyrepr }}
SERVER_NAME = {{ server_name | pyrepr }}
HTTP_PORT = {{ http_port }}
MAINTENANCE_MODE = os.environ.get('MAINTENANCE_MODE', '0') == '1'

DATABASES = {
    'default': {
        'ENGINE': 'django.db.backends.mysql',
        'NAME': {{ database.name | pyrepr }},
        'USER': {{ database.user | pyrepr }},
        'PASSWORD': {{ database.password | pyrepr }},
        'HOST': 'localhost',
        'PORT': '3306',
    }
}
{% for key, value in settings | items %}
{{ key | upper }} = {{ value | pyrepr }}
{%- endfor %}
"#;

const WORKER_CONFIG_HEADER: &str = "# Generated by rollout. Do not edit.\n";

#[derive(Debug, Serialize)]
struct DatabaseContext<'a> {
    name: &'a str,
    user: &'a str,
    password: String,
}

#[derive(Debug, Serialize)]
struct SettingsContext<'a> {
    label: &'a str,
    git_tag: &'a str,
    configuration: &'a str,
    server_name: String,
    http_port: u16,
    database: DatabaseContext<'a>,
    settings: &'a IndexMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WorkerConfig<'a> {
    label: &'a str,
    server_name: String,
    git_tag: &'a str,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Write `value` as a Python literal
fn python_literal(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Null => out.push_str("None"),
        serde_json::Value::Bool(true) => out.push_str("True"),
        serde_json::Value::Bool(false) => out.push_str("False"),
        serde_json::Value::Number(n) => out.push_str(&n.to_string()),
        // JSON string escapes are valid in Python string literals
        serde_json::Value::String(s) => out.push_str(&serde_json::Value::String(s.clone()).to_string()),
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                python_literal(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push_str(": ");
                python_literal(item, out);
            }
            out.push('}');
        }
    }
}

fn pyrepr(value: minijinja::Value) -> std::result::Result<String, minijinja::Error> {
    let json = serde_json::to_value(&value).map_err(|e| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("value cannot be written as a Python literal: {}", e),
        )
    })?;
    let mut out = String::new();
    python_literal(&json, &mut out);
    Ok(out)
}

fn template_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_filter("pyrepr", pyrepr);
    env
}

/// Render the local settings file for `config`.
///
/// Fails with [`crate::Error::MissingSecret`] when the database password
/// cannot be resolved.
pub fn render_local_settings(config: &DeploymentConfig) -> Result<String> {
    let env = &config.environment;
    let context = SettingsContext {
        label: config.label(),
        git_tag: config.git_tag(),
        configuration: &env.configuration,
        server_name: config.server_name(),
        http_port: env.http_port,
        database: DatabaseContext {
            name: &env.database.name,
            user: &env.database.user,
            password: config.secret(&env.database.password)?,
        },
        settings: &env.settings,
    };

    let source = match template_path(config)? {
        Some(path) => {
            debug!(path = %path.display(), "Rendering local settings from custom template");
            std::fs::read_to_string(&path)?
        }
        None => LOCAL_SETTINGS_TEMPLATE.to_string(),
    };

    Ok(template_env().render_str(&source, context)?)
}

/// Render the configuration file written to compute workers.
///
/// Values under `settings.worker` are added as extra keys.
pub fn render_worker_config(config: &DeploymentConfig) -> Result<String> {
    let extra = match config.environment.settings.get("worker") {
        None => serde_json::Map::new(),
        Some(serde_json::Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(Error::Config(
                "settings.worker must be a table of worker options".to_string(),
            ))
        }
    };
    let worker = WorkerConfig {
        label: config.label(),
        server_name: config.server_name(),
        git_tag: config.git_tag(),
        extra,
    };
    Ok(format!("{}{}", WORKER_CONFIG_HEADER, serde_yaml::to_string(&worker)?))
}

fn template_path(config: &DeploymentConfig) -> Result<Option<PathBuf>> {
    let Some(raw) = &config.environment.settings_template else {
        return Ok(None);
    };
    let path = expand(raw)?;
    if path.is_absolute() {
        return Ok(Some(path));
    }
    let base = config.path().parent().map(PathBuf::from).unwrap_or_default();
    Ok(Some(base.join(path)))
}
