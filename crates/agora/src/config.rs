use std::{path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::{Error, Result};

pub const DEFAULT_LLM_BASE_URL: &str = "http://127.0.0.1:11434/v1/";
pub const DEFAULT_LLM_API_KEY: &str = "ollama";
pub const DEFAULT_LLM_MODEL: &str = "qwen2.5-coder:3b";
pub const DEFAULT_LLM_TEMPERATURE: f32 = 0.7;

/// API key that marks a local model service able to list and pull models.
pub const LOCAL_SERVICE_API_KEY: &str = "ollama";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base for relative URLs: an absolute URL or a directory path.
    /// Defaults to the current working directory.
    pub root: Option<String>,
    pub protocols: ProtocolsConfig,
    /// Proxy for the `http`/`https` transport.
    pub proxy: Option<String>,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolsConfig {
    pub http: bool,
    pub https: bool,
    pub file: bool,
}

impl Default for ProtocolsConfig {
    fn default() -> Self {
        Self {
            http: true,
            https: true,
            file: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    /// Allow installing a missing model without asking.
    pub autopull: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            api_key: DEFAULT_LLM_API_KEY.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            temperature: DEFAULT_LLM_TEMPERATURE,
            autopull: false,
        }
    }
}

impl LlmConfig {
    #[must_use]
    pub fn is_local_service(&self) -> bool {
        self.api_key == LOCAL_SERVICE_API_KEY
    }

    /// The base URL as a directory, so `./models` resolves beneath it.
    ///
    /// # Errors
    /// Returns [`Error::InvalidUrl`] if `base_url` is not absolute.
    pub fn base(&self) -> Result<Url> {
        let mut base = self.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base).map_err(|e| Error::invalid_url(&self.base_url, e))
    }
}

impl Config {
    /// Defaults overridden by `AGORA_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Config::from_env`] with a custom variable source. Invalid
    /// values are logged and ignored.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let root_source = match lookup("AGORA_ROOT") {
            Some(value) if value.trim().is_empty() => "env_empty",
            Some(value) => {
                config.root = Some(value);
                "env"
            }
            None => "default",
        };
        let proxy_source = match lookup("AGORA_PROXY") {
            Some(value) if !value.trim().is_empty() => {
                config.proxy = Some(value);
                "env"
            }
            _ => "default",
        };

        let http_source = override_flag(&lookup, "AGORA_HTTP", &mut config.protocols.http);
        let https_source = override_flag(&lookup, "AGORA_HTTPS", &mut config.protocols.https);
        let file_source = override_flag(&lookup, "AGORA_FILE", &mut config.protocols.file);

        let llm = &mut config.llm;
        let llm_enabled_source = override_flag(&lookup, "AGORA_LLM_ENABLED", &mut llm.enabled);
        let llm_base_url_source =
            override_value(&lookup, "AGORA_LLM_BASE_URL", &mut llm.base_url);
        let llm_api_key_source = override_value(&lookup, "AGORA_LLM_API_KEY", &mut llm.api_key);
        let llm_model_source = override_value(&lookup, "AGORA_LLM_MODEL", &mut llm.model);
        let llm_temperature_source =
            override_value(&lookup, "AGORA_LLM_TEMPERATURE", &mut llm.temperature);
        let llm_autopull_source = override_flag(&lookup, "AGORA_LLM_AUTOPULL", &mut llm.autopull);

        info!(
            root = config.root.as_deref().unwrap_or("<cwd>"),
            root_source,
            proxy_source,
            http = config.protocols.http,
            http_source,
            https = config.protocols.https,
            https_source,
            file = config.protocols.file,
            file_source,
            llm_enabled = config.llm.enabled,
            llm_enabled_source,
            llm_base_url = %config.llm.base_url,
            llm_base_url_source,
            llm_api_key_source,
            llm_model = %config.llm.model,
            llm_model_source,
            llm_temperature = config.llm.temperature,
            llm_temperature_source,
            llm_autopull = config.llm.autopull,
            llm_autopull_source,
            "Resolved runtime configuration"
        );
        config
    }

    /// The root as an absolute URL. Directory paths get a trailing slash so
    /// relative URLs resolve inside them.
    ///
    /// # Errors
    /// Returns [`Error::InvalidUrl`] if the root is neither a URL nor a usable
    /// path, or [`Error::Io`] if the working directory cannot be read.
    pub fn root_url(&self) -> Result<Url> {
        match self.root.as_deref() {
            None => directory_url(&std::env::current_dir()?),
            Some(root) => match Url::parse(root) {
                Ok(url) if url.scheme().len() > 1 => Ok(url),
                // Single-letter schemes are Windows drive letters.
                _ => directory_url(&std::path::absolute(root)?),
            },
        }
    }
}

fn directory_url(path: &Path) -> Result<Url> {
    Url::from_directory_path(path)
        .map_err(|()| Error::invalid_url(path.display().to_string(), "not an absolute path"))
}

fn override_value<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    value: &mut T,
) -> &'static str
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return "default";
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => {
            *value = parsed;
            "env"
        }
        Err(err) => {
            warn!(%raw, %err, "Invalid {name}; falling back to default");
            "default_invalid_env"
        }
    }
}

fn override_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    value: &mut bool,
) -> &'static str {
    let Some(raw) = lookup(name) else {
        return "default";
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *value = true,
        "0" | "false" | "no" | "off" => *value = false,
        _ => {
            warn!(%raw, "Invalid {name}; falling back to default");
            return "default_invalid_env";
        }
    }
    "env"
}
