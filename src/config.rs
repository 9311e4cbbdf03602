//! Configuration management

use std::{
    collections::{BTreeMap, HashMap},
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::virtual_server::CustomPrompt;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before `${VAR}` expansion.
    /// Paths support ~ expansion; later files override earlier ones.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Prompt resolution limits
    pub resolution: ResolutionConfig,
    /// Lazy reconnect backoff
    pub reconnect: ReconnectConfig,
    /// Backend authorization flow
    pub auth: AuthConfig,
    /// Blob storage for custom resources
    pub blobs: BlobConfig,
    /// Virtual servers served by this gateway
    pub virtual_servers: Vec<VirtualServerConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("VMCP_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in backend headers, OAuth
    /// secrets and virtual server environment variables.
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        for server in &mut self.virtual_servers {
            for value in server.environment_variables.values_mut() {
                *value = expand_string(&re, value);
            }
            for backend in server.backends.values_mut() {
                for value in backend.headers.values_mut() {
                    *value = expand_string(&re, value);
                }
                for value in backend.env.values_mut() {
                    *value = expand_string(&re, value);
                }
                if let Some(secret) = backend
                    .oauth
                    .as_mut()
                    .and_then(|o| o.client_secret.as_mut())
                {
                    *secret = expand_string(&re, secret);
                }
            }
        }
        Ok(())
    }

    /// Reject definitions the engine cannot serve.
    fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for server in &self.virtual_servers {
            if server.name.is_empty() {
                return Err(Error::Config("virtual server without a name".into()));
            }
            if !names.insert(server.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate virtual server '{}'",
                    server.name
                )));
            }
            let mut prompts = std::collections::HashSet::new();
            for prompt in &server.prompts {
                if !prompts.insert(prompt.name.as_str()) {
                    return Err(Error::Config(format!(
                        "duplicate prompt '{}' in virtual server '{}'",
                        prompt.name, server.name
                    )));
                }
            }
            for (name, backend) in &server.backends {
                if name.contains('.') {
                    return Err(Error::Config(format!(
                        "backend name '{name}' must not contain '.'"
                    )));
                }
                if name == crate::virtual_server::LOCAL_SCHEME {
                    return Err(Error::Config(format!(
                        "backend name '{name}' is reserved for virtual server resources"
                    )));
                }
                if let TransportConfig::Http { http_url, .. } = &backend.transport {
                    url::Url::parse(http_url).map_err(|e| {
                        Error::Config(format!("backend '{name}': invalid http_url: {e}"))
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Look up a virtual server definition by name
    #[must_use]
    pub fn virtual_server(&self, name: &str) -> Option<&VirtualServerConfig> {
        self.virtual_servers.iter().find(|s| s.name == name)
    }
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
        _ => path.to_string(),
    }
}

fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures<'_>| {
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(&caps[1]).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Externally reachable base URL; the auth redirect URI is
    /// `<public_url>/callback`. Defaults to `http://<host>:<port>`.
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(120),
            public_url: None,
        }
    }
}

impl ServerConfig {
    /// Externally reachable base URL, without a trailing slash
    #[must_use]
    pub fn base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// Redirect URI registered with backend authorization servers
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!("{}/callback", self.base_url())
    }
}

/// Prompt resolution limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Maximum `@prompt` nesting depth
    pub max_depth: usize,
    /// Wall-clock bound on one top-level resolution
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Lazy reconnect backoff for failed backends
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Wait after the first failure
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound on the wait
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Backend authorization flow
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Lifetime of a pending `state` token
    #[serde(with = "humantime_serde")]
    pub state_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(600),
        }
    }
}

/// Blob storage for custom resource content
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Directory for the filesystem store; in-memory when unset
    pub dir: Option<PathBuf>,
}

/// One virtual server definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualServerConfig {
    /// Identity, used in the endpoint path
    pub name: String,
    /// Human-readable name
    pub display_name: Option<String>,
    /// Owner-set config values readable through `@config`
    pub environment_variables: HashMap<String, String>,
    /// Composed backends by name
    pub backends: BTreeMap<String, BackendConfig>,
    /// Composite prompts
    pub prompts: Vec<CustomPrompt>,
    /// Files exposed as virtual-server-local resources
    pub resources: Vec<ResourceSeed>,
}

/// A file loaded into the blob store at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSeed {
    /// Source file
    pub path: PathBuf,
    /// Exposed filename; defaults to the file's name
    #[serde(default)]
    pub filename: Option<String>,
    /// MIME type; guessed from the extension when unset
    #[serde(default)]
    pub content_type: Option<String>,
}

impl ResourceSeed {
    /// Name the seed is exposed under
    #[must_use]
    pub fn exposed_name(&self) -> Option<String> {
        self.filename.clone().or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
    }
}

/// Backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Human-readable description
    pub description: String,
    /// Whether backend is enabled
    pub enabled: bool,
    /// Transport type
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Request timeout for this backend
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Environment variables (for stdio)
    pub env: HashMap<String, String>,
    /// HTTP headers (for http)
    pub headers: HashMap<String, String>,
    /// Issue at most one request at a time on this connection
    pub serialize_calls: bool,
    /// Delegated authorization (optional)
    pub oauth: Option<OAuthConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            enabled: true,
            transport: TransportConfig::default(),
            timeout: Duration::from_secs(30),
            env: HashMap::new(),
            headers: HashMap::new(),
            serialize_calls: false,
            oauth: None,
        }
    }
}

/// OAuth authorization-code configuration for a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Authorization endpoint; discovered from the backend when unset
    pub authorization_endpoint: Option<String>,
    /// Token endpoint; discovered from the backend when unset
    pub token_endpoint: Option<String>,
    /// Registered client id
    pub client_id: Option<String>,
    /// Client secret for confidential clients
    pub client_secret: Option<String>,
    /// Scopes to request
    pub scopes: Vec<String>,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportConfig {
    /// Stdio transport (subprocess)
    Stdio {
        /// Command line, split with shell quoting rules
        command: String,
        /// Working directory
        #[serde(default)]
        cwd: Option<String>,
    },
    /// HTTP transport
    Http {
        /// HTTP URL
        http_url: String,
        /// Use Streamable HTTP (direct POST, no SSE handshake)
        #[serde(default)]
        streamable_http: bool,
        /// Override protocol version
        #[serde(default)]
        protocol_version: Option<String>,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Http {
            http_url: String::new(),
            streamable_http: false,
            protocol_version: None,
        }
    }
}

impl TransportConfig {
    /// Get transport type name
    #[must_use]
    pub fn transport_type(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http {
                streamable_http: true,
                ..
            } => "streamable-http",
            Self::Http { .. } => "sse",
        }
    }
}

/// Duration serde in the `"30s"`, `"5m"`, `"100ms"` style
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"1h"`; bare numbers are seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse().map(Duration::from_secs)
        }
    }
}
