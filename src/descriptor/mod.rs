//! Server descriptor store: validated, immutable records of capability servers.

pub mod secrets;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::config::{HostConfig, ServerEntry};
use crate::error::{Result, ToolHostError};

/// One configured capability server.
///
/// Header values are fully resolved; `Debug` output never shows them.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    name: String,
    endpoint: Url,
    headers: Vec<(String, String)>,
    instruction: String,
    fingerprint: String,
}

impl fmt::Debug for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("ServerDescriptor")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint.as_str())
            .field("headers", &header_names)
            .field("instruction", &self.instruction)
            .finish()
    }
}

impl ServerDescriptor {
    /// Build a descriptor from already-resolved parts.
    ///
    /// Any placeholder left in a header value is a configuration error.
    pub fn new(
        name: impl Into<String>,
        endpoint: &str,
        headers: Vec<(String, String)>,
        instruction: impl Into<String>,
    ) -> Result<Self> {
        let name = validate_name(name.into())?;
        for (header, value) in &headers {
            let missing = secrets::unresolved_placeholders(value);
            if !missing.is_empty() {
                return Err(ToolHostError::Configuration(format!(
                    "server '{name}': header '{header}' has unresolved secret placeholder(s): {}",
                    missing.join(", ")
                )));
            }
        }
        Self::build(name, endpoint, headers, instruction.into())
    }

    /// Header values here have already been substituted; a secret may itself
    /// contain placeholder-like text.
    fn build(
        name: String,
        endpoint: &str,
        headers: Vec<(String, String)>,
        instruction: String,
    ) -> Result<Self> {
        let name = validate_name(name)?;
        let endpoint = parse_endpoint(&name, endpoint)?;
        for (header, value) in &headers {
            validate_header(&name, header, value)?;
        }

        let instruction = instruction.trim().to_string();
        let fingerprint = fingerprint(&name, &endpoint, &headers, &instruction);
        Ok(Self {
            name,
            endpoint,
            headers,
            instruction,
            fingerprint,
        })
    }

    /// Build a descriptor from a config entry, resolving header placeholders
    /// through `lookup`.
    pub fn from_entry(
        name: &str,
        entry: &ServerEntry,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut headers = Vec::with_capacity(entry.headers.len());
        for (header, value) in &entry.headers {
            let raw = value.as_str().ok_or_else(|| {
                ToolHostError::Configuration(format!(
                    "server '{name}': header '{header}' must be a string"
                ))
            })?;
            let resolved = secrets::resolve_placeholders(raw, lookup).map_err(|missing| {
                ToolHostError::Configuration(format!(
                    "server '{name}': header '{header}' references unset variable(s): {}",
                    missing.join(", ")
                ))
            })?;
            headers.push((header.clone(), resolved));
        }
        Self::build(
            name.to_string(),
            &entry.endpoint,
            headers,
            entry.instruction.clone(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// URI scheme used to pick a transport.
    pub fn scheme(&self) -> &str {
        self.endpoint.scheme()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Stable digest of every field; equal fingerprints mean an unchanged server.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn validate_name(name: String) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ToolHostError::Configuration(
            "server name must not be empty".into(),
        ));
    }
    if trimmed.chars().any(|c| c.is_whitespace() || c == '.') {
        return Err(ToolHostError::Configuration(format!(
            "server name '{trimmed}' must not contain whitespace or '.'"
        )));
    }
    Ok(trimmed.to_string())
}

fn parse_endpoint(name: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| {
        ToolHostError::Configuration(format!("server '{name}': malformed endpoint '{raw}': {e}"))
    })?;
    if matches!(url.scheme(), "http" | "https") && url.host_str().map_or(true, str::is_empty) {
        return Err(ToolHostError::Configuration(format!(
            "server '{name}': endpoint '{raw}' has no host"
        )));
    }
    Ok(url)
}

fn validate_header(server: &str, header: &str, value: &str) -> Result<()> {
    HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
        ToolHostError::Configuration(format!("server '{server}': invalid header name '{header}'"))
    })?;
    HeaderValue::from_str(value).map_err(|_| {
        ToolHostError::Configuration(format!(
            "server '{server}': header '{header}' has an invalid value"
        ))
    })?;
    Ok(())
}

fn fingerprint(name: &str, endpoint: &Url, headers: &[(String, String)], instruction: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [name, endpoint.as_str(), instruction] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    for (header, value) in headers {
        hasher.update(header.as_bytes());
        hasher.update([b':']);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// A server entry that failed to load.
#[derive(Debug)]
pub struct RejectedServer {
    pub name: String,
    pub error: ToolHostError,
}

/// Result of a lenient load: the usable store plus everything rejected.
#[derive(Debug)]
pub struct StoreLoad {
    pub store: DescriptorStore,
    pub rejected: Vec<RejectedServer>,
}

/// Immutable set of descriptors keyed by server name.
#[derive(Debug, Clone, Default)]
pub struct DescriptorStore {
    servers: BTreeMap<String, Arc<ServerDescriptor>>,
}

impl DescriptorStore {
    /// Build a store, failing on the first duplicate name.
    pub fn new(descriptors: Vec<ServerDescriptor>) -> Result<Self> {
        let mut servers = BTreeMap::new();
        for descriptor in descriptors {
            let name = descriptor.name().to_string();
            if servers.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(ToolHostError::Configuration(format!(
                    "Duplicate server name '{name}'"
                )));
            }
        }
        Ok(Self { servers })
    }

    /// Build a store from config, rejecting bad entries one by one.
    pub fn load(config: &HostConfig, lookup: &dyn Fn(&str) -> Option<String>) -> StoreLoad {
        let mut servers = BTreeMap::new();
        let mut rejected = Vec::new();

        for (name, entry) in &config.servers {
            match ServerDescriptor::from_entry(name, entry, lookup) {
                Ok(descriptor) => {
                    let key = descriptor.name().to_string();
                    if servers.contains_key(&key) {
                        rejected.push(RejectedServer {
                            name: name.clone(),
                            error: ToolHostError::Configuration(format!(
                                "Duplicate server name '{key}'"
                            )),
                        });
                        continue;
                    }
                    servers.insert(key, Arc::new(descriptor));
                }
                Err(error) => {
                    tracing::warn!(server = %name, error = %error, "rejecting server descriptor");
                    rejected.push(RejectedServer {
                        name: name.clone(),
                        error,
                    });
                }
            }
        }

        StoreLoad {
            store: Self { servers },
            rejected,
        }
    }

    /// Build a store from config using the process environment for secrets.
    pub fn load_from_env(config: &HostConfig) -> StoreLoad {
        Self::load(config, &secrets::env_lookup)
    }

    /// Descriptors ordered by name.
    pub fn list(&self) -> Vec<Arc<ServerDescriptor>> {
        self.servers.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerDescriptor>> {
        self.servers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
