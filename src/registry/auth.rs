//! Registry credential lookup
//!
//! Credentials come from an ordered chain of sources: the docker client
//! config, a `~/.netrc`, and finally rcon's own auth file. A miss
//! everywhere is not an error - the pull is attempted anonymously.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Key looked up last in the auth file
const DEFAULT_KEY: &str = "default";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No auth creds found for {0}")]
    NotFound(String),

    #[error("No auth file configured")]
    NoAuthFile,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// A username/secret pair for one registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

/// A source of registry credentials, queried with the raw image reference
pub trait Keychain {
    fn resolve(&self, image_ref: &str) -> Option<Credentials>;
}

/// Extract the registry domain from an image reference or server URL
pub fn domain_of(image_ref: &str) -> Option<String> {
    let re = Regex::new(r"^(?:https?://)?([^/:]+)").expect("domain regex");
    re.captures(image_ref)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct FileCreds {
    username: String,
    secret: String,
}

/// rcon's own credential store, written by `rcon login`.
///
/// A JSON object keyed by server URL, registry domain or the literal
/// `default`, each value holding `username` and `secret`.
pub struct AuthFileHelper {
    auth_file: PathBuf,
}

impl AuthFileHelper {
    pub fn new(auth_file: impl Into<PathBuf>) -> Self {
        Self {
            auth_file: auth_file.into(),
        }
    }

    fn load(&self) -> Result<HashMap<String, FileCreds>, AuthError> {
        if self.auth_file.as_os_str().is_empty() {
            return Err(AuthError::NoAuthFile);
        }
        let data = fs::read(&self.auth_file)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Look up credentials: exact reference first, then the registry
    /// domain, then the `default` entry.
    pub fn get(&self, server_url: &str) -> Result<Credentials, AuthError> {
        let map = self.load()?;

        if let Some(creds) = map.get(server_url) {
            return Ok(creds.clone().into());
        }

        if let Some(domain) = domain_of(server_url) {
            if let Some(creds) = map.get(&domain) {
                return Ok(creds.clone().into());
            }
        }

        if let Some(creds) = map.get(DEFAULT_KEY) {
            return Ok(creds.clone().into());
        }

        Err(AuthError::NotFound(server_url.to_string()))
    }

    /// Merge one entry into the file, creating it with mode 0600.
    pub fn add(&self, server_url: &str, username: &str, secret: &str) -> Result<(), AuthError> {
        if self.auth_file.as_os_str().is_empty() {
            return Err(AuthError::NoAuthFile);
        }

        let mut map = match self.load() {
            Ok(map) => map,
            Err(AuthError::IoError(_)) | Err(AuthError::NoAuthFile) => HashMap::new(),
            Err(e) => return Err(e),
        };

        map.insert(
            server_url.to_string(),
            FileCreds {
                username: username.to_string(),
                secret: secret.to_string(),
            },
        );

        if let Some(parent) = self.auth_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(0o600)
            .open(&self.auth_file)?;
        file.write_all(&serde_json::to_vec(&map)?)?;
        Ok(())
    }
}

impl From<FileCreds> for Credentials {
    fn from(c: FileCreds) -> Self {
        Credentials {
            username: c.username,
            secret: c.secret,
        }
    }
}

impl Keychain for AuthFileHelper {
    fn resolve(&self, image_ref: &str) -> Option<Credentials> {
        self.get(image_ref).ok()
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// The docker client config (`~/.docker/config.json`), the closest thing
/// to a host keychain that works everywhere.
pub struct DockerConfigKeychain {
    config_file: PathBuf,
}

impl DockerConfigKeychain {
    pub fn new() -> Self {
        let config_file = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".docker/config.json");
        Self { config_file }
    }

    pub fn with_path(config_file: impl Into<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
        }
    }
}

impl Default for DockerConfigKeychain {
    fn default() -> Self {
        Self::new()
    }
}

impl Keychain for DockerConfigKeychain {
    fn resolve(&self, image_ref: &str) -> Option<Credentials> {
        let data = fs::read(&self.config_file).ok()?;
        let config: DockerConfig = serde_json::from_slice(&data).ok()?;
        let domain = domain_of(image_ref)?;

        for (server, entry) in &config.auths {
            let server_domain = match domain_of(server) {
                Some(d) => d,
                None => continue,
            };
            // docker stores its own hub under index.docker.io
            let matches = server_domain == domain
                || (domain == "docker.io" && server_domain == "index.docker.io");
            if !matches {
                continue;
            }

            if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
                return Some(Credentials {
                    username: username.clone(),
                    secret: password.clone(),
                });
            }
            if let Some(auth) = &entry.auth {
                let decoded = BASE64.decode(auth).ok()?;
                let decoded = String::from_utf8(decoded).ok()?;
                let (user, pass) = decoded.split_once(':')?;
                return Some(Credentials {
                    username: user.to_string(),
                    secret: pass.to_string(),
                });
            }
        }
        None
    }
}

/// Credentials from a classic `~/.netrc`
pub struct NetrcKeychain {
    netrc_file: PathBuf,
}

impl NetrcKeychain {
    pub fn new() -> Self {
        let netrc_file = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".netrc");
        Self { netrc_file }
    }

    pub fn with_path(netrc_file: impl Into<PathBuf>) -> Self {
        Self {
            netrc_file: netrc_file.into(),
        }
    }
}

impl Default for NetrcKeychain {
    fn default() -> Self {
        Self::new()
    }
}

impl Keychain for NetrcKeychain {
    fn resolve(&self, image_ref: &str) -> Option<Credentials> {
        let domain = domain_of(image_ref)?;
        let content = fs::read_to_string(&self.netrc_file).ok()?;
        parse_netrc(&content, &domain)
    }
}

/// Walk the netrc token stream looking for `machine <domain>`
fn parse_netrc(content: &str, domain: &str) -> Option<Credentials> {
    let mut tokens = content.split_whitespace();
    let mut in_machine = false;
    let mut login: Option<String> = None;
    let mut password: Option<String> = None;

    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                // a new machine block ends the matching one
                if in_machine {
                    break;
                }
                in_machine = tokens.next() == Some(domain);
            }
            "default" if in_machine => break,
            "login" if in_machine => login = tokens.next().map(str::to_string),
            "password" if in_machine => password = tokens.next().map(str::to_string),
            _ => {}
        }
    }

    match (login, password) {
        (Some(username), Some(secret)) => Some(Credentials { username, secret }),
        _ => None,
    }
}

/// The default lookup chain: docker config, netrc, rcon auth file.
pub fn default_keychain(auth_file: &Path) -> Vec<Box<dyn Keychain>> {
    vec![
        Box::new(DockerConfigKeychain::new()),
        Box::new(NetrcKeychain::new()),
        Box::new(AuthFileHelper::new(auth_file)),
    ]
}

/// First hit across a keychain wins
pub fn resolve_chain(chain: &[Box<dyn Keychain>], image_ref: &str) -> Option<Credentials> {
    chain.iter().find_map(|k| k.resolve(image_ref))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_extraction() {
        assert_eq!(domain_of("example.com/private:1").unwrap(), "example.com");
        assert_eq!(
            domain_of("https://example.com/v2/thing").unwrap(),
            "example.com"
        );
        assert_eq!(domain_of("registry.io:5000/app").unwrap(), "registry.io");
        assert_eq!(domain_of("alpine:3").unwrap(), "alpine");
    }

    #[test]
    fn netrc_finds_matching_machine() {
        let content = "machine example.com login alice password s3cret\nmachine other.io login bob password pw";
        let creds = parse_netrc(content, "example.com").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.secret, "s3cret");

        let creds = parse_netrc(content, "other.io").unwrap();
        assert_eq!(creds.username, "bob");
    }

    #[test]
    fn netrc_misses_unknown_machine() {
        let content = "machine example.com login alice password s3cret";
        assert!(parse_netrc(content, "nowhere.dev").is_none());
    }

    #[test]
    fn docker_config_decodes_auth_field() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let auth = BASE64.encode("carol:hunter2");
        std::fs::write(
            &path,
            format!(r#"{{"auths":{{"https://ghcr.io":{{"auth":"{}"}}}}}}"#, auth),
        )
        .unwrap();

        let keychain = DockerConfigKeychain::with_path(&path);
        let creds = keychain.resolve("ghcr.io/team/app:1").unwrap();
        assert_eq!(creds.username, "carol");
        assert_eq!(creds.secret, "hunter2");
        assert!(keychain.resolve("quay.io/team/app").is_none());
    }
}
