//! Blocking OCI distribution client
//!
//! Speaks just enough of the registry protocol to resolve a reference to
//! its manifest and config, and to stream layer blobs: token auth on a
//! bearer challenge, index-to-platform resolution, digest-verified blob
//! fetches.

use crate::registry::auth::{resolve_chain, Credentials, Keychain};
use crate::registry::reference::{ImageRef, ReferenceError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use std::io::Read;
use thiserror::Error;

/// Accept header offered on manifest requests
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
                               application/vnd.docker.distribution.manifest.v2+json, \
                               application/vnd.oci.image.index.v1+json, \
                               application/vnd.docker.distribution.manifest.list.v2+json";

const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const MEDIA_TYPE_DOCKER_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Upper bounds on what we are willing to buffer
const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;
const MAX_CONFIG_SIZE: u64 = 4 * 1024 * 1024;
const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;
const MAX_TOKEN_SIZE: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid reference: {0}")]
    Reference(#[from] ReferenceError),

    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("Registry returned {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Unsupported auth challenge: {0}")]
    UnsupportedChallenge(String),

    #[error("No manifest for platform {0}")]
    NoPlatformManifest(String),

    #[error("Digest mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("Unsupported layer media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A content descriptor as it appears in manifests
#[derive(Debug, Clone, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

/// A single-platform image manifest
#[derive(Debug, Clone, Deserialize)]
pub struct ImageManifest {
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct ManifestIndex {
    manifests: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    digest: String,
    #[serde(default)]
    platform: Option<PlatformDesc>,
}

#[derive(Debug, Deserialize)]
struct PlatformDesc {
    os: String,
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

/// A reference resolved against the registry: manifest, config bytes and
/// the bearer token to reuse for blob fetches.
pub struct ResolvedImage {
    pub reference: ImageRef,
    pub manifest: ImageManifest,
    pub config: Vec<u8>,
    token: Option<String>,
}

impl ResolvedImage {
    /// The image's cache identity
    pub fn config_digest(&self) -> &str {
        &self.manifest.config.digest
    }
}

pub struct RegistryClient {
    agent: ureq::Agent,
    keychain: Vec<Box<dyn Keychain>>,
}

impl RegistryClient {
    pub fn new(keychain: Vec<Box<dyn Keychain>>) -> Self {
        // non-2xx responses must come back as responses, the bearer
        // challenge lives in a 401 header
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent, keychain }
    }

    /// Resolve a pull reference to its platform manifest and raw config.
    pub fn resolve(&self, image_ref: &str) -> Result<ResolvedImage, RegistryError> {
        let reference = ImageRef::parse(image_ref)?;
        info!("resolving {}", reference);

        let mut token = None;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            reference.registry_endpoint(),
            reference.repository(),
            reference.manifest_reference()
        );
        let (body, media_type) = self.get_manifest(&reference, &url, &mut token)?;

        let body = if media_type.as_deref() == Some(MEDIA_TYPE_OCI_INDEX)
            || media_type.as_deref() == Some(MEDIA_TYPE_DOCKER_LIST)
        {
            let index: ManifestIndex = serde_json::from_slice(&body)?;
            let digest = select_platform_manifest(&index)?;
            debug!("index resolved to {}", digest);
            let url = format!(
                "{}/v2/{}/manifests/{}",
                reference.registry_endpoint(),
                reference.repository(),
                digest
            );
            self.get_manifest(&reference, &url, &mut token)?.0
        } else {
            body
        };

        let manifest: ImageManifest = serde_json::from_slice(&body)?;
        let config = self.fetch_blob(
            &reference,
            &manifest.config.digest,
            MAX_CONFIG_SIZE,
            &mut token,
        )?;

        Ok(ResolvedImage {
            reference,
            manifest,
            config,
            token,
        })
    }

    /// Fetch one layer of a resolved image, decompressed to a plain tar.
    pub(crate) fn fetch_layer(
        &self,
        image: &ResolvedImage,
        layer: &Descriptor,
    ) -> Result<Vec<u8>, RegistryError> {
        let mut token = image.token.clone();
        let data = self.fetch_blob(&image.reference, &layer.digest, MAX_LAYER_SIZE, &mut token)?;

        if layer.media_type.contains("gzip") {
            let mut decoder = flate2::read::GzDecoder::new(&data[..]);
            let mut plain = Vec::new();
            decoder.read_to_end(&mut plain)?;
            Ok(plain)
        } else if layer.media_type.contains("zstd") {
            Err(RegistryError::UnsupportedMediaType(layer.media_type.clone()))
        } else {
            Ok(data)
        }
    }

    fn get_manifest(
        &self,
        reference: &ImageRef,
        url: &str,
        token: &mut Option<String>,
    ) -> Result<(Vec<u8>, Option<String>), RegistryError> {
        let mut resp = self.authenticated_get(reference, url, Some(MANIFEST_ACCEPT), token)?;
        let media_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let body = read_limited(&mut resp, MAX_MANIFEST_SIZE)?;
        Ok((body, media_type))
    }

    fn fetch_blob(
        &self,
        reference: &ImageRef,
        digest: &str,
        limit: u64,
        token: &mut Option<String>,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            reference.registry_endpoint(),
            reference.repository(),
            digest
        );
        debug!("fetching blob {}", digest);
        let mut resp = self.authenticated_get(reference, &url, None, token)?;
        let data = read_limited(&mut resp, limit)?;
        verify_digest(digest, &data)?;
        Ok(data)
    }

    /// GET with one bearer-token retry on a 401 challenge.
    fn authenticated_get(
        &self,
        reference: &ImageRef,
        url: &str,
        accept: Option<&str>,
        token: &mut Option<String>,
    ) -> Result<ureq::http::Response<ureq::Body>, RegistryError> {
        for attempt in 0..2 {
            let mut req = self.agent.get(url);
            if let Some(accept) = accept {
                req = req.header("Accept", accept);
            }
            if let Some(token) = token.as_deref() {
                req = req.header("Authorization", format!("Bearer {}", token));
            }
            let resp = req
                .call()
                .map_err(|e| RegistryError::HttpError(e.to_string()))?;

            // a challenge on the first attempt means fetch (or refresh) a token
            if resp.status().as_u16() == 401 && attempt == 0 {
                let challenge = resp
                    .headers()
                    .get("www-authenticate")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                *token = Some(self.fetch_token(reference, &challenge)?);
                continue;
            }

            if !resp.status().is_success() {
                return Err(RegistryError::Status {
                    url: url.to_string(),
                    status: resp.status().as_u16(),
                });
            }
            return Ok(resp);
        }

        Err(RegistryError::Status {
            url: url.to_string(),
            status: 401,
        })
    }

    /// Trade a bearer challenge for a token, with basic auth when the
    /// keychain knows the registry and anonymously otherwise.
    fn fetch_token(
        &self,
        reference: &ImageRef,
        challenge: &str,
    ) -> Result<String, RegistryError> {
        let challenge = BearerChallenge::parse(challenge)?;
        let mut url = format!("{}?service={}", challenge.realm, challenge.service);
        if let Some(scope) = &challenge.scope {
            url.push_str("&scope=");
            url.push_str(scope);
        }

        let creds = resolve_chain(&self.keychain, reference.as_str());
        match &creds {
            Some(c) => debug!("authenticating to {} as {}", challenge.service, c.username),
            None => debug!("requesting anonymous token from {}", challenge.service),
        }

        let mut req = self.agent.get(&url);
        if let Some(Credentials { username, secret }) = &creds {
            let basic = BASE64.encode(format!("{}:{}", username, secret));
            req = req.header("Authorization", format!("Basic {}", basic));
        }
        let mut resp = req
            .call()
            .map_err(|e| RegistryError::HttpError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(RegistryError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }

        let body = read_limited(&mut resp, MAX_TOKEN_SIZE)?;
        let token: TokenResponse = serde_json::from_slice(&body)?;
        if !token.token.is_empty() {
            Ok(token.token)
        } else {
            Ok(token.access_token)
        }
    }
}

/// Pick the linux manifest matching the host architecture
fn select_platform_manifest(index: &ManifestIndex) -> Result<&str, RegistryError> {
    let arch = host_arch();
    index
        .manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .map(|m| m.digest.as_str())
        .ok_or_else(|| RegistryError::NoPlatformManifest(format!("linux/{}", arch)))
}

fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

fn read_limited(
    resp: &mut ureq::http::Response<ureq::Body>,
    limit: u64,
) -> Result<Vec<u8>, RegistryError> {
    let mut data = Vec::new();
    resp.body_mut()
        .with_config()
        .limit(limit)
        .reader()
        .read_to_end(&mut data)?;
    Ok(data)
}

fn verify_digest(expected: &str, data: &[u8]) -> Result<(), RegistryError> {
    let computed = format!("sha256:{}", hex::encode(Sha256::digest(data)));
    if expected != computed {
        return Err(RegistryError::DigestMismatch {
            expected: expected.to_string(),
            computed,
        });
    }
    Ok(())
}

#[derive(Debug)]
struct BearerChallenge {
    realm: String,
    service: String,
    scope: Option<String>,
}

impl BearerChallenge {
    /// Reference: <https://docs.docker.com/registry/spec/auth/token/>
    fn parse(header: &str) -> Result<Self, RegistryError> {
        if !header.trim_start().to_ascii_lowercase().starts_with("bearer") {
            return Err(RegistryError::UnsupportedChallenge(header.to_string()));
        }

        let re = Regex::new(r#"(\w+)="([^"]*)""#).expect("challenge regex");
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for cap in re.captures_iter(header) {
            match &cap[1] {
                "realm" => realm = Some(cap[2].to_string()),
                "service" => service = Some(cap[2].to_string()),
                "scope" => scope = Some(cap[2].to_string()),
                _ => {}
            }
        }

        match (realm, service) {
            (Some(realm), Some(service)) => Ok(BearerChallenge {
                realm,
                service,
                scope,
            }),
            _ => Err(RegistryError::UnsupportedChallenge(header.to_string())),
        }
    }
}
