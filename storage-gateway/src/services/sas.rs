//! Service SAS signing for blob storage.
//!
//! Every URL handed to a client, and every REST call the gateway makes
//! against the container, carries a short-lived shared access signature
//! derived from the account key. The key itself never leaves the process.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};
use secrecy::ExposeSecret;
use service_core::utils::signature::{sign_base64, verify_base64};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::config::StorageConfig;

pub const SAS_VERSION: &str = "2020-12-06";
const SAS_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const MAX_OBJECT_NAME_LEN: usize = 1024;

pub const PERMISSION_READ: &str = "r";
pub const PERMISSION_WRITE: &str = "cw";
pub const PERMISSION_DELETE: &str = "d";
pub const PERMISSION_LIST: &str = "l";

#[derive(Debug, Error)]
pub enum GrantError {
    #[error("Storage access key is not valid base64: {0}")]
    InvalidKey(String),

    #[error("Invalid storage endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid object name: {0:?}")]
    InvalidName(String),

    #[error("Malformed signed URL: {0}")]
    Malformed(String),

    #[error("Signed URL is not yet valid")]
    NotYetValid,

    #[error("Signed URL has expired")]
    Expired,

    #[error("Signature does not match")]
    SignatureMismatch,

    #[error("Signed URL does not grant '{0}' access")]
    PermissionDenied(char),

    #[error("Signing failed: {0}")]
    Signing(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasResource {
    Blob,
    Container,
}

impl SasResource {
    fn code(self) -> &'static str {
        match self {
            SasResource::Blob => "b",
            SasResource::Container => "c",
        }
    }
}

/// A signed URL together with its validity window.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub url: Url,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SasSigner {
    account: String,
    container: String,
    key: Arc<[u8]>,
    endpoint: Url,
    validity: Duration,
    clock_skew: Duration,
}

impl fmt::Debug for SasSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasSigner")
            .field("account", &self.account)
            .field("container", &self.container)
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

/// Rejects names the blob service would reinterpret or that cannot be
/// expressed as a URL path.
pub fn validate_object_name(name: &str) -> Result<(), GrantError> {
    let invalid = name.is_empty()
        || name.len() > MAX_OBJECT_NAME_LEN
        || name.contains('\\')
        || name.chars().any(char::is_control)
        || name
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");

    if invalid {
        return Err(GrantError::InvalidName(name.to_string()));
    }
    Ok(())
}

impl SasSigner {
    /// Decodes the account key once. A key that is not valid base64 is a
    /// startup error.
    pub fn new(config: &StorageConfig) -> Result<Self, GrantError> {
        let key = STANDARD
            .decode(config.access_key.expose_secret().trim())
            .map_err(|e| GrantError::InvalidKey(e.to_string()))?;
        if key.is_empty() {
            return Err(GrantError::InvalidKey("key is empty".to_string()));
        }

        let endpoint = Url::parse(&config.endpoint_url())
            .map_err(|e| GrantError::InvalidEndpoint(e.to_string()))?;
        if endpoint.cannot_be_a_base() {
            return Err(GrantError::InvalidEndpoint(endpoint.to_string()));
        }
        if config.container.is_empty() || config.container.contains('/') {
            return Err(GrantError::InvalidEndpoint(format!(
                "invalid container name {:?}",
                config.container
            )));
        }

        Ok(Self {
            account: config.account.clone(),
            container: config.container.clone(),
            key: Arc::from(key),
            endpoint,
            validity: Duration::minutes(config.sas_validity_minutes),
            clock_skew: Duration::minutes(config.sas_clock_skew_minutes),
        })
    }

    pub fn container_url(&self) -> Result<Url, GrantError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| GrantError::InvalidEndpoint(self.endpoint.to_string()))?
            .pop_if_empty()
            .push(&self.container);
        Ok(url)
    }

    pub fn blob_url(&self, name: &str) -> Result<Url, GrantError> {
        validate_object_name(name)?;
        let mut url = self.container_url()?;
        url.path_segments_mut()
            .map_err(|_| GrantError::InvalidEndpoint(self.endpoint.to_string()))?
            .extend(name.split('/'));
        Ok(url)
    }

    /// Read-only URL for `name`. The window opens one skew interval in the
    /// past and lasts for the configured validity from there.
    pub fn issue(&self, name: &str) -> Result<AccessGrant, GrantError> {
        self.issue_at(name, Utc::now())
    }

    pub fn issue_at(&self, name: &str, now: DateTime<Utc>) -> Result<AccessGrant, GrantError> {
        let grant = self.grant_at(SasResource::Blob, Some(name), PERMISSION_READ, now)?;
        metrics::counter!("signed_urls_issued_total").increment(1);
        Ok(grant)
    }

    /// Narrow grant used by the gateway itself for backend calls.
    pub fn grant(
        &self,
        resource: SasResource,
        name: Option<&str>,
        permissions: &str,
    ) -> Result<AccessGrant, GrantError> {
        self.grant_at(resource, name, permissions, Utc::now())
    }

    fn grant_at(
        &self,
        resource: SasResource,
        name: Option<&str>,
        permissions: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant, GrantError> {
        let now = now.trunc_subsecs(0);
        let starts_at = now - self.clock_skew;
        let expires_at = starts_at + self.validity;
        let start = starts_at.format(SAS_TIME_FORMAT).to_string();
        let expiry = expires_at.format(SAS_TIME_FORMAT).to_string();

        let (mut url, canonical) = match (resource, name) {
            (SasResource::Blob, Some(name)) => {
                (self.blob_url(name)?, self.canonical_resource(Some(name)))
            }
            (SasResource::Blob, None) => {
                return Err(GrantError::InvalidName(String::new()));
            }
            (SasResource::Container, _) => (self.container_url()?, self.canonical_resource(None)),
        };

        let protocol = self.protocol();
        let string_to_sign = string_to_sign(
            permissions,
            &start,
            &expiry,
            &canonical,
            protocol,
            resource.code(),
        );
        let signature = sign_base64(&self.key, &string_to_sign)?;

        url.query_pairs_mut()
            .append_pair("sv", SAS_VERSION)
            .append_pair("st", &start)
            .append_pair("se", &expiry)
            .append_pair("sr", resource.code())
            .append_pair("sp", permissions)
            .append_pair("spr", protocol)
            .append_pair("sig", &signature);

        Ok(AccessGrant {
            url,
            starts_at,
            expires_at,
        })
    }

    /// Checks a blob URL the way the storage service would and returns the
    /// object name it grants access to.
    pub fn verify(
        &self,
        url: &Url,
        permission: char,
        now: DateTime<Utc>,
    ) -> Result<String, GrantError> {
        if url.origin() != self.endpoint.origin() {
            return Err(GrantError::Malformed("foreign host".to_string()));
        }

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let param = |key: &str| {
            params
                .get(key)
                .map(String::as_str)
                .ok_or_else(|| GrantError::Malformed(format!("missing {}", key)))
        };

        let version = param("sv")?;
        let start = param("st")?;
        let expiry = param("se")?;
        let resource = param("sr")?;
        let permissions = param("sp")?;
        let protocol = param("spr")?;
        let signature = param("sig")?;

        if version != SAS_VERSION {
            return Err(GrantError::Malformed(format!("unsupported version {}", version)));
        }
        if resource != SasResource::Blob.code() {
            return Err(GrantError::Malformed("not a blob grant".to_string()));
        }

        let name = self.object_name_from_path(url.path())?;
        let string_to_sign = string_to_sign(
            permissions,
            start,
            expiry,
            &self.canonical_resource(Some(&name)),
            protocol,
            resource,
        );
        if !verify_base64(&self.key, &string_to_sign, signature)? {
            return Err(GrantError::SignatureMismatch);
        }

        if now < parse_sas_time(start)? {
            return Err(GrantError::NotYetValid);
        }
        if now > parse_sas_time(expiry)? {
            return Err(GrantError::Expired);
        }
        if !permissions.contains(permission) {
            return Err(GrantError::PermissionDenied(permission));
        }

        Ok(name)
    }

    fn object_name_from_path(&self, path: &str) -> Result<String, GrantError> {
        let container_url = self.container_url()?;
        let prefix = format!("{}/", container_url.path());
        let encoded = path
            .strip_prefix(&prefix)
            .ok_or_else(|| GrantError::Malformed("path outside container".to_string()))?;
        let name = urlencoding::decode(encoded)
            .map_err(|e| GrantError::Malformed(e.to_string()))?
            .into_owned();
        validate_object_name(&name)?;
        Ok(name)
    }

    fn canonical_resource(&self, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("/blob/{}/{}/{}", self.account, self.container, name),
            None => format!("/blob/{}/{}", self.account, self.container),
        }
    }

    fn protocol(&self) -> &'static str {
        if self.endpoint.scheme() == "https" {
            "https"
        } else {
            "https,http"
        }
    }
}

fn string_to_sign(
    permissions: &str,
    start: &str,
    expiry: &str,
    canonical_resource: &str,
    protocol: &str,
    resource: &str,
) -> String {
    [
        permissions,
        start,
        expiry,
        canonical_resource,
        "", // signed identifier
        "", // signed ip
        protocol,
        SAS_VERSION,
        resource,
        "", // snapshot time
        "", // encryption scope
        "", // rscc
        "", // rscd
        "", // rsce
        "", // rscl
        "", // rsct
    ]
    .join("\n")
}

fn parse_sas_time(raw: &str) -> Result<DateTime<Utc>, GrantError> {
    NaiveDateTime::parse_from_str(raw, SAS_TIME_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|e| GrantError::Malformed(format!("bad timestamp {:?}: {}", raw, e)))
}
