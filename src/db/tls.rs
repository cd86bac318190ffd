//! TLS settings for driver connections.
//!
//! A connection either carries PEM material inline (CA, client certificate,
//! client key) or names a profile registered in the driver configuration.
//! Problems are reported as `Connection` errors when the driver opens.

use crate::error::{Result, SchemaflowError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM-encoded CA certificate(s)
    #[serde(default)]
    pub ssl_ca: Option<String>,
    /// PEM-encoded client certificate
    #[serde(default)]
    pub ssl_cert: Option<String>,
    /// PEM-encoded client private key
    #[serde(default)]
    pub ssl_key: Option<String>,
    /// Name of a pre-registered profile; exclusive with inline material
    #[serde(default)]
    pub profile: Option<String>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ssl_ca", &self.ssl_ca.as_ref().map(|_| "<pem>"))
            .field("ssl_cert", &self.ssl_cert.as_ref().map(|_| "<pem>"))
            .field("ssl_key", &self.ssl_key.as_ref().map(|_| "<redacted>"))
            .field("profile", &self.profile)
            .finish()
    }
}

/// Validated TLS material ready to hand to a client library
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca: Option<String>,
    /// Client certificate and key, always together
    pub identity: Option<(String, String)>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca", &self.ca.is_some())
            .field("identity", &self.identity.is_some())
            .finish()
    }
}

impl TlsConfig {
    pub fn is_enabled(&self) -> bool {
        self.ssl_ca.is_some()
            || self.ssl_cert.is_some()
            || self.ssl_key.is_some()
            || self.profile.is_some()
    }

    pub fn profile(name: impl Into<String>) -> Self {
        Self {
            profile: Some(name.into()),
            ..Default::default()
        }
    }

    /// Resolve the profile (if any) and validate the PEM material.
    ///
    /// Returns `None` when TLS is not configured. `engine` and `target` only
    /// label the error.
    pub fn resolve(
        &self,
        profiles: &HashMap<String, TlsConfig>,
        engine: impl fmt::Display,
        target: &str,
    ) -> Result<Option<TlsMaterial>> {
        let fail = |reason: String| SchemaflowError::connection(&engine, target, reason);

        let effective = match &self.profile {
            Some(name) => {
                if self.ssl_ca.is_some() || self.ssl_cert.is_some() || self.ssl_key.is_some() {
                    return Err(fail(format!(
                        "TLS profile '{name}' cannot be combined with inline certificates"
                    )));
                }
                let profile = profiles
                    .get(name)
                    .ok_or_else(|| fail(format!("Unknown TLS profile '{name}'")))?;
                if profile.profile.is_some() {
                    return Err(fail(format!("TLS profile '{name}' refers to another profile")));
                }
                profile
            }
            None => self,
        };

        if !effective.is_enabled() {
            return Ok(None);
        }

        if let Some(ca) = &effective.ssl_ca {
            check_pem(ca, "CA certificate").map_err(&fail)?;
        }
        let identity = match (&effective.ssl_cert, &effective.ssl_key) {
            (Some(cert), Some(key)) => {
                check_pem(cert, "client certificate").map_err(&fail)?;
                check_pem(key, "client key").map_err(&fail)?;
                Some((cert.clone(), key.clone()))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(fail("Client certificate provided without a client key".into()))
            }
            (None, Some(_)) => {
                return Err(fail("Client key provided without a client certificate".into()))
            }
        };

        Ok(Some(TlsMaterial {
            ca: effective.ssl_ca.clone(),
            identity,
        }))
    }
}

fn check_pem(content: &str, what: &str) -> std::result::Result<(), String> {
    let trimmed = content.trim();
    if trimmed.starts_with("-----BEGIN ") && trimmed.contains("-----END ") {
        Ok(())
    } else {
        Err(format!("{what} is not PEM encoded"))
    }
}
