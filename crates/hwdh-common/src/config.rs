//! Runtime configuration for the hardware key agreement backends.
//!
//! Nothing security-relevant is compiled in: the TPM authorization value is
//! always supplied by the embedding application, either from the environment
//! or from a JSON document.
//!
//! | Variable         | Meaning                                  | Default               |
//! |------------------|------------------------------------------|-----------------------|
//! | `HWDH_TPM_AUTH`  | hex-encoded primary key authorization    | unset (TPM disabled)  |
//! | `HWDH_TPM_TCTI`  | TSS TCTI name/config string              | `device:/dev/tpmrm0`  |
//! | `HWDH_ENCLAVE`   | enable the Secure Enclave backend        | `true`                |

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::fmt;
use zeroize::Zeroizing;

/// Environment variable holding the hex-encoded TPM authorization value.
pub const ENV_TPM_AUTH: &str = "HWDH_TPM_AUTH";

/// Environment variable holding the TCTI configuration string.
pub const ENV_TPM_TCTI: &str = "HWDH_TPM_TCTI";

/// Environment variable toggling the Secure Enclave backend.
pub const ENV_ENCLAVE: &str = "HWDH_ENCLAVE";

/// Default TCTI: the kernel resource manager.
pub const DEFAULT_TCTI: &str = "device:/dev/tpmrm0";

/// Largest authorization value accepted for a SHA-256 name algorithm object.
pub const MAX_AUTH_LEN: usize = 32;

/// Authorization value (`userAuth`) of the TPM primary key.
///
/// Zeroized on drop and redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthValue(Zeroizing<Vec<u8>>);

impl AuthValue {
    /// Wrap raw authorization bytes.
    ///
    /// # Errors
    /// Returns `Error::Config` if the value is longer than [`MAX_AUTH_LEN`].
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = Zeroizing::new(bytes.into());
        if bytes.len() > MAX_AUTH_LEN {
            return Err(Error::config(format!(
                "TPM auth value too long: {} bytes (max {})",
                bytes.len(),
                MAX_AUTH_LEN
            )));
        }
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded authorization value.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::config(format!("invalid hex in TPM auth value: {e}")))?;
        Self::new(bytes)
    }

    /// Raw authorization bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AuthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthValue(<{} bytes redacted>)", self.0.len())
    }
}

impl<'de> Deserialize<'de> for AuthValue {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        AuthValue::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

/// TPM backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TpmConfig {
    /// Authorization value used to re-derive the primary key.
    pub auth: AuthValue,

    /// TCTI used to reach the module.
    #[serde(default = "default_tcti")]
    pub tcti: String,
}

impl TpmConfig {
    /// Config for the default TCTI with the given authorization value.
    pub fn new(auth: AuthValue) -> Self {
        Self {
            auth,
            tcti: default_tcti(),
        }
    }

    pub fn with_tcti(mut self, tcti: impl Into<String>) -> Self {
        self.tcti = tcti.into();
        self
    }
}

/// Backend selection and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct DhConfig {
    /// TPM backend; `None` leaves the backend unconfigured.
    #[serde(default)]
    pub tpm: Option<TpmConfig>,

    /// Whether the Secure Enclave backend may be used.
    #[serde(default = "default_enclave")]
    pub enclave: bool,
}

impl Default for DhConfig {
    fn default() -> Self {
        Self {
            tpm: None,
            enclave: default_enclave(),
        }
    }
}

impl DhConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// `from_env` is this function over `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tpm = match lookup(ENV_TPM_AUTH) {
            Some(encoded) => {
                let encoded = Zeroizing::new(encoded);
                let auth = AuthValue::from_hex(&encoded)?;
                let tcti = lookup(ENV_TPM_TCTI).unwrap_or_else(default_tcti);
                Some(TpmConfig { auth, tcti })
            }
            None => None,
        };

        let enclave = match lookup(ENV_ENCLAVE) {
            Some(raw) => parse_bool(ENV_ENCLAVE, &raw)?,
            None => default_enclave(),
        };

        Ok(Self { tpm, enclave })
    }

    /// Parse configuration from a JSON document.
    ///
    /// ```
    /// use hwdh_common::DhConfig;
    ///
    /// let config = DhConfig::from_json(r#"{ "tpm": { "auth": "01020304" } }"#).unwrap();
    /// assert_eq!(config.tpm.unwrap().auth.as_bytes(), &[1, 2, 3, 4]);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::serialization)
    }
}

fn default_tcti() -> String {
    DEFAULT_TCTI.to_string()
}

fn default_enclave() -> bool {
    true
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}
