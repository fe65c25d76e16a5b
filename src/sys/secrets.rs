// src/sys/secrets.rs

use secrecy::{ExposeSecret, Secret, SecretString};

/// Opaque identifier the CI service uses to name the encrypted variables.
/// It is found in the repository's CI settings, next to the variables themselves.
pub const CREDENTIAL_ID: &str = "6a6fe747ff7b";

/// Names under which resolved material is exported to nested executions.
pub const EXPORTED_KEY_VAR: &str = "trav_key";
pub const EXPORTED_IV_VAR: &str = "trav_iv";

pub fn key_var_name(id: &str) -> String {
    format!("encrypted_{}_key", id)
}

pub fn iv_var_name(id: &str) -> String {
    format!("encrypted_{}_iv", id)
}

/// Raw credential variables captured from the CI environment at startup.
///
/// Nothing is decided here; `resolve` picks the exported pair when a parent
/// driver already resolved it, otherwise the pair named by the fixed templates.
#[derive(Debug, Default)]
pub struct CredentialVars {
    exported_key: Option<SecretString>,
    exported_iv: Option<SecretString>,
    templated_key: Option<SecretString>,
    templated_iv: Option<SecretString>,
}

impl CredentialVars {
    pub fn capture(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).map(Secret::new);
        Self {
            exported_key: read(EXPORTED_KEY_VAR),
            exported_iv: read(EXPORTED_IV_VAR),
            templated_key: read(&key_var_name(CREDENTIAL_ID)),
            templated_iv: read(&iv_var_name(CREDENTIAL_ID)),
        }
    }

    /// Produces usable material, or `None` when either half is absent or empty.
    pub fn resolve(&self) -> Option<CredentialMaterial> {
        Self::pair(&self.exported_key, &self.exported_iv)
            .or_else(|| Self::pair(&self.templated_key, &self.templated_iv))
            .map(|(key, iv)| CredentialMaterial::new(key, iv))
    }

    /// Both halves, or nothing: a blank half counts as absent.
    fn pair(key: &Option<SecretString>, iv: &Option<SecretString>) -> Option<(String, String)> {
        Some((non_empty(key.as_ref())?, non_empty(iv.as_ref())?))
    }
}

fn non_empty(value: Option<&SecretString>) -> Option<String> {
    value
        .map(|v| v.expose_secret().trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Key and IV for the symmetric decryption of the private corpus identity.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. The heap copies are zeroized when the struct is dropped.
pub struct CredentialMaterial {
    key: SecretString,
    iv: SecretString,
}

impl CredentialMaterial {
    pub fn new(key: String, iv: String) -> Self {
        Self {
            key: Secret::new(key),
            iv: Secret::new(iv),
        }
    }

    /// Exposes both halves for the duration of `action` only. The borrow
    /// checker keeps the plaintext slices from escaping the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str, &str) -> R,
    {
        action(self.key.expose_secret(), self.iv.expose_secret())
    }
}

impl std::fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialMaterial([REDACTED])")
    }
}
