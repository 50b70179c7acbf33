use crate::config::{app_data_dir, Config};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::PathBuf};
#[cfg(windows)]
use windows::Win32::Foundation::{LocalFree, HLOCAL};
#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
};

const VAULT_FILE: &str = "vault.json";

/// Local secret store for the OBS password and the control surface token.
///
/// Values are sealed with DPAPI on Windows and base64 encoded in a JSON file.
#[derive(Debug)]
pub struct Vault {
    path: PathBuf,
    store: VaultStore,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultStore {
    entries: BTreeMap<String, String>,
}

impl Vault {
    pub fn new(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => app_data_dir().join(VAULT_FILE),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str(&raw) {
                Ok(store) => store,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "vault file unreadable, starting empty");
                    VaultStore::default()
                }
            }
        } else {
            VaultStore::default()
        };

        Ok(Self { path, store })
    }

    pub fn open(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        Self::new(config.vault.path.as_deref())
    }

    pub fn store(&mut self, key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
        let encrypted = protect(value.as_bytes())?;
        let encoded = general_purpose::STANDARD.encode(encrypted);
        self.store.entries.insert(key.to_string(), encoded);
        self.persist()
    }

    pub fn retrieve(&self, key: &str) -> Result<String, Box<dyn std::error::Error>> {
        let encoded = self
            .store
            .entries
            .get(key)
            .ok_or_else(|| format!("missing vault key: {key}"))?;
        let encrypted = general_purpose::STANDARD.decode(encoded)?;
        let decrypted = unprotect(&encrypted)?;
        Ok(String::from_utf8(decrypted)?)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.entries.contains_key(key)
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.store.entries.keys().cloned().collect()
    }

    fn persist(&self) -> Result<(), Box<dyn std::error::Error>> {
        let data = serde_json::to_string_pretty(&self.store)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

/// Resolves the OBS password referenced by `obs.password_key`.
///
/// No key configured means the server is expected to run without
/// authentication.
pub fn obs_password(config: &Config, vault: &Vault) -> Result<Option<String>, Box<dyn std::error::Error>> {
    match config.obs.password_key.as_deref() {
        Some(key) => Ok(Some(vault.retrieve(key)?)),
        None => Ok(None),
    }
}

#[cfg(windows)]
fn protect(data: &[u8]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    unsafe {
        let in_blob = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };
        let mut out_blob = CRYPT_INTEGER_BLOB::default();

        CryptProtectData(
            &in_blob,
            None,
            None,
            None,
            None,
            CRYPTPROTECT_UI_FORBIDDEN,
            &mut out_blob,
        )?;

        let out = std::slice::from_raw_parts(out_blob.pbData, out_blob.cbData as usize).to_vec();
        let _ = LocalFree(HLOCAL(out_blob.pbData as *mut _));
        Ok(out)
    }
}

#[cfg(windows)]
fn unprotect(data: &[u8]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    unsafe {
        let in_blob = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };
        let mut out_blob = CRYPT_INTEGER_BLOB::default();

        CryptUnprotectData(
            &in_blob,
            None,
            None,
            None,
            None,
            CRYPTPROTECT_UI_FORBIDDEN,
            &mut out_blob,
        )?;

        let out = std::slice::from_raw_parts(out_blob.pbData, out_blob.cbData as usize).to_vec();
        let _ = LocalFree(HLOCAL(out_blob.pbData as *mut _));
        Ok(out)
    }
}

#[cfg(not(windows))]
fn protect(data: &[u8]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    // Encoded only; there is no DPAPI equivalent wired up off Windows.
    Ok(data.to_vec())
}

#[cfg(not(windows))]
fn unprotect(data: &[u8]) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    Ok(data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_vault(name: &str) -> (PathBuf, Vault) {
        let path = std::env::temp_dir()
            .join(format!("obs-remote-vault-{}-{name}", std::process::id()))
            .join(VAULT_FILE);
        let _ = fs::remove_file(&path);
        let vault = Vault::new(path.to_str()).unwrap();
        (path, vault)
    }

    #[test]
    fn stored_secret_survives_reopen() {
        let (path, mut vault) = temp_vault("reopen");
        vault.store("obs_password", "hunter2").unwrap();
        vault.store("server_token", "abc").unwrap();

        let reopened = Vault::new(path.to_str()).unwrap();
        assert_eq!(reopened.retrieve("obs_password").unwrap(), "hunter2");
        assert_eq!(reopened.list_keys(), vec!["obs_password", "server_token"]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_key_is_an_error() {
        let (path, vault) = temp_vault("missing");
        assert!(!vault.contains("obs_password"));
        assert!(vault.retrieve("obs_password").is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn obs_password_follows_configured_key() {
        let (path, mut vault) = temp_vault("password");
        let mut config = Config::default();
        assert_eq!(obs_password(&config, &vault).unwrap(), None);

        config.obs.password_key = Some("obs_password".to_string());
        assert!(obs_password(&config, &vault).is_err());

        vault.store("obs_password", "secret").unwrap();
        assert_eq!(
            obs_password(&config, &vault).unwrap().as_deref(),
            Some("secret")
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let (path, _) = temp_vault("corrupt");
        fs::write(&path, "not json").unwrap();
        let vault = Vault::new(path.to_str()).unwrap();
        assert!(vault.list_keys().is_empty());
        let _ = fs::remove_file(&path);
    }
}
