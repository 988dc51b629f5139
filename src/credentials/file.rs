//! Credential storage in a single JSON document.
//!
//! Writes go to a temporary file in the same directory which is then renamed over
//! the target, so a reader sees either the old document or the new one.

use super::{
    check_tokens, default_token_type, sealed_aad, CipherMode, CredentialRecord, CredentialStore,
    SealedTokens, StoreError,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// On-disk layout. Either the cleartext token fields or `sealed_tokens` is set.
#[derive(Serialize, Deserialize)]
struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    /// base64(nonce || AES-256-GCM(json pair))
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sealed_tokens: Option<String>,
    expires_at: DateTime<Utc>,
    #[serde(default = "default_token_type")]
    token_type: String,
    updated_at: DateTime<Utc>,
}

/// JSON file credential store.
pub struct FileCredentialStore {
    path: PathBuf,
    cipher: CipherMode,
}

impl FileCredentialStore {
    pub fn new<P: Into<PathBuf>>(path: P, cipher: CipherMode) -> Self {
        Self {
            path: path.into(),
            cipher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<CredentialRecord>, StoreError> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let doc: Document = serde_json::from_slice(&contents)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.path.display(), e)))?;

        let tokens = match (doc.sealed_tokens, doc.access_token, doc.refresh_token) {
            (Some(sealed), _, _) => {
                if !self.cipher.is_authenticated() {
                    return Err(StoreError::KeyRequired);
                }
                let blob = BASE64
                    .decode(sealed)
                    .map_err(|e| StoreError::Corrupt(format!("sealed_tokens: {}", e)))?;
                let aad = sealed_aad(&doc.expires_at, &doc.token_type, &doc.updated_at);
                let plaintext = self.cipher.open(&blob, &aad)?;
                serde_json::from_slice::<SealedTokens>(&plaintext)
                    .map_err(|e| StoreError::Corrupt(format!("sealed token payload: {}", e)))?
            }
            (None, Some(access_token), Some(refresh_token)) => {
                if self.cipher.is_authenticated() {
                    warn!(
                        path = %self.path.display(),
                        "Stored credentials are not encrypted, they will be sealed on next save"
                    );
                }
                SealedTokens {
                    access_token,
                    refresh_token,
                }
            }
            _ => {
                return Err(StoreError::Corrupt(
                    "document has neither sealed nor cleartext tokens".to_string(),
                ))
            }
        };

        check_tokens(&tokens.access_token, &tokens.refresh_token)?;

        Ok(Some(CredentialRecord {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: doc.expires_at,
            token_type: doc.token_type,
            updated_at: doc.updated_at,
        }))
    }

    fn save(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        check_tokens(&record.access_token, &record.refresh_token)?;

        let mut doc = Document {
            access_token: None,
            refresh_token: None,
            sealed_tokens: None,
            expires_at: record.expires_at,
            token_type: record.token_type.clone(),
            updated_at: record.updated_at,
        };

        if self.cipher.is_authenticated() {
            let payload = serde_json::to_vec(&SealedTokens {
                access_token: record.access_token.clone(),
                refresh_token: record.refresh_token.clone(),
            })
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let aad = sealed_aad(&record.expires_at, &record.token_type, &record.updated_at);
            doc.sealed_tokens = Some(BASE64.encode(self.cipher.seal(&payload, &aad)?));
        } else {
            doc.access_token = Some(record.access_token.clone());
            doc.refresh_token = Some(record.refresh_token.clone());
        }

        let json =
            serde_json::to_vec_pretty(&doc).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let dir = self.parent_dir();
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        tmp.persist(&self.path).map_err(|e| StoreError::from(e.error))?;

        info!(
            path = %self.path.display(),
            expires_at = %record.expires_at,
            encrypted = self.cipher.is_authenticated(),
            "Credentials saved to file"
        );
        Ok(())
    }

    fn clear(&self) -> Result<bool, StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Credentials cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
