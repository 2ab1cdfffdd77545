//! Durable routing table, RSA key material, and per-topic watermarks.
//!
//! The document is a single JSON file, rewritten atomically
//! (`write temp file -> fsync -> rename`) on every mutation. All
//! mutations go through `&mut Store` behind a single `RwLock`, so
//! `updateRoutes`/`advanceWatermark` are linearizable and readers never
//! observe a torn write.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::RsaKeyPair;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read store file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write store file: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to parse store document: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("rsa key error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProofType {
    #[serde(rename = "create")]
    Create,
    #[serde(rename = "create2")]
    Create2,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ProofWitness {
    Create { nonce: u64 },
    Create2 { salt: String, #[serde(rename = "initCodeHash")] init_code_hash: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub url: String,
    #[serde(rename = "proofType")]
    pub proof_type: ProofType,
    #[serde(flatten)]
    pub witness: ProofWitness,
    #[serde(rename = "signerAddr")]
    pub signer_addr: String,
    #[serde(rename = "installedAt")]
    pub installed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RsaKeyMaterial {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "privateKey")]
    pub private_key: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "rsaKeys", default)]
    pub rsa_keys: Option<RsaKeyMaterial>,
    #[serde(default)]
    pub sequences: HashMap<String, u64>,
    #[serde(rename = "lastUpdated", default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            rsa_keys: None,
            sequences: HashMap::new(),
            last_updated: Utc::now(),
            version: "1.0".to_string(),
        }
    }
}

/// Simplified view used only for routes persisted as plain `addr -> url`
/// via `updateRoutes`/admin `POST /routes` — the full `Route` record is
/// kept separately once a route has gone through the challenge engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Document {
    #[serde(default)]
    pub routes: HashMap<String, Route>,
    #[serde(default)]
    pub metadata: Metadata,
}

pub struct Store {
    path: PathBuf,
    doc: Document,
}

impl Store {
    /// Loads the document at `path`, applying schema migration if
    /// needed, or creates an empty one if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(Self { path, doc: Document::default() });
        }
        let bytes = fs::read(&path).map_err(StoreError::Read)?;
        let raw: serde_json::Value = serde_json::from_slice(&bytes).map_err(StoreError::Parse)?;
        let doc = migrate(raw)?;
        Ok(Self { path, doc })
    }

    pub fn routes(&self) -> &HashMap<String, Route> {
        &self.doc.routes
    }

    pub fn get_target(&self, addr: &str) -> Option<&str> {
        self.doc.routes.get(addr).map(|r| r.url.as_str())
    }

    pub fn rsa_keys(&self) -> Option<&RsaKeyMaterial> {
        self.doc.metadata.rsa_keys.as_ref()
    }

    pub fn watermark(&self, topic: &str) -> u64 {
        *self.doc.metadata.sequences.get(topic).unwrap_or(&0)
    }

    /// Persists the RSA key pair the first time the proxy starts.
    pub fn set_rsa_keys(&mut self, keys: &RsaKeyPair) -> Result<(), StoreError> {
        self.doc.metadata.rsa_keys = Some(RsaKeyMaterial {
            public_key: keys.public_pem()?,
            private_key: keys.private_pem()?,
            created_at: Utc::now(),
        });
        self.persist()
    }

    /// Merges `new` into the existing routing map by `addr`, preserving
    /// unrelated entries, and bumps `lastUpdated`.
    pub fn update_routes(&mut self, new: HashMap<String, Route>) -> Result<(), StoreError> {
        for (addr, route) in new {
            self.doc.routes.insert(addr, route);
        }
        self.doc.metadata.last_updated = Utc::now();
        self.persist()
    }

    /// Admin merge that takes bare `addr -> url` pairs (the `POST
    /// /routes` surface), wrapping each into a minimal unproven route.
    pub fn merge_admin_urls(&mut self, new: HashMap<String, String>) -> Result<(), StoreError> {
        for (addr, url) in new {
            let entry = self.doc.routes.entry(addr).or_insert_with(|| Route {
                url: String::new(),
                proof_type: ProofType::Create,
                witness: ProofWitness::Create { nonce: 0 },
                signer_addr: String::new(),
                installed_at: Utc::now(),
            });
            entry.url = url;
        }
        self.doc.metadata.last_updated = Utc::now();
        self.persist()
    }

    /// Advances the watermark for `topic` iff `seq` is strictly greater
    /// than the current value — a stale or duplicate watermark advance
    /// is silently ignored.
    pub fn advance_watermark(&mut self, topic: &str, seq: u64) -> Result<(), StoreError> {
        let current = self.doc.metadata.sequences.get(topic).copied().unwrap_or(0);
        if seq <= current {
            return Ok(());
        }
        self.doc.metadata.sequences.insert(topic.to_string(), seq);
        self.persist()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(StoreError::Write)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&self.doc).map_err(StoreError::Parse)?;
        let mut file = fs::File::create(&tmp_path).map_err(StoreError::Write)?;
        file.write_all(&bytes).map_err(StoreError::Write)?;
        file.sync_all().map_err(StoreError::Write)?;
        fs::rename(&tmp_path, &self.path).map_err(StoreError::Write)?;
        Ok(())
    }
}

/// If the document lacks `routes`/`metadata`, treat it as a flat
/// `addr -> url` map and wrap it. If `metadata.version` is missing,
/// default it to `"1.0"`.
fn migrate(raw: serde_json::Value) -> Result<Document, StoreError> {
    let is_legacy_flat_map = match &raw {
        serde_json::Value::Object(map) => !map.contains_key("routes") && !map.contains_key("metadata"),
        _ => false,
    };

    if is_legacy_flat_map {
        let mut routes = HashMap::new();
        if let serde_json::Value::Object(map) = raw {
            for (addr, url_value) in map {
                if let Some(url) = url_value.as_str() {
                    routes.insert(
                        addr,
                        Route {
                            url: url.to_string(),
                            proof_type: ProofType::Create,
                            witness: ProofWitness::Create { nonce: 0 },
                            signer_addr: String::new(),
                            installed_at: Utc::now(),
                        },
                    );
                }
            }
        }
        return Ok(Document { routes, metadata: Metadata::default() });
    }

    let mut value = raw;
    if let Some(metadata) = value.get_mut("metadata") {
        if metadata.get("version").is_none() {
            if let serde_json::Value::Object(map) = metadata {
                map.insert("version".to_string(), serde_json::json!("1.0"));
            }
        }
    } else {
        value["metadata"] = serde_json::to_value(Metadata::default()).map_err(StoreError::Parse)?;
    }

    serde_json::from_value(value).map_err(StoreError::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_store_tests::TempPath;

    mod tempfile_store_tests {
        use std::path::PathBuf;

        /// Minimal self-cleaning temp-file helper (avoids adding a
        /// `tempfile` dev-dependency for a handful of store tests).
        pub struct TempPath(pub PathBuf);

        impl TempPath {
            pub fn new(name: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!("rpc-relay-proxy-test-{}-{}", std::process::id(), name));
                Self(path)
            }
        }

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
                let _ = std::fs::remove_file(self.0.with_extension("tmp"));
            }
        }
    }

    #[test]
    fn loads_missing_file_as_empty_document() {
        let path = TempPath::new("missing");
        let store = Store::load(&path.0).unwrap();
        assert!(store.routes().is_empty());
        assert_eq!(store.watermark("topic.1"), 0);
    }

    #[test]
    fn migrates_legacy_flat_map() {
        let path = TempPath::new("legacy");
        std::fs::write(&path.0, r#"{"0xabc":"https://example.com"}"#).unwrap();
        let store = Store::load(&path.0).unwrap();
        assert_eq!(store.get_target("0xabc"), Some("https://example.com"));
    }

    #[test]
    fn update_routes_merges_and_persists() {
        let path = TempPath::new("merge");
        let mut store = Store::load(&path.0).unwrap();
        let mut new = HashMap::new();
        new.insert(
            "0xabc".to_string(),
            Route {
                url: "https://one.example".to_string(),
                proof_type: ProofType::Create,
                witness: ProofWitness::Create { nonce: 1 },
                signer_addr: "0xsigner".to_string(),
                installed_at: Utc::now(),
            },
        );
        store.update_routes(new).unwrap();

        let reloaded = Store::load(&path.0).unwrap();
        assert_eq!(reloaded.get_target("0xabc"), Some("https://one.example"));
    }

    #[test]
    fn watermark_only_advances_forward() {
        let path = TempPath::new("watermark");
        let mut store = Store::load(&path.0).unwrap();
        store.advance_watermark("topic.1", 5).unwrap();
        store.advance_watermark("topic.1", 3).unwrap();
        assert_eq!(store.watermark("topic.1"), 5);
        store.advance_watermark("topic.1", 9).unwrap();
        assert_eq!(store.watermark("topic.1"), 9);
    }

    #[test]
    fn admin_merge_preserves_unrelated_routes() {
        let path = TempPath::new("admin-merge");
        let mut store = Store::load(&path.0).unwrap();
        let mut first = HashMap::new();
        first.insert("0xaaa".to_string(), "https://a.example".to_string());
        store.merge_admin_urls(first).unwrap();

        let mut second = HashMap::new();
        second.insert("0xbbb".to_string(), "https://b.example".to_string());
        store.merge_admin_urls(second).unwrap();

        assert_eq!(store.get_target("0xaaa"), Some("https://a.example"));
        assert_eq!(store.get_target("0xbbb"), Some("https://b.example"));
    }

    #[test]
    fn survives_restart_with_rsa_keys() {
        let path = TempPath::new("rsa-restart");
        let mut store = Store::load(&path.0).unwrap();
        let keys = RsaKeyPair::generate().unwrap();
        store.set_rsa_keys(&keys).unwrap();

        let reloaded = Store::load(&path.0).unwrap();
        assert!(reloaded.rsa_keys().is_some());
        assert_eq!(reloaded.rsa_keys().unwrap().public_key, keys.public_pem().unwrap());
    }
}
