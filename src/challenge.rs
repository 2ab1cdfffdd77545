//! The challenge–response state machine that turns an ownership-proven
//! candidate route into an installed one.
//!
//! One round is a single synchronous HTTP exchange: the engine POSTs a
//! signed challenge to `url + "/challenge"` and the prover's HTTP
//! response body *is* the signed reply — there is no separate webhook.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, warn};

use crate::address::Address;
use crate::crypto::{self, CryptoError, EcdsaSignature, HybridEnvelope, RsaKeyPair, AES_KEY_LEN};
use crate::store::{ProofWitness, Route, Store};
use crate::validator::{ValidRoute, Witness};

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("response invalid: {0}")]
    ResponseInvalid(String),
    #[error("challenge timed out")]
    Timeout,
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Pending,
    Verified,
    Failed,
    Expired,
}

#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    pub challenge_id: [u8; 32],
    pub addr: Address,
    pub url: String,
    pub expected_signer: Address,
    pub issued_at: chrono::DateTime<Utc>,
    pub state: ChallengeState,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChallengeBlob {
    #[serde(rename = "challengeId")]
    challenge_id: String,
    ts: i64,
    url: String,
    #[serde(rename = "contractAddress")]
    contract_address: String,
    action: String,
}

#[derive(Debug, Serialize)]
struct ChallengeRequestBody {
    challenge: ChallengeBlob,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct ChallengeResponseBody {
    #[serde(rename = "challengeId")]
    challenge_id: String,
    signature: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct ConfirmationBody {
    addr: String,
    status: &'static str,
    #[serde(rename = "verifiedRoutes")]
    verified_routes: u32,
    #[serde(rename = "totalRoutes")]
    total_routes: u32,
}

pub struct ChallengeEngine {
    http: reqwest::Client,
    store: Arc<RwLock<Store>>,
    rsa_keys: Arc<RsaKeyPair>,
    challenge_timeout: Duration,
    fanout: Arc<Semaphore>,
    /// At-most-one Pending challenge per addr; presence of a key means a
    /// round is currently in flight for that addr.
    in_flight: Arc<DashMap<Address, ()>>,
    /// Coalesced follow-up: the latest route queued behind an in-flight
    /// round for the same addr.
    queued_next: Arc<DashMap<Address, ValidRoute>>,
    /// Session AES keys rotated on each successful verification, keyed
    /// by addr, used to encrypt subsequent challenges to that prover.
    session_keys: Arc<DashMap<Address, [u8; AES_KEY_LEN]>>,
    /// Terminal records kept for introspection until GC'd.
    records: Arc<DashMap<Address, ChallengeRecord>>,
}

impl ChallengeEngine {
    pub fn new(store: Arc<RwLock<Store>>, rsa_keys: Arc<RsaKeyPair>, challenge_timeout: Duration, fanout: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            store,
            rsa_keys,
            challenge_timeout,
            fanout: Arc::new(Semaphore::new(fanout.max(1))),
            in_flight: Arc::new(DashMap::new()),
            queued_next: Arc::new(DashMap::new()),
            session_keys: Arc::new(DashMap::new()),
            records: Arc::new(DashMap::new()),
        }
    }

    /// Submits a validated candidate route for the challenge–response
    /// handshake. If a round is already Pending for this addr, the
    /// route is queued and will run once the current round terminates,
    /// coalescing with any route queued in the meantime.
    pub async fn submit(self: &Arc<Self>, route: ValidRoute) {
        if self.in_flight.insert(route.addr, ()).is_some() {
            self.queued_next.insert(route.addr, route);
            return;
        }
        self.spawn_round(route);
    }

    fn spawn_round(self: &Arc<Self>, route: ValidRoute) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let addr = route.addr;
            let outcome = engine.run_round(&route).await;
            match &outcome {
                Ok(ChallengeState::Verified) => {
                    info!(addr = %addr, "route verified and installed");
                }
                Ok(state) => {
                    warn!(addr = %addr, state = ?state, "challenge round ended without install");
                }
                Err(err) => {
                    warn!(addr = %addr, error = %err, "challenge round errored");
                }
            }
            engine.in_flight.remove(&addr);
            if let Some((_, next)) = engine.queued_next.remove(&addr) {
                engine.spawn_round(next);
            }
        });
    }

    async fn run_round(&self, route: &ValidRoute) -> Result<ChallengeState, ChallengeError> {
        let _permit = self.fanout.acquire().await.expect("semaphore never closed");

        let challenge_id = crypto::random_bytes_32();
        let blob = ChallengeBlob {
            challenge_id: format!("0x{}", hex::encode(challenge_id)),
            ts: Utc::now().timestamp(),
            url: route.url.clone(),
            contract_address: route.addr.to_hex(),
            action: "url-verification".to_string(),
        };
        let blob_value = serde_json::to_value(&blob).map_err(|e| ChallengeError::ResponseInvalid(e.to_string()))?;
        let signature = crypto::rsa_sign_json(&self.rsa_keys.private_key, &blob_value)?;

        let record = ChallengeRecord {
            challenge_id,
            addr: route.addr,
            url: route.url.clone(),
            expected_signer: route.signer,
            issued_at: Utc::now(),
            state: ChallengeState::Pending,
        };
        self.records.insert(route.addr, record);

        let body = ChallengeRequestBody { challenge: blob.clone(), signature };
        let session_key = self.session_keys.get(&route.addr).map(|r| *r.value());

        let endpoint = format!("{}/challenge", route.url.trim_end_matches('/'));
        let send_fut = self.send_challenge(&endpoint, &body, session_key);

        let result = tokio::time::timeout(self.challenge_timeout, send_fut).await;
        let state = match result {
            Err(_) => {
                self.set_state(route.addr, ChallengeState::Expired);
                self.notify(&route.url, route.addr, false).await;
                return Ok(ChallengeState::Expired);
            }
            Ok(Err(err)) => {
                self.set_state(route.addr, ChallengeState::Failed);
                self.notify(&route.url, route.addr, false).await;
                return Err(err);
            }
            Ok(Ok(response)) => response,
        };

        if response_ok(&state, &blob, route, &challenge_id).is_ok() {
            let new_session_key = crypto::random_bytes_32();
            self.session_keys.insert(route.addr, new_session_key);
            self.install(route).await?;
            self.set_state(route.addr, ChallengeState::Verified);
            self.notify(&route.url, route.addr, true).await;
            Ok(ChallengeState::Verified)
        } else {
            self.set_state(route.addr, ChallengeState::Failed);
            self.notify(&route.url, route.addr, false).await;
            Ok(ChallengeState::Failed)
        }
    }

    async fn send_challenge(
        &self,
        endpoint: &str,
        body: &ChallengeRequestBody,
        session_key: Option<[u8; AES_KEY_LEN]>,
    ) -> Result<ChallengeResponseBody, ChallengeError> {
        let request = self.http.post(endpoint);
        let response = if let Some(key) = session_key {
            let plaintext = serde_json::to_vec(body).map_err(|e| ChallengeError::ResponseInvalid(e.to_string()))?;
            let envelope = crypto::session_encrypt(&key, &plaintext);
            request.json(&envelope).send().await?
        } else {
            request.json(body).send().await?
        };

        if !response.status().is_success() {
            return Err(ChallengeError::ResponseInvalid(format!("prover returned {}", response.status())));
        }

        let bytes = response.bytes().await?;
        let parsed: ChallengeResponseBody = if let Some(key) = session_key {
            if let Ok(envelope) = serde_json::from_slice::<HybridEnvelope>(&bytes) {
                let plaintext = crypto::session_decrypt(&key, &envelope)?;
                serde_json::from_slice(&plaintext).map_err(|e| ChallengeError::ResponseInvalid(e.to_string()))?
            } else {
                serde_json::from_slice(&bytes).map_err(|e| ChallengeError::ResponseInvalid(e.to_string()))?
            }
        } else {
            serde_json::from_slice(&bytes).map_err(|e| ChallengeError::ResponseInvalid(e.to_string()))?
        };
        Ok(parsed)
    }

    async fn install(&self, route: &ValidRoute) -> Result<(), ChallengeError> {
        let stored_route = Route {
            url: route.url.clone(),
            proof_type: match route.witness {
                Witness::Create { .. } => crate::store::ProofType::Create,
                Witness::Create2 { .. } => crate::store::ProofType::Create2,
            },
            witness: match route.witness {
                Witness::Create { nonce } => ProofWitness::Create { nonce },
                Witness::Create2 { salt, init_code_hash } => ProofWitness::Create2 {
                    salt: format!("0x{}", hex::encode(salt)),
                    init_code_hash: format!("0x{}", hex::encode(init_code_hash)),
                },
            },
            signer_addr: route.signer.to_hex(),
            installed_at: Utc::now(),
        };
        let mut new = HashMap::new();
        new.insert(route.addr.to_hex(), stored_route);
        let mut store = self.store.write().await;
        store.update_routes(new)?;
        Ok(())
    }

    fn set_state(&self, addr: Address, state: ChallengeState) {
        if let Some(mut record) = self.records.get_mut(&addr) {
            record.state = state;
        }
    }

    /// Best-effort confirmation POST; failure never rolls back an
    /// install that already happened.
    async fn notify(&self, url: &str, addr: Address, success: bool) {
        send_confirmation(&self.http, url, &addr.to_hex(), success).await;
    }

    pub fn state_of(&self, addr: Address) -> Option<ChallengeState> {
        self.records.get(&addr).map(|r| r.state)
    }
}

/// Best-effort `/confirmation` POST, shared by the challenge engine (for
/// challenge-round outcomes) and the log ingestor (for routes rejected
/// before a challenge round ever starts, per the "one confirmation per
/// announced route" contract).
pub async fn send_confirmation(http: &reqwest::Client, url: &str, addr: &str, success: bool) {
    let endpoint = format!("{}/confirmation", url.trim_end_matches('/'));
    let body = ConfirmationBody {
        addr: addr.to_string(),
        status: if success { "verified" } else { "failed" },
        verified_routes: if success { 1 } else { 0 },
        total_routes: 1,
    };
    const MAX_ATTEMPTS: u32 = 3;
    for attempt in 0..MAX_ATTEMPTS {
        match http.post(&endpoint).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => warn!(addr = %addr, status = %resp.status(), attempt, "confirmation rejected by prover"),
            Err(err) => warn!(addr = %addr, error = %err, attempt, "confirmation delivery failed"),
        }
        tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt))).await;
    }
}

fn response_ok(
    response: &ChallengeResponseBody,
    blob: &ChallengeBlob,
    route: &ValidRoute,
    expected_challenge_id: &[u8; 32],
) -> Result<(), ChallengeError> {
    let expected_id_hex = format!("0x{}", hex::encode(expected_challenge_id));
    if response.challenge_id != expected_id_hex {
        return Err(ChallengeError::ResponseInvalid("challengeId mismatch".into()));
    }
    if response.status != "ok" && response.status != "verified" {
        return Err(ChallengeError::ResponseInvalid(format!("prover reported status {}", response.status)));
    }
    let blob_value = serde_json::to_value(blob).map_err(|e| ChallengeError::ResponseInvalid(e.to_string()))?;
    let canonical = crypto::canonical_json(&blob_value);
    let sig = EcdsaSignature::from_hex(&response.signature).map_err(|_| ChallengeError::ResponseInvalid("bad signature hex".into()))?;
    if crypto::eip191_verify(canonical.as_bytes(), &sig, route.signer) {
        Ok(())
    } else {
        Err(ChallengeError::ResponseInvalid("signature did not recover to expected signer".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::RawRoute;
    use k256::ecdsa::{SigningKey, VerifyingKey};
    use sha3::Digest;

    fn signer_address(key: &SigningKey) -> Address {
        let verifying_key = VerifyingKey::from(key);
        let uncompressed = verifying_key.to_encoded_point(false);
        let hash = sha3::Keccak256::digest(&uncompressed.as_bytes()[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&hash[12..]);
        Address(out)
    }

    fn sample_route(signer: Address) -> ValidRoute {
        ValidRoute {
            addr: Address([0x11; 20]),
            url: "https://prover.example".to_string(),
            witness: Witness::Create { nonce: 0 },
            signer,
            raw: RawRoute {
                addr: Address([0x11; 20]).to_hex(),
                proof_type: "create".to_string(),
                url: "https://prover.example".to_string(),
                sig: "0x00".to_string(),
                nonce: Some(0),
                salt: None,
                init_code_hash: None,
            },
        }
    }

    fn sample_blob(route: &ValidRoute, challenge_id: &[u8; 32]) -> ChallengeBlob {
        ChallengeBlob {
            challenge_id: format!("0x{}", hex::encode(challenge_id)),
            ts: 0,
            url: route.url.clone(),
            contract_address: route.addr.to_hex(),
            action: "url-verification".to_string(),
        }
    }

    #[test]
    fn response_ok_accepts_correctly_signed_reply() {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let signer = signer_address(&signing_key);
        let route = sample_route(signer);
        let challenge_id = [0x42; 32];
        let blob = sample_blob(&route, &challenge_id);

        let blob_value = serde_json::to_value(&blob).unwrap();
        let canonical = crypto::canonical_json(&blob_value);
        let sig = crypto::eip191_sign(&signing_key, canonical.as_bytes());

        let response = ChallengeResponseBody {
            challenge_id: blob.challenge_id.clone(),
            signature: sig.to_hex(),
            status: "verified".to_string(),
        };

        assert!(response_ok(&response, &blob, &route, &challenge_id).is_ok());
    }

    #[test]
    fn response_ok_rejects_challenge_id_mismatch() {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let signer = signer_address(&signing_key);
        let route = sample_route(signer);
        let challenge_id = [0x42; 32];
        let blob = sample_blob(&route, &challenge_id);

        let response = ChallengeResponseBody {
            challenge_id: "0xdeadbeef".to_string(),
            signature: "0x".to_string() + &"00".repeat(65),
            status: "verified".to_string(),
        };

        let err = response_ok(&response, &blob, &route, &challenge_id).unwrap_err();
        assert!(matches!(err, ChallengeError::ResponseInvalid(ref m) if m.contains("challengeId")));
    }

    #[test]
    fn response_ok_rejects_signature_from_wrong_signer() {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let signer = signer_address(&signing_key);
        let route = sample_route(signer);
        let challenge_id = [0x42; 32];
        let blob = sample_blob(&route, &challenge_id);

        // Sign with a different key than the one the route expects.
        let impostor_key = SigningKey::random(&mut rand::thread_rng());
        let blob_value = serde_json::to_value(&blob).unwrap();
        let canonical = crypto::canonical_json(&blob_value);
        let sig = crypto::eip191_sign(&impostor_key, canonical.as_bytes());

        let response = ChallengeResponseBody {
            challenge_id: blob.challenge_id.clone(),
            signature: sig.to_hex(),
            status: "verified".to_string(),
        };

        let err = response_ok(&response, &blob, &route, &challenge_id).unwrap_err();
        assert!(matches!(err, ChallengeError::ResponseInvalid(ref m) if m.contains("recover")));
    }

    #[tokio::test]
    async fn submit_coalesces_second_announcement_while_a_round_is_in_flight() {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        let signer = signer_address(&signing_key);
        let route_a = sample_route(signer);
        let mut route_b = sample_route(signer);
        route_b.witness = Witness::Create { nonce: 1 };

        let store = Arc::new(RwLock::new(Store::load(&std::env::temp_dir().join(format!(
            "rpc-relay-proxy-challenge-{}-coalesce",
            std::process::id()
        ))).unwrap()));
        let rsa_keys = Arc::new(RsaKeyPair::generate().unwrap());
        let engine = Arc::new(ChallengeEngine::new(store, rsa_keys, Duration::from_millis(50), 4));

        engine.in_flight.insert(route_a.addr, ());
        engine.submit(route_b.clone()).await;

        assert!(engine.queued_next.contains_key(&route_a.addr));
        assert!(matches!(engine.queued_next.get(&route_a.addr).unwrap().witness, Witness::Create { nonce: 1 }));
    }
}
