//! Signature Verifier
//!
//! フィンガープリントへの署名を検証し、トラストストアを通して信頼レベルを解決する。
//! 結果は（フィンガープリント, 署名）の組でキャッシュし、鍵の失効・追加時に破棄する。

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair, UnparsedPublicKey,
    ECDSA_P256_SHA256_ASN1_SIGNING, RSA_PKCS1_SHA256,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::revocation::RevocationList;
use super::trust_store::TrustStore;
use super::types::{
    PluginSignature, RevocationEntry, SignatureAlgorithm, TrustedPublisher, VerificationChecks,
    VerificationResult,
};
use crate::config::SignatureConfig;
use crate::error::{Error, Result};
use crate::plugin::Plugin;
use crate::types::TrustLevel;

/// 有効期限が近いと警告する日数
const EXPIRY_WARNING_DAYS: i64 = 30;

/// 署名対象のペイロード
pub fn signing_payload(fingerprint: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}:{}",
        fingerprint,
        timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

enum KeyMaterial {
    Ed25519(Ed25519KeyPair),
    EcdsaP256(EcdsaKeyPair),
    Rsa(RsaKeyPair),
}

/// 発行者の署名鍵
pub struct PublisherKey {
    algorithm: SignatureAlgorithm,
    material: KeyMaterial,
    rng: SystemRandom,
}

impl PublisherKey {
    /// 新しい鍵を生成し、PKCS#8 と共に返す
    ///
    /// RSA 鍵の生成はできないため、RSA は `from_pkcs8` で読み込む。
    pub fn generate(algorithm: SignatureAlgorithm) -> Result<(Self, Vec<u8>)> {
        let rng = SystemRandom::new();
        let pkcs8 = match algorithm {
            SignatureAlgorithm::Ed25519 => Ed25519KeyPair::generate_pkcs8(&rng),
            SignatureAlgorithm::EcdsaP256Sha256 => {
                EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            }
            SignatureAlgorithm::RsaPkcs1Sha256 => {
                return Err(Error::Signature(
                    "RSA key generation is not supported; load an existing key".to_string(),
                ))
            }
        }
        .map_err(|_| Error::Signature("key generation failed".to_string()))?;

        let pkcs8 = pkcs8.as_ref().to_vec();
        let key = Self::from_pkcs8(algorithm, &pkcs8)?;
        Ok((key, pkcs8))
    }

    /// PKCS#8 から読み込み
    pub fn from_pkcs8(algorithm: SignatureAlgorithm, pkcs8: &[u8]) -> Result<Self> {
        let rng = SystemRandom::new();
        let material = match algorithm {
            SignatureAlgorithm::Ed25519 => Ed25519KeyPair::from_pkcs8(pkcs8)
                .map(KeyMaterial::Ed25519)
                .map_err(|e| Error::Signature(format!("invalid ed25519 key: {}", e)))?,
            SignatureAlgorithm::EcdsaP256Sha256 => {
                EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, &rng)
                    .map(KeyMaterial::EcdsaP256)
                    .map_err(|e| Error::Signature(format!("invalid ecdsa key: {}", e)))?
            }
            SignatureAlgorithm::RsaPkcs1Sha256 => RsaKeyPair::from_pkcs8(pkcs8)
                .map(KeyMaterial::Rsa)
                .map_err(|e| Error::Signature(format!("invalid rsa key: {}", e)))?,
        };
        Ok(Self {
            algorithm,
            material,
            rng,
        })
    }

    pub fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// トラストストアに登録する形式の公開鍵（base64）
    pub fn public_key_base64(&self) -> String {
        let bytes = match &self.material {
            KeyMaterial::Ed25519(pair) => pair.public_key().as_ref().to_vec(),
            KeyMaterial::EcdsaP256(pair) => pair.public_key().as_ref().to_vec(),
            KeyMaterial::Rsa(pair) => pair.public_key().as_ref().to_vec(),
        };
        STANDARD.encode(bytes)
    }

    /// メッセージに署名
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match &self.material {
            KeyMaterial::Ed25519(pair) => Ok(pair.sign(message).as_ref().to_vec()),
            KeyMaterial::EcdsaP256(pair) => pair
                .sign(&self.rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|_| Error::Signature("ecdsa signing failed".to_string())),
            KeyMaterial::Rsa(pair) => {
                let mut signature = vec![0u8; pair.public().modulus_len()];
                pair.sign(&RSA_PKCS1_SHA256, &self.rng, message, &mut signature)
                    .map_err(|_| Error::Signature("rsa signing failed".to_string()))?;
                Ok(signature)
            }
        }
    }
}

/// プラグインに署名する
pub fn sign_plugin(
    plugin: &Plugin,
    key: &PublisherKey,
    key_id: &str,
    timestamp: DateTime<Utc>,
) -> Result<PluginSignature> {
    let payload = signing_payload(&plugin.fingerprint(), timestamp);
    let signature = key.sign(payload.as_bytes())?;
    Ok(PluginSignature {
        algorithm: key.algorithm(),
        key_id: key_id.to_string(),
        signature: STANDARD.encode(signature),
        timestamp,
    })
}

struct CachedVerification {
    result: VerificationResult,
    cached_at: Instant,
}

/// 署名検証器
pub struct SignatureVerifier {
    config: SignatureConfig,
    trust_store: RwLock<TrustStore>,
    revocations: RwLock<RevocationList>,
    cache: RwLock<HashMap<(String, String), CachedVerification>>,
}

impl SignatureVerifier {
    /// 設定されたパスからトラストストアと失効リストをロード
    pub async fn open(config: SignatureConfig) -> Result<Self> {
        let trust_store = match &config.trust_store_path {
            Some(path) => TrustStore::load(path.clone()).await?,
            None => TrustStore::in_memory(),
        };
        let revocations = match &config.revocation_list_path {
            Some(path) => RevocationList::load(path.clone()).await?,
            None => RevocationList::in_memory(),
        };
        Ok(Self::with_stores(config, trust_store, revocations))
    }

    pub fn with_stores(
        config: SignatureConfig,
        trust_store: TrustStore,
        revocations: RevocationList,
    ) -> Self {
        Self {
            config,
            trust_store: RwLock::new(trust_store),
            revocations: RwLock::new(revocations),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SignatureConfig {
        &self.config
    }

    /// 署名を検証する
    #[instrument(skip_all, fields(plugin = %plugin.id()))]
    pub async fn verify(
        &self,
        plugin: &Plugin,
        signature: Option<&PluginSignature>,
    ) -> VerificationResult {
        let fingerprint = plugin.fingerprint();

        let Some(signature) = signature else {
            if self.config.require_signature {
                warn!("Plugin is unsigned but a signature is required");
                return VerificationResult::rejected(
                    fingerprint,
                    None,
                    "signature required but not provided",
                );
            }
            let mut result = VerificationResult::rejected(fingerprint, None, "");
            result.errors.clear();
            result.valid = true;
            result.warnings.push("plugin is unsigned".to_string());
            return result;
        };

        let cache_key = (fingerprint.clone(), signature.signature.clone());
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        if let Some(entry) = self.cache.read().await.get(&cache_key) {
            if entry.cached_at.elapsed() < ttl {
                debug!("Signature verification cache hit");
                let mut result = entry.result.clone();
                result.cached = true;
                return result;
            }
        }

        let result = self.evaluate(fingerprint, signature, Utc::now()).await;
        if result.valid {
            info!(
                key_id = %signature.key_id,
                trust_level = %result.trust_level,
                "Signature verified"
            );
        } else {
            warn!(
                key_id = %signature.key_id,
                errors = ?result.errors,
                "Signature verification failed"
            );
        }

        if ttl > Duration::ZERO {
            self.cache.write().await.insert(
                cache_key,
                CachedVerification {
                    result: result.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        result
    }

    async fn evaluate(
        &self,
        fingerprint: String,
        signature: &PluginSignature,
        now: DateTime<Utc>,
    ) -> VerificationResult {
        let key_id = Some(signature.key_id.clone());

        if !self.config.allowed_algorithms.contains(&signature.algorithm) {
            return VerificationResult::rejected(
                fingerprint,
                key_id,
                format!("algorithm {} is not allowed", signature.algorithm),
            );
        }
        let signature_bytes = match STANDARD.decode(signature.signature.as_bytes()) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => {
                return VerificationResult::rejected(
                    fingerprint,
                    key_id,
                    "signature is not valid base64",
                )
            }
        };

        let publisher = match self.trust_store.read().await.get(&signature.key_id) {
            Some(publisher) => publisher.clone(),
            None => {
                return VerificationResult::rejected(
                    fingerprint,
                    key_id,
                    format!("unknown signing key {}", signature.key_id),
                )
            }
        };

        let mut result = VerificationResult::rejected(fingerprint, key_id, "");
        result.errors.clear();
        result.publisher = Some(publisher.name.clone());
        result.checks.format_valid = true;

        if publisher.algorithm != signature.algorithm {
            result.errors.push(format!(
                "key {} is registered for {}, not {}",
                publisher.key_id, publisher.algorithm, signature.algorithm
            ));
        } else {
            result.checks.signature_valid =
                verify_bytes(&publisher, &result.fingerprint, signature, &signature_bytes);
            if !result.checks.signature_valid {
                result.errors.push("signature does not match".to_string());
            }
        }

        let revoked = publisher.revoked || self.revocations.read().await.is_revoked(&publisher.key_id);
        result.checks.not_revoked = !revoked;
        if revoked {
            result.errors.push(format!("key {} is revoked", publisher.key_id));
        }

        result.checks.timestamp_valid = self.check_timestamp(&publisher, signature.timestamp, now, &mut result);

        // 暗号検証と失効チェックを通過した場合のみ発行者の信頼レベルを採用
        result.trust_level = if result.checks.signature_valid && result.checks.not_revoked {
            publisher.trust_level
        } else {
            TrustLevel::Untrusted
        };
        result.checks.trust_sufficient = result.trust_level >= self.config.minimum_trust_level;
        if !result.checks.trust_sufficient {
            result.errors.push(format!(
                "trust level {} is below the required {}",
                result.trust_level, self.config.minimum_trust_level
            ));
        }

        if let Some(until) = publisher.valid_until {
            if until > now && until - now < ChronoDuration::days(EXPIRY_WARNING_DAYS) {
                result
                    .warnings
                    .push(format!("key {} expires at {}", publisher.key_id, until));
            }
        }

        result.valid = result.checks.all_passed();
        result
    }

    fn check_timestamp(
        &self,
        publisher: &TrustedPublisher,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
        result: &mut VerificationResult,
    ) -> bool {
        let skew = ChronoDuration::seconds(self.config.max_clock_skew_secs as i64);
        let max_age = ChronoDuration::days(self.config.max_signature_age_days as i64);

        if timestamp > now + skew {
            result
                .errors
                .push(format!("signature timestamp {} is in the future", timestamp));
            return false;
        }
        if timestamp < now - max_age {
            result.errors.push(format!(
                "signature timestamp {} is older than {} days",
                timestamp, self.config.max_signature_age_days
            ));
            return false;
        }
        if !publisher.is_valid_at(timestamp) {
            result.errors.push(format!(
                "signature timestamp {} is outside the validity window of key {}",
                timestamp, publisher.key_id
            ));
            return false;
        }
        true
    }

    /// 発行者を登録（その鍵のキャッシュは破棄）
    pub async fn add_publisher(&self, publisher: TrustedPublisher) -> Result<()> {
        let key_id = publisher.key_id.clone();
        STANDARD
            .decode(publisher.public_key.as_bytes())
            .map_err(|e| Error::InvalidInput(format!("public key for {}: {}", key_id, e)))?;

        self.trust_store.write().await.upsert(publisher).await?;
        self.invalidate_key(&key_id).await;
        info!("Registered trusted publisher {}", key_id);
        Ok(())
    }

    /// 鍵を失効させる
    ///
    /// 失効リストとトラストストアの両方を書き直し、該当鍵のキャッシュを破棄する。
    #[instrument(skip(self))]
    pub async fn revoke_key(&self, key_id: &str, reason: &str) -> Result<RevocationEntry> {
        let entry = self.revocations.write().await.revoke(key_id, reason).await?;
        self.trust_store.write().await.mark_revoked(key_id).await?;
        let dropped = self.invalidate_key(key_id).await;
        warn!(dropped, "Revoked signing key {}: {}", key_id, reason);
        Ok(entry)
    }

    async fn invalidate_key(&self, key_id: &str) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.result.key_id.as_deref() != Some(key_id));
        before - cache.len()
    }

    pub async fn is_revoked(&self, key_id: &str) -> bool {
        self.revocations.read().await.is_revoked(key_id)
    }

    pub async fn publisher(&self, key_id: &str) -> Option<TrustedPublisher> {
        self.trust_store.read().await.get(key_id).cloned()
    }

    pub async fn publishers(&self) -> Vec<TrustedPublisher> {
        self.trust_store.read().await.list()
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}

fn verify_bytes(
    publisher: &TrustedPublisher,
    fingerprint: &str,
    signature: &PluginSignature,
    signature_bytes: &[u8],
) -> bool {
    let Ok(public_key) = STANDARD.decode(publisher.public_key.as_bytes()) else {
        return false;
    };
    let payload = signing_payload(fingerprint, signature.timestamp);
    UnparsedPublicKey::new(signature.algorithm.verification_algorithm(), public_key)
        .verify(payload.as_bytes(), signature_bytes)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginManifest;

    fn plugin(code: &str) -> Plugin {
        let manifest = PluginManifest::from_json(
            r#"{"name":"signed","version":"1.0.0","description":"d","entryPoints":["run"]}"#,
        )
        .unwrap();
        Plugin::new(manifest, code).unwrap()
    }

    fn publisher_for(key: &PublisherKey, key_id: &str, level: TrustLevel) -> TrustedPublisher {
        TrustedPublisher {
            key_id: key_id.to_string(),
            name: "Acme".to_string(),
            public_key: key.public_key_base64(),
            algorithm: key.algorithm(),
            trust_level: level,
            valid_from: Utc::now() - ChronoDuration::days(10),
            valid_until: None,
            permissions: Vec::new(),
            revoked: false,
        }
    }

    async fn verifier_with(key: &PublisherKey, level: TrustLevel) -> SignatureVerifier {
        let verifier = SignatureVerifier::with_stores(
            SignatureConfig::default(),
            TrustStore::in_memory(),
            RevocationList::in_memory(),
        );
        verifier
            .add_publisher(publisher_for(key, "acme-1", level))
            .await
            .unwrap();
        verifier
    }

    #[tokio::test]
    async fn test_valid_ed25519_signature() {
        let (key, _) = PublisherKey::generate(SignatureAlgorithm::Ed25519).unwrap();
        let verifier = verifier_with(&key, TrustLevel::Verified).await;
        let plugin = plugin("fn run() { 1 }");
        let signature = sign_plugin(&plugin, &key, "acme-1", Utc::now()).unwrap();

        let result = verifier.verify(&plugin, Some(&signature)).await;
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.trust_level, TrustLevel::Verified);
        assert!(!result.cached);

        let again = verifier.verify(&plugin, Some(&signature)).await;
        assert!(again.cached);
    }

    #[tokio::test]
    async fn test_valid_ecdsa_signature() {
        let (key, _) = PublisherKey::generate(SignatureAlgorithm::EcdsaP256Sha256).unwrap();
        let verifier = verifier_with(&key, TrustLevel::Trusted).await;
        let plugin = plugin("fn run() { 1 }");
        let signature = sign_plugin(&plugin, &key, "acme-1", Utc::now()).unwrap();

        let result = verifier.verify(&plugin, Some(&signature)).await;
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.trust_level, TrustLevel::Trusted);
    }

    #[tokio::test]
    async fn test_missing_signature_fails_closed() {
        let (key, _) = PublisherKey::generate(SignatureAlgorithm::Ed25519).unwrap();
        let verifier = verifier_with(&key, TrustLevel::Verified).await;

        let result = verifier.verify(&plugin("fn run() { 1 }"), None).await;
        assert!(!result.valid);
        assert_eq!(result.trust_level, TrustLevel::Untrusted);
    }

    #[tokio::test]
    async fn test_tampered_code_is_rejected() {
        let (key, _) = PublisherKey::generate(SignatureAlgorithm::Ed25519).unwrap();
        let verifier = verifier_with(&key, TrustLevel::Verified).await;
        let signature = sign_plugin(&plugin("fn run() { 1 }"), &key, "acme-1", Utc::now()).unwrap();

        let result = verifier.verify(&plugin("fn run() { 2 }"), Some(&signature)).await;
        assert!(!result.valid);
        assert!(!result.checks.signature_valid);
        assert_eq!(result.trust_level, TrustLevel::Untrusted);
    }

    #[tokio::test]
    async fn test_future_timestamp_is_rejected() {
        let (key, _) = PublisherKey::generate(SignatureAlgorithm::Ed25519).unwrap();
        let verifier = verifier_with(&key, TrustLevel::Verified).await;
        let plugin = plugin("fn run() { 1 }");
        let signature =
            sign_plugin(&plugin, &key, "acme-1", Utc::now() + ChronoDuration::hours(1)).unwrap();

        let result = verifier.verify(&plugin, Some(&signature)).await;
        assert!(result.checks.signature_valid);
        assert!(!result.checks.timestamp_valid);
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn test_trust_below_minimum() {
        let (key, _) = PublisherKey::generate(SignatureAlgorithm::Ed25519).unwrap();
        let verifier = verifier_with(&key, TrustLevel::Untrusted).await;
        let plugin = plugin("fn run() { 1 }");
        let signature = sign_plugin(&plugin, &key, "acme-1", Utc::now()).unwrap();

        let result = verifier.verify(&plugin, Some(&signature)).await;
        assert!(result.checks.signature_valid);
        assert!(!result.checks.trust_sufficient);
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn test_revocation_invalidates_cache() {
        let (key, _) = PublisherKey::generate(SignatureAlgorithm::Ed25519).unwrap();
        let verifier = verifier_with(&key, TrustLevel::Verified).await;
        let plugin = plugin("fn run() { 1 }");
        let signature = sign_plugin(&plugin, &key, "acme-1", Utc::now()).unwrap();

        assert!(verifier.verify(&plugin, Some(&signature)).await.valid);
        assert_eq!(verifier.cache_size().await, 1);

        verifier.revoke_key("acme-1", "key leaked").await.unwrap();
        assert_eq!(verifier.cache_size().await, 0);

        let result = verifier.verify(&plugin, Some(&signature)).await;
        assert!(!result.valid);
        assert!(!result.cached);
        assert!(!result.checks.not_revoked);
        assert!(verifier.publisher("acme-1").await.unwrap().revoked);
    }

    #[tokio::test]
    async fn test_unknown_key_and_disallowed_algorithm() {
        let (key, _) = PublisherKey::generate(SignatureAlgorithm::Ed25519).unwrap();
        let verifier = SignatureVerifier::with_stores(
            SignatureConfig {
                allowed_algorithms: vec![SignatureAlgorithm::EcdsaP256Sha256],
                ..Default::default()
            },
            TrustStore::in_memory(),
            RevocationList::in_memory(),
        );
        let plugin = plugin("fn run() { 1 }");
        let signature = sign_plugin(&plugin, &key, "nobody", Utc::now()).unwrap();

        let result = verifier.verify(&plugin, Some(&signature)).await;
        assert!(!result.valid);
        assert!(result.errors[0].contains("not allowed"));
    }
}
