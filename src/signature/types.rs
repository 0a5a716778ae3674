//! Signature Verifier Types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::TrustLevel;

/// 署名アルゴリズム
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// Ed25519
    #[serde(rename = "ed25519")]
    Ed25519,
    /// ECDSA P-256 / SHA-256（ASN.1 DER）
    #[serde(rename = "ecdsa-p256-sha256")]
    EcdsaP256Sha256,
    /// RSA PKCS#1 v1.5 / SHA-256（2048-8192 bit）
    #[serde(rename = "rsa-pkcs1-sha256")]
    RsaPkcs1Sha256,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
            SignatureAlgorithm::EcdsaP256Sha256 => "ecdsa-p256-sha256",
            SignatureAlgorithm::RsaPkcs1Sha256 => "rsa-pkcs1-sha256",
        }
    }

    /// ring の検証アルゴリズム
    pub(crate) fn verification_algorithm(&self) -> &'static dyn ring::signature::VerificationAlgorithm {
        match self {
            SignatureAlgorithm::Ed25519 => &ring::signature::ED25519,
            SignatureAlgorithm::EcdsaP256Sha256 => &ring::signature::ECDSA_P256_SHA256_ASN1,
            SignatureAlgorithm::RsaPkcs1Sha256 => &ring::signature::RSA_PKCS1_2048_8192_SHA256,
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// プラグインに添付される署名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSignature {
    /// アルゴリズム
    pub algorithm: SignatureAlgorithm,
    /// 署名鍵のID
    pub key_id: String,
    /// 署名（base64）
    pub signature: String,
    /// 署名時刻
    pub timestamp: DateTime<Utc>,
}

/// 信頼済み発行者（トラストストアのレコード）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPublisher {
    /// 鍵ID
    pub key_id: String,
    /// 発行者名
    pub name: String,
    /// 公開鍵（base64）
    ///
    /// Ed25519 は生の32バイト、ECDSA は非圧縮点、RSA は PKCS#1 DER。
    pub public_key: String,
    /// アルゴリズム
    pub algorithm: SignatureAlgorithm,
    /// 付与する信頼レベル
    pub trust_level: TrustLevel,
    /// 有効期間の開始
    pub valid_from: DateTime<Utc>,
    /// 有効期間の終了
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    /// 許可された権限
    #[serde(default)]
    pub permissions: Vec<String>,
    /// 失効フラグ
    #[serde(default)]
    pub revoked: bool,
}

impl TrustedPublisher {
    /// 指定時刻が有効期間内か
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.valid_from && self.valid_until.map_or(true, |until| at <= until)
    }
}

/// 失効レコード
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationEntry {
    pub key_id: String,
    pub revocation_date: DateTime<Utc>,
    pub reason: String,
}

/// 個別チェックの結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationChecks {
    pub format_valid: bool,
    pub signature_valid: bool,
    pub not_revoked: bool,
    pub timestamp_valid: bool,
    pub trust_sufficient: bool,
}

impl VerificationChecks {
    /// すべてのチェックを通過したか
    pub fn all_passed(&self) -> bool {
        self.format_valid
            && self.signature_valid
            && self.not_revoked
            && self.timestamp_valid
            && self.trust_sufficient
    }
}

/// 署名検証の結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    /// 有効か
    pub valid: bool,
    /// 解決された信頼レベル
    pub trust_level: TrustLevel,
    /// プラグインのフィンガープリント
    pub fingerprint: String,
    /// 署名鍵ID
    pub key_id: Option<String>,
    /// 発行者名
    pub publisher: Option<String>,
    /// 個別チェック
    pub checks: VerificationChecks,
    /// 警告
    pub warnings: Vec<String>,
    /// エラー
    pub errors: Vec<String>,
    /// 検証時刻
    pub verified_at: DateTime<Utc>,
    /// キャッシュから返されたか
    #[serde(default)]
    pub cached: bool,
}

impl VerificationResult {
    /// 拒否結果（信頼なし）
    pub fn rejected(fingerprint: String, key_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            valid: false,
            trust_level: TrustLevel::Untrusted,
            fingerprint,
            key_id,
            publisher: None,
            checks: VerificationChecks::default(),
            warnings: Vec::new(),
            errors: vec![error.into()],
            verified_at: Utc::now(),
            cached: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_algorithm_serde_names() {
        let json = serde_json::to_string(&SignatureAlgorithm::EcdsaP256Sha256).unwrap();
        assert_eq!(json, "\"ecdsa-p256-sha256\"");
        let parsed: SignatureAlgorithm = serde_json::from_str("\"rsa-pkcs1-sha256\"").unwrap();
        assert_eq!(parsed, SignatureAlgorithm::RsaPkcs1Sha256);
    }

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let publisher = TrustedPublisher {
            key_id: "k".to_string(),
            name: "p".to_string(),
            public_key: String::new(),
            algorithm: SignatureAlgorithm::Ed25519,
            trust_level: TrustLevel::Verified,
            valid_from: now - Duration::days(1),
            valid_until: Some(now + Duration::days(1)),
            permissions: Vec::new(),
            revoked: false,
        };
        assert!(publisher.is_valid_at(now));
        assert!(!publisher.is_valid_at(now - Duration::days(2)));
        assert!(!publisher.is_valid_at(now + Duration::days(2)));
    }
}
