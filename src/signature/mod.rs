//! Signature Verifier
//!
//! プラグイン署名の検証・トラストストア・失効リスト

pub mod revocation;
pub mod trust_store;
pub mod types;
pub mod verifier;

pub use revocation::RevocationList;
pub use trust_store::TrustStore;
pub use types::{
    PluginSignature, RevocationEntry, SignatureAlgorithm, TrustedPublisher, VerificationChecks,
    VerificationResult,
};
pub use verifier::{sign_plugin, signing_payload, PublisherKey, SignatureVerifier};
