/*
 * Responsibility
 * - トークン検証パイプラインの公開インターフェース
 * - decoder (seam) / jwks (鍵解決) / claims (claim -> header) / verifier
 */
pub mod claims;
pub mod decoder;
pub mod jwks;
pub mod verifier;

pub use claims::ClaimMapping;
pub use decoder::{DecodeError, DecodeResult, KeyResolutionError, TokenDecoder, VerifiedToken};
pub use jwks::{HttpKeySource, KeyResolver, KeySource};
pub use verifier::JwsVerifier;
