/*
 * Responsibility
 * - 検証結果のキャッシュ (raw token 単位, singleflight)
 * - TTL ポリシー
 */
pub mod decoder;
pub mod policy;

pub use decoder::{CacheStats, CachedDecoder};
pub use policy::{CacheConfigError, CachePolicy};
