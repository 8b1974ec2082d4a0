/*
 * Responsibility
 * - middleware の公開インターフェース
 * - http (request id / limit / timeout / trace / latency), cors
 */
pub mod cors;
pub mod http;
