/*
 * Responsibility
 * - 環境変数の読み込み (JWKS_URL, header 名, cache 設定, CORS 許可など)
 * - claim mapping の読み込み (JSON ファイル + inline list, inline が優先)
 * - 設定値のバリデーション (不正なら起動失敗)
 */
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderName;
use url::Url;

use crate::services::auth::ClaimMapping;
use crate::services::cache::{CacheConfigError, CachePolicy};

const DEFAULT_CLAIM_MAPPING_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    fn from_value(value: Option<&str>) -> Self {
        match value
            .unwrap_or("development")
            .to_ascii_lowercase()
            .as_str()
        {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str),
    ClaimMapping(String),
    Cache(CacheConfigError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing configuration: {}", key),
            ConfigError::Invalid(key) => write!(f, "invalid configuration: {}", key),
            ConfigError::ClaimMapping(reason) => write!(f, "invalid claim mapping: {}", reason),
            ConfigError::Cache(e) => write!(f, "invalid cache configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Cache(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CacheConfigError> for ConfigError {
    fn from(e: CacheConfigError) -> Self {
        ConfigError::Cache(e)
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_keys: u64,
    pub policy: CachePolicy,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub app_env: AppEnv,
    pub log_level: String,
    pub log_format: LogFormat,
    pub cors_allowed_origins: Vec<String>,

    pub jwks_url: Url,
    // Fail startup when the first key-set fetch fails.
    pub force_jwks_on_start: bool,
    pub jwks_fetch_timeout: Duration,
    pub jwks_min_refresh_interval: Duration,

    pub claim_mapping: ClaimMapping,
    pub auth_header: HeaderName,
    pub validated_header: HeaderName,
    pub auth_header_required: bool,

    pub cache: CacheConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key/value source.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port: u16 = parse_or(get("PORT"), "PORT", 8080)?;
        let addr: SocketAddr = SocketAddr::from_str(&format!("0.0.0.0:{}", port))
            .map_err(|_| ConfigError::Invalid("PORT"))?;

        let app_env = AppEnv::from_value(get("APP_ENV").as_deref());

        let log_level = get("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_format = match get("LOG_TYPE").as_deref() {
            None | Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            Some(_) => return Err(ConfigError::Invalid("LOG_TYPE")),
        };

        let cors_allowed_origins = get("CORS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        let jwks_url = get("JWKS_URL").ok_or(ConfigError::Missing("JWKS_URL"))?;
        let jwks_url = Url::parse(&jwks_url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or(ConfigError::Invalid("JWKS_URL"))?;

        let force_jwks_on_start = flag(get("FORCE_JWKS_ON_START"), "FORCE_JWKS_ON_START", true)?;
        let jwks_fetch_timeout = seconds(
            get("JWKS_FETCH_TIMEOUT_SECONDS"),
            "JWKS_FETCH_TIMEOUT_SECONDS",
            5,
        )?;
        if jwks_fetch_timeout.is_zero() {
            return Err(ConfigError::Invalid("JWKS_FETCH_TIMEOUT_SECONDS"));
        }
        let jwks_min_refresh_interval = seconds(
            get("JWKS_MIN_REFRESH_INTERVAL_SECONDS"),
            "JWKS_MIN_REFRESH_INTERVAL_SECONDS",
            10,
        )?;

        let auth_header = header_name(get("AUTH_HEADER_KEY"), "AUTH_HEADER_KEY", "authorization")?;
        let validated_header = header_name(
            get("TOKEN_VALIDATED_HEADER_KEY"),
            "TOKEN_VALIDATED_HEADER_KEY",
            "jwt-token-validated",
        )?;
        let auth_header_required =
            flag(get("AUTH_HEADER_REQUIRED"), "AUTH_HEADER_REQUIRED", false)?;

        let claim_mapping = load_claim_mapping(
            get("CLAIM_MAPPING_FILE_PATH"),
            get("CLAIM_MAPPINGS"),
            &validated_header,
        )?;

        let cache = CacheConfig {
            enabled: flag(get("CACHE_ENABLED"), "CACHE_ENABLED", true)?,
            max_keys: parse_or(get("MAX_CACHE_KEYS"), "MAX_CACHE_KEYS", 10_000)?,
            policy: CachePolicy {
                max_ttl: seconds(get("CACHE_MAX_TTL_SECONDS"), "CACHE_MAX_TTL_SECONDS", 3600)?,
                expiry_margin: seconds(
                    get("CACHE_EXPIRY_MARGIN_SECONDS"),
                    "CACHE_EXPIRY_MARGIN_SECONDS",
                    120,
                )?,
                error_ttl: seconds(
                    get("CACHE_ERROR_TTL_SECONDS"),
                    "CACHE_ERROR_TTL_SECONDS",
                    600,
                )?,
            },
        };
        cache.policy.validate(cache.max_keys)?;

        Ok(Self {
            addr,
            app_env,
            log_level,
            log_format,
            cors_allowed_origins,
            jwks_url,
            force_jwks_on_start,
            jwks_fetch_timeout,
            jwks_min_refresh_interval,
            claim_mapping,
            auth_header,
            validated_header,
            auth_header_required,
            cache,
        })
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid(key)),
    }
}

fn seconds(value: Option<String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_or(value, key, default).map(Duration::from_secs)
}

fn flag(value: Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match value.as_deref() {
        None => Ok(default),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(_) => Err(ConfigError::Invalid(key)),
    }
}

fn header_name(
    value: Option<String>,
    key: &'static str,
    default: &'static str,
) -> Result<HeaderName, ConfigError> {
    match value {
        None => Ok(HeaderName::from_static(default)),
        Some(v) => HeaderName::from_bytes(v.as_bytes()).map_err(|_| ConfigError::Invalid(key)),
    }
}

fn load_claim_mapping(
    file_path: Option<String>,
    inline: Option<String>,
    validated_header: &HeaderName,
) -> Result<ClaimMapping, ConfigError> {
    // The default file is optional; a path that was set explicitly is not.
    let mut entries = match file_path {
        Some(path) => read_mapping_file(Path::new(&path))?,
        None if !Path::new(DEFAULT_CLAIM_MAPPING_FILE).exists() => BTreeMap::new(),
        None => read_mapping_file(Path::new(DEFAULT_CLAIM_MAPPING_FILE))?,
    };

    // Inline entries win over the file on the same source claim.
    if let Some(inline) = inline {
        entries.extend(parse_inline_mappings(&inline)?);
    }

    let mapping = ClaimMapping::new(entries).map_err(|e| ConfigError::ClaimMapping(e.to_string()))?;

    if mapping.maps_to(validated_header) {
        return Err(ConfigError::ClaimMapping(format!(
            "destination {} is reserved for the validation marker",
            validated_header
        )));
    }

    Ok(mapping)
}

fn read_mapping_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => {
            ConfigError::ClaimMapping(format!("{} does not exist", path.display()))
        }
        _ => ConfigError::ClaimMapping(format!("{}: {}", path.display(), e)),
    })?;

    serde_json::from_str(&raw).map_err(|e| {
        ConfigError::ClaimMapping(format!(
            "{} is not a JSON object of strings: {}",
            path.display(),
            e
        ))
    })
}

/// Parse `src:dest,src:dest`. The last `:` of each pair separates the two sides.
fn parse_inline_mappings(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (source, dest) = entry
                .rsplit_once(':')
                .map(|(s, d)| (s.trim(), d.trim()))
                .filter(|(s, d)| !s.is_empty() && !d.is_empty())
                .ok_or_else(|| {
                    ConfigError::ClaimMapping(format!("entry {:?} is not source:destination", entry))
                })?;
            Ok((source.to_string(), dest.to_string()))
        })
        .collect()
}
