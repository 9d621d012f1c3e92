//! Environment-backed runtime configuration for `mambo-terminal`.

use std::{env, error::Error, fmt, path::PathBuf};

use chat_core::ChatInitConfig;
use chat_supabase::{DEFAULT_GEO_URL, SupabaseConfig};
use chrono::FixedOffset;
use url::Url;

const DEFAULT_DATA_DIR: &str = "./.mambo-store";
const DEVICE_STORE_FILENAME: &str = "device.json";
const DEFAULT_PAGINATE_LIMIT: u16 = 50;
const DEFAULT_PAGINATION_COOLDOWN_MS: u64 = 750;
const DEFAULT_VIEWPORT_ROWS: u32 = 20;

/// Runtime configuration used by the terminal app.
#[derive(Debug, Clone, PartialEq)]
pub struct MamboConfig {
    /// Project base URL, always https.
    pub supabase_url: String,
    pub anon_key: String,
    /// GIF search is disabled without a key.
    pub tenor_api_key: Option<String>,
    pub geo_url: Url,
    pub data_dir: PathBuf,
    /// Optional runtime tuning forwarded to `ChatCommand::Init`.
    pub init_config: Option<ChatInitConfig>,
    /// Page size sent with `ChatCommand::LoadOlder`.
    pub paginate_limit: u16,
    /// Cooldown used to suppress repeated pagination requests.
    pub pagination_cooldown_ms: u64,
    /// Messages shown per screen.
    pub viewport_rows: u32,
    /// Fixed display offset; the host's local offset is used when absent.
    pub utc_offset: Option<FixedOffset>,
}

impl MamboConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let raw_url = optional_trimmed_env("MAMBO_SUPABASE_URL", &mut lookup)
            .ok_or(ConfigError::Missing("MAMBO_SUPABASE_URL"))?;
        let supabase_url = normalize_project_url(&raw_url).map_err(|reason| {
            ConfigError::InvalidValue {
                key: "MAMBO_SUPABASE_URL",
                value: raw_url.clone(),
                reason,
            }
        })?;
        let anon_key = optional_trimmed_env("MAMBO_SUPABASE_ANON_KEY", &mut lookup)
            .ok_or(ConfigError::Missing("MAMBO_SUPABASE_ANON_KEY"))?;
        let tenor_api_key = optional_trimmed_env("MAMBO_TENOR_API_KEY", &mut lookup);

        let geo_url = match optional_trimmed_env("MAMBO_GEO_URL", &mut lookup) {
            Some(value) => Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
                key: "MAMBO_GEO_URL",
                value: value.clone(),
                reason: err.to_string(),
            })?,
            None => Url::parse(DEFAULT_GEO_URL).map_err(|err| ConfigError::InvalidValue {
                key: "MAMBO_GEO_URL",
                value: DEFAULT_GEO_URL.to_owned(),
                reason: err.to_string(),
            })?,
        };

        let data_dir = optional_trimmed_env("MAMBO_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

        let page_size = parse_optional::<u16, _>("MAMBO_PAGE_SIZE", &mut lookup)?;
        let gif_limit = parse_optional::<u8, _>("MAMBO_GIF_LIMIT", &mut lookup)?;
        let image_bucket = optional_trimmed_env("MAMBO_IMAGE_BUCKET", &mut lookup);

        if page_size == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "MAMBO_PAGE_SIZE",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let init_config = if page_size.is_none() && gif_limit.is_none() && image_bucket.is_none() {
            None
        } else {
            Some(ChatInitConfig {
                page_size,
                gif_limit,
                image_bucket,
            })
        };

        let pagination_cooldown_ms =
            parse_optional::<u64, _>("MAMBO_PAGINATION_COOLDOWN_MS", &mut lookup)?
                .unwrap_or(DEFAULT_PAGINATION_COOLDOWN_MS);
        let viewport_rows = parse_optional::<u32, _>("MAMBO_VIEWPORT_ROWS", &mut lookup)?
            .unwrap_or(DEFAULT_VIEWPORT_ROWS)
            .max(1);

        let utc_offset = match optional_trimmed_env("MAMBO_UTC_OFFSET", &mut lookup) {
            Some(value) => Some(parse_utc_offset(&value).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "MAMBO_UTC_OFFSET",
                    value: value.clone(),
                    reason: "expected +HH:MM or -HH:MM".to_owned(),
                }
            })?),
            None => None,
        };

        Ok(Self {
            supabase_url,
            anon_key,
            tenor_api_key,
            geo_url,
            data_dir,
            init_config,
            paginate_limit: page_size.unwrap_or(DEFAULT_PAGINATE_LIMIT),
            pagination_cooldown_ms,
            viewport_rows,
            utc_offset,
        })
    }

    pub fn project(&self) -> Result<SupabaseConfig, chat_core::ChatError> {
        SupabaseConfig::new(&self.supabase_url, self.anon_key.clone())
    }

    /// File holding device preferences and the saved session.
    pub fn device_store_path(&self) -> PathBuf {
        self.data_dir.join(DEVICE_STORE_FILENAME)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is not set.
    Missing(&'static str),
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "{key} is required"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

/// Accepts a bare host or an http(s) URL and upgrades it to https.
fn normalize_project_url(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    let candidate = if let Some(rest) = raw.strip_prefix("https://") {
        format!("https://{}", rest.trim())
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("https://{}", rest.trim())
    } else if raw.contains("://") {
        return Err("only https project URLs are supported".to_owned());
    } else {
        format!("https://{raw}")
    };

    let parsed = Url::parse(&candidate).map_err(|err| format!("invalid project URL: {err}"))?;
    if parsed.host_str().is_none() {
        return Err("project URL must include a host".to_owned());
    }
    Ok(parsed.as_str().trim_end_matches('/').to_owned())
}

fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const REQUIRED: [(&str, &str); 2] = [
        ("MAMBO_SUPABASE_URL", "abc.supabase.co"),
        ("MAMBO_SUPABASE_ANON_KEY", "anon"),
    ];

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<MamboConfig, ConfigError> {
        let map = REQUIRED
            .iter()
            .chain(pairs)
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        MamboConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_required_fields_and_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");

        assert_eq!(cfg.supabase_url, "https://abc.supabase.co");
        assert_eq!(cfg.anon_key, "anon");
        assert_eq!(cfg.tenor_api_key, None);
        assert_eq!(cfg.geo_url.as_str(), DEFAULT_GEO_URL);
        assert_eq!(cfg.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(cfg.paginate_limit, DEFAULT_PAGINATE_LIMIT);
        assert_eq!(cfg.pagination_cooldown_ms, DEFAULT_PAGINATION_COOLDOWN_MS);
        assert_eq!(cfg.utc_offset, None);
        assert!(cfg.init_config.is_none());
    }

    #[test]
    fn requires_project_url_and_key() {
        let err = MamboConfig::from_lookup(|_| None).expect_err("url is required");
        assert_eq!(err, ConfigError::Missing("MAMBO_SUPABASE_URL"));

        let err = MamboConfig::from_lookup(|key| {
            (key == "MAMBO_SUPABASE_URL").then(|| "https://abc.supabase.co".to_owned())
        })
        .expect_err("key is required");
        assert_eq!(err, ConfigError::Missing("MAMBO_SUPABASE_ANON_KEY"));
    }

    #[test]
    fn upgrades_http_and_rejects_other_schemes() {
        let cfg = config_from_pairs(&[("MAMBO_SUPABASE_URL", "http://abc.supabase.co/")])
            .expect("http should upgrade");
        assert_eq!(cfg.supabase_url, "https://abc.supabase.co");

        let err = config_from_pairs(&[("MAMBO_SUPABASE_URL", "ftp://abc.supabase.co")])
            .expect_err("ftp should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "MAMBO_SUPABASE_URL",
                ..
            }
        ));
    }

    #[test]
    fn forwards_runtime_tuning_when_present() {
        let cfg = config_from_pairs(&[
            ("MAMBO_PAGE_SIZE", "30"),
            ("MAMBO_GIF_LIMIT", "8"),
            ("MAMBO_IMAGE_BUCKET", "uploads"),
            ("MAMBO_DATA_DIR", "/tmp/mambo"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.paginate_limit, 30);
        assert_eq!(cfg.device_store_path(), PathBuf::from("/tmp/mambo/device.json"));
        let init = cfg.init_config.expect("init config should be present");
        assert_eq!(init.page_size, Some(30));
        assert_eq!(init.gif_limit, Some(8));
        assert_eq!(init.image_bucket.as_deref(), Some("uploads"));
    }

    #[test]
    fn parses_fixed_utc_offset() {
        let cfg = config_from_pairs(&[("MAMBO_UTC_OFFSET", "+03:00")]).expect("config");
        assert_eq!(cfg.utc_offset, FixedOffset::east_opt(3 * 3600));

        let cfg = config_from_pairs(&[("MAMBO_UTC_OFFSET", "-05:30")]).expect("config");
        assert_eq!(cfg.utc_offset, FixedOffset::east_opt(-(5 * 3600 + 1800)));

        let err = config_from_pairs(&[("MAMBO_UTC_OFFSET", "EAT")]).expect_err("bad offset");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "MAMBO_UTC_OFFSET",
                ..
            }
        ));
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("MAMBO_PAGE_SIZE", "abc")])
            .expect_err("invalid page size should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "MAMBO_PAGE_SIZE",
                ..
            }
        ));

        let err = config_from_pairs(&[("MAMBO_PAGE_SIZE", "0")]).expect_err("zero should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "MAMBO_PAGE_SIZE",
                ..
            }
        ));
    }
}
