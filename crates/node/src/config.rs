use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_addr: SocketAddr,
    pub ledger_mode: LedgerMode,
    pub db_url: Option<String>,
    pub ledger_timeout_ms: u64,
    pub ledger_scan_limit: usize,
    pub local_cache_path: String,
    pub blob_mode: BlobMode,
    pub blob_publisher_url: Option<String>,
    pub blob_aggregator_url: Option<String>,
    pub blob_timeout_ms: u64,
    pub index_lease_epochs: u32,
    pub epoch_duration_ms: u64,
    pub renewal_window_ms: u64,
    pub recency_window_ms: u64,
    pub lease_standard_epochs: u32,
    pub lease_max_epochs: u32,
    pub policy_url: Option<String>,
    pub policy_timeout_ms: u64,
    pub policy_cache_max_entries: usize,
    pub policy_cache_ttl_ms: u64,
    pub query_max_fanout: usize,
    pub query_max_parallelism: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobMode {
    Memory,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

fn invalid(message: impl Into<String>) -> StartupError {
    StartupError {
        code: "ERR_INVALID_CONFIG",
        message: message.into(),
    }
}

impl NodeConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("DOCVAULT_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("DOCVAULT_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8090),
            "DOCVAULT_BIND_ADDR",
        )?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("DOCVAULT_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        if !bind_addr.ip().is_loopback()
            && !(dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()))
        {
            return Err(StartupError {
                code: "ERR_NONLOCAL_BIND",
                message: "operator endpoints bind to loopback only; refuse startup".to_string(),
            });
        }

        let ledger_mode = parse_ledger_mode(kv.get("DOCVAULT_LEDGER_MODE"))?;
        let db_url = match ledger_mode {
            LedgerMode::Postgres => Some(require_nonempty(kv, "DOCVAULT_DB_URL")?),
            LedgerMode::Memory => optional_nonempty(kv, "DOCVAULT_DB_URL"),
        };
        let ledger_timeout_ms = parse_u64(
            kv.get("DOCVAULT_LEDGER_TIMEOUT_MS"),
            2000,
            "DOCVAULT_LEDGER_TIMEOUT_MS",
        )?;
        let ledger_scan_limit = parse_usize(
            kv.get("DOCVAULT_LEDGER_SCAN_LIMIT"),
            256,
            "DOCVAULT_LEDGER_SCAN_LIMIT",
        )?;
        if ledger_scan_limit == 0 {
            return Err(invalid("DOCVAULT_LEDGER_SCAN_LIMIT must be >= 1"));
        }

        let local_cache_path = optional_nonempty(kv, "DOCVAULT_LOCAL_CACHE_PATH")
            .unwrap_or_else(|| "data/metadata-cache.json".to_string());

        let blob_mode = parse_blob_mode(kv.get("DOCVAULT_BLOB_MODE"))?;
        let (blob_publisher_url, blob_aggregator_url) = match blob_mode {
            BlobMode::Http => (
                Some(require_nonempty(kv, "DOCVAULT_BLOB_PUBLISHER_URL")?),
                Some(require_nonempty(kv, "DOCVAULT_BLOB_AGGREGATOR_URL")?),
            ),
            BlobMode::Memory => (None, None),
        };
        let blob_timeout_ms = parse_u64(
            kv.get("DOCVAULT_BLOB_TIMEOUT_MS"),
            5000,
            "DOCVAULT_BLOB_TIMEOUT_MS",
        )?;

        let index_lease_epochs = parse_u32(
            kv.get("DOCVAULT_INDEX_LEASE_EPOCHS"),
            docvault_registry::DEFAULT_INDEX_LEASE_EPOCHS,
            "DOCVAULT_INDEX_LEASE_EPOCHS",
        )?;
        if index_lease_epochs == 0 {
            return Err(invalid("DOCVAULT_INDEX_LEASE_EPOCHS must be >= 1"));
        }
        let epoch_duration_ms = parse_u64(
            kv.get("DOCVAULT_EPOCH_DURATION_MS"),
            DAY_MS,
            "DOCVAULT_EPOCH_DURATION_MS",
        )?;
        if epoch_duration_ms == 0 {
            return Err(invalid("DOCVAULT_EPOCH_DURATION_MS must be >= 1"));
        }
        let renewal_window_ms = parse_u64(
            kv.get("DOCVAULT_RENEWAL_WINDOW_MS"),
            7 * DAY_MS,
            "DOCVAULT_RENEWAL_WINDOW_MS",
        )?;
        let recency_window_ms = parse_u64(
            kv.get("DOCVAULT_RECENCY_WINDOW_MS"),
            30 * DAY_MS,
            "DOCVAULT_RECENCY_WINDOW_MS",
        )?;
        for (key, value) in [
            ("DOCVAULT_EPOCH_DURATION_MS", epoch_duration_ms),
            ("DOCVAULT_RENEWAL_WINDOW_MS", renewal_window_ms),
            ("DOCVAULT_RECENCY_WINDOW_MS", recency_window_ms),
        ] {
            if value > i64::MAX as u64 {
                return Err(invalid(format!("{} is out of range", key)));
            }
        }

        let lease_standard_epochs = parse_u32(
            kv.get("DOCVAULT_LEASE_STANDARD_EPOCHS"),
            30,
            "DOCVAULT_LEASE_STANDARD_EPOCHS",
        )?;
        let lease_max_epochs = parse_u32(
            kv.get("DOCVAULT_LEASE_MAX_EPOCHS"),
            90,
            "DOCVAULT_LEASE_MAX_EPOCHS",
        )?;
        if lease_standard_epochs == 0 {
            return Err(invalid("DOCVAULT_LEASE_STANDARD_EPOCHS must be >= 1"));
        }
        if lease_standard_epochs > lease_max_epochs {
            return Err(invalid(
                "DOCVAULT_LEASE_STANDARD_EPOCHS must be <= DOCVAULT_LEASE_MAX_EPOCHS",
            ));
        }

        let policy_url = optional_nonempty(kv, "DOCVAULT_POLICY_URL");
        let policy_timeout_ms = parse_u64(
            kv.get("DOCVAULT_POLICY_TIMEOUT_MS"),
            500,
            "DOCVAULT_POLICY_TIMEOUT_MS",
        )?;
        let policy_cache_max_entries = parse_usize(
            kv.get("DOCVAULT_POLICY_CACHE_MAX_ENTRIES"),
            0,
            "DOCVAULT_POLICY_CACHE_MAX_ENTRIES",
        )?;
        let policy_cache_ttl_ms = parse_u64(
            kv.get("DOCVAULT_POLICY_CACHE_TTL_MS"),
            0,
            "DOCVAULT_POLICY_CACHE_TTL_MS",
        )?;

        let query_max_fanout = parse_usize(
            kv.get("DOCVAULT_QUERY_MAX_FANOUT"),
            20,
            "DOCVAULT_QUERY_MAX_FANOUT",
        )?;
        if query_max_fanout == 0 {
            return Err(invalid("DOCVAULT_QUERY_MAX_FANOUT must be >= 1"));
        }
        let query_max_parallelism = parse_usize(
            kv.get("DOCVAULT_QUERY_MAX_PARALLELISM"),
            8,
            "DOCVAULT_QUERY_MAX_PARALLELISM",
        )?;
        if !(1..=256).contains(&query_max_parallelism) {
            return Err(invalid(
                "DOCVAULT_QUERY_MAX_PARALLELISM must be between 1 and 256",
            ));
        }

        Ok(Self {
            bind_addr,
            ledger_mode,
            db_url,
            ledger_timeout_ms,
            ledger_scan_limit,
            local_cache_path,
            blob_mode,
            blob_publisher_url,
            blob_aggregator_url,
            blob_timeout_ms,
            index_lease_epochs,
            epoch_duration_ms,
            renewal_window_ms,
            recency_window_ms,
            lease_standard_epochs,
            lease_max_epochs,
            policy_url,
            policy_timeout_ms,
            policy_cache_max_entries,
            policy_cache_ttl_ms,
            query_max_fanout,
            query_max_parallelism,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    parse_env_contents(&contents)
}

fn parse_env_contents(contents: &str) -> Result<HashMap<String, String>, StartupError> {
    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_nonempty(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn optional_nonempty(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| {
            invalid(format!("{} must be a valid host:port socket address", key))
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u32>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_ledger_mode(value: Option<&String>) -> Result<LedgerMode, StartupError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("memory");

    match mode {
        "memory" => Ok(LedgerMode::Memory),
        "postgres" => Ok(LedgerMode::Postgres),
        _ => Err(invalid("DOCVAULT_LEDGER_MODE must be memory or postgres")),
    }
}

fn parse_blob_mode(value: Option<&String>) -> Result<BlobMode, StartupError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("memory");

    match mode {
        "memory" => Ok(BlobMode::Memory),
        "http" => Ok(BlobMode::Http),
        _ => Err(invalid("DOCVAULT_BLOB_MODE must be memory or http")),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_usable_without_any_keys() {
        let cfg = NodeConfig::from_kv(&HashMap::new()).expect("defaults should be valid");
        assert_eq!(cfg.bind_addr.port(), 8090);
        assert_eq!(cfg.ledger_mode, LedgerMode::Memory);
        assert_eq!(cfg.blob_mode, BlobMode::Memory);
        assert_eq!(cfg.local_cache_path, "data/metadata-cache.json");
        assert_eq!(cfg.renewal_window_ms, 7 * DAY_MS);
        assert_eq!(cfg.lease_standard_epochs, 30);
        assert_eq!(cfg.lease_max_epochs, 90);
        assert_eq!(cfg.query_max_parallelism, 8);
        assert_eq!(cfg.policy_url, None);
    }

    #[test]
    fn non_local_bind_needs_dev_flag_and_unspecified_address() {
        let err = NodeConfig::from_kv(&env(&[("DOCVAULT_BIND_ADDR", "0.0.0.0:8090")])).unwrap_err();
        assert_eq!(err.code, "ERR_NONLOCAL_BIND");

        let err = NodeConfig::from_kv(&env(&[
            ("DOCVAULT_BIND_ADDR", "10.1.2.3:8090"),
            ("DOCVAULT_DEV_ALLOW_NONLOCAL_BIND", "1"),
        ]))
        .unwrap_err();
        assert_eq!(err.code, "ERR_NONLOCAL_BIND");

        NodeConfig::from_kv(&env(&[
            ("DOCVAULT_BIND_ADDR", "0.0.0.0:8090"),
            ("DOCVAULT_DEV_ALLOW_NONLOCAL_BIND", "true"),
        ]))
        .expect("dev escape hatch should allow unspecified bind");
    }

    #[test]
    fn postgres_and_http_modes_require_their_endpoints() {
        let err = NodeConfig::from_kv(&env(&[("DOCVAULT_LEDGER_MODE", "postgres")])).unwrap_err();
        assert_eq!(err.code, "ERR_MISSING_CONFIG");
        assert!(err.message.contains("DOCVAULT_DB_URL"));

        let err = NodeConfig::from_kv(&env(&[
            ("DOCVAULT_BLOB_MODE", "http"),
            ("DOCVAULT_BLOB_PUBLISHER_URL", "http://publisher"),
        ]))
        .unwrap_err();
        assert!(err.message.contains("DOCVAULT_BLOB_AGGREGATOR_URL"));

        let err = NodeConfig::from_kv(&env(&[("DOCVAULT_LEDGER_MODE", "sqlite")])).unwrap_err();
        assert_eq!(err.code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn lease_and_parallelism_bounds_are_enforced() {
        let err = NodeConfig::from_kv(&env(&[
            ("DOCVAULT_LEASE_STANDARD_EPOCHS", "100"),
            ("DOCVAULT_LEASE_MAX_EPOCHS", "90"),
        ]))
        .unwrap_err();
        assert!(err.message.contains("DOCVAULT_LEASE_STANDARD_EPOCHS"));

        for bad in ["0", "257", "many"] {
            let err =
                NodeConfig::from_kv(&env(&[("DOCVAULT_QUERY_MAX_PARALLELISM", bad)])).unwrap_err();
            assert_eq!(err.code, "ERR_INVALID_CONFIG");
        }
    }

    #[test]
    fn env_file_parsing_handles_comments_and_quotes() {
        let kv = parse_env_contents(
            "# docvault\nDOCVAULT_BLOB_MODE = \"memory\"\n\nDOCVAULT_POLICY_URL='http://policy:8181'\n",
        )
        .expect("file should parse");
        assert_eq!(kv.get("DOCVAULT_BLOB_MODE").map(String::as_str), Some("memory"));
        assert_eq!(
            kv.get("DOCVAULT_POLICY_URL").map(String::as_str),
            Some("http://policy:8181")
        );

        let err = parse_env_contents("NOT_A_PAIR").unwrap_err();
        assert_eq!(err.code, "ERR_CONFIG_FILE_PARSE");
    }
}
