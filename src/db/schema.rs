//! Database schema definitions

pub const CREATE_USER_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS user_stats (
    username       TEXT PRIMARY KEY,
    total_upload   INTEGER DEFAULT 0,
    total_download INTEGER DEFAULT 0,
    conn_count     INTEGER DEFAULT 0,
    request_count  INTEGER DEFAULT 0,
    first_seen     DATETIME,
    last_access    DATETIME,
    disabled       INTEGER DEFAULT 0
)
"#;

pub const CREATE_DOMAIN_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS domain_stats (
    user       TEXT NOT NULL,
    domain     TEXT NOT NULL,
    upload     INTEGER DEFAULT 0,
    download   INTEGER DEFAULT 0,
    conn_count INTEGER DEFAULT 0,
    last_seen  DATETIME,
    PRIMARY KEY (user, domain)
)
"#;

// Time-bucketed tables keyed by canonical truncated timestamp strings
// ("YYYY-MM-DDTHH:MM:00" / "YYYY-MM-DDTHH:00:00")

pub const CREATE_MINUTE_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS minute_stats (
    user       TEXT NOT NULL,
    minute     TEXT NOT NULL,
    upload     INTEGER DEFAULT 0,
    download   INTEGER DEFAULT 0,
    conn_count INTEGER DEFAULT 0,
    PRIMARY KEY (user, minute)
)
"#;

pub const CREATE_HOURLY_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS hourly_stats (
    user       TEXT NOT NULL,
    hour       TEXT NOT NULL,
    upload     INTEGER DEFAULT 0,
    download   INTEGER DEFAULT 0,
    conn_count INTEGER DEFAULT 0,
    PRIMARY KEY (user, hour)
)
"#;

pub const CREATE_COUNTRY_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS country_stats (
    user         TEXT NOT NULL,
    country      TEXT NOT NULL,
    country_name TEXT,
    continent    TEXT,
    upload       INTEGER DEFAULT 0,
    download     INTEGER DEFAULT 0,
    conn_count   INTEGER DEFAULT 0,
    last_seen    DATETIME,
    PRIMARY KEY (user, country)
)
"#;

pub const CREATE_RETENTION_CONFIG: &str = r#"
CREATE TABLE IF NOT EXISTS retention_config (
    key   TEXT PRIMARY KEY,
    value TEXT
)
"#;

// For top-domain ranking by total traffic
pub const CREATE_INDEX_DOMAIN_TRAFFIC: &str =
    "CREATE INDEX IF NOT EXISTS idx_domain_total_traffic ON domain_stats(upload + download)";
