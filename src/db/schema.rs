//! Database schema definitions

pub const CREATE_SITES: &str = r#"
CREATE TABLE IF NOT EXISTS sites (
    site_id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL DEFAULT 'a',
    received_data INTEGER NOT NULL DEFAULT 0,
    settings TEXT NOT NULL,          -- JSON: SiteSettings
    created_at TEXT NOT NULL
)
"#;

pub const CREATE_PATHS: &str = r#"
CREATE TABLE IF NOT EXISTS paths (
    path_id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id INTEGER NOT NULL,
    path TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    event INTEGER NOT NULL DEFAULT 0
)
"#;

// Paths are matched case-insensitively; this is also the conflict target for
// concurrent get-or-insert.
pub const CREATE_INDEX_PATHS: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_paths_site_path ON paths(site_id, lower(path))";

pub const CREATE_BROWSERS: &str = r#"
CREATE TABLE IF NOT EXISTS browsers (
    browser_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    UNIQUE(name, version)
)
"#;

pub const CREATE_SYSTEMS: &str = r#"
CREATE TABLE IF NOT EXISTS systems (
    system_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    UNIQUE(name, version)
)
"#;

pub const CREATE_USER_AGENTS: &str = r#"
CREATE TABLE IF NOT EXISTS user_agents (
    user_agent_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_agent TEXT NOT NULL UNIQUE,
    browser_id INTEGER NOT NULL,
    system_id INTEGER NOT NULL,
    bot INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_HITS: &str = r#"
CREATE TABLE IF NOT EXISTS hits (
    hit_id INTEGER PRIMARY KEY AUTOINCREMENT,
    site_id INTEGER NOT NULL,
    path_id INTEGER NOT NULL,
    user_agent_id INTEGER NOT NULL,
    session BLOB,                    -- 16 bytes, big endian
    bot INTEGER NOT NULL DEFAULT 0,
    ref TEXT NOT NULL DEFAULT '',
    ref_scheme TEXT,
    size TEXT NOT NULL DEFAULT '',   -- comma-separated floats
    location TEXT NOT NULL DEFAULT '',
    first_visit INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL         -- YYYY-MM-DD HH:MM:SS, UTC
)
"#;

pub const CREATE_INDEX_HITS_SITE_CREATED: &str =
    "CREATE INDEX IF NOT EXISTS idx_hits_site_created ON hits(site_id, created_at)";

pub const CREATE_INDEX_HITS_PATH: &str =
    "CREATE INDEX IF NOT EXISTS idx_hits_site_path ON hits(site_id, path_id)";

// === ROLLUP TABLES ===

pub const CREATE_HIT_COUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS hit_counts (
    site_id INTEGER NOT NULL,
    path_id INTEGER NOT NULL,
    hour TEXT NOT NULL,              -- YYYY-MM-DD HH:00:00, UTC
    total INTEGER NOT NULL DEFAULT 0,
    total_unique INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, hour, path_id)
)
"#;

pub const CREATE_REF_COUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS ref_counts (
    site_id INTEGER NOT NULL,
    path_id INTEGER NOT NULL,
    ref TEXT NOT NULL,
    ref_scheme TEXT NOT NULL DEFAULT '',
    hour TEXT NOT NULL,
    total INTEGER NOT NULL DEFAULT 0,
    total_unique INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, hour, path_id, ref, ref_scheme)
)
"#;

pub const CREATE_HIT_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS hit_stats (
    site_id INTEGER NOT NULL,
    path_id INTEGER NOT NULL,
    day TEXT NOT NULL,               -- YYYY-MM-DD, UTC
    stats BLOB NOT NULL,             -- JSON: 24 hourly totals
    stats_unique BLOB NOT NULL,      -- JSON: 24 hourly unique totals
    PRIMARY KEY (site_id, day, path_id)
)
"#;

pub const CREATE_BROWSER_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS browser_stats (
    site_id INTEGER NOT NULL,
    path_id INTEGER NOT NULL,
    browser_id INTEGER NOT NULL,
    day TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    count_unique INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, day, path_id, browser_id)
)
"#;

pub const CREATE_SYSTEM_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS system_stats (
    site_id INTEGER NOT NULL,
    path_id INTEGER NOT NULL,
    system_id INTEGER NOT NULL,
    day TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    count_unique INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, day, path_id, system_id)
)
"#;

pub const CREATE_LOCATION_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS location_stats (
    site_id INTEGER NOT NULL,
    path_id INTEGER NOT NULL,
    location TEXT NOT NULL,
    day TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    count_unique INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, day, path_id, location)
)
"#;

pub const CREATE_SIZE_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS size_stats (
    site_id INTEGER NOT NULL,
    path_id INTEGER NOT NULL,
    width INTEGER NOT NULL,
    day TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    count_unique INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, day, path_id, width)
)
"#;

/// All statements, in the order they must run.
pub const MIGRATIONS: &[&str] = &[
    CREATE_SITES,
    CREATE_PATHS,
    CREATE_INDEX_PATHS,
    CREATE_BROWSERS,
    CREATE_SYSTEMS,
    CREATE_USER_AGENTS,
    CREATE_HITS,
    CREATE_INDEX_HITS_SITE_CREATED,
    CREATE_INDEX_HITS_PATH,
    CREATE_HIT_COUNTS,
    CREATE_REF_COUNTS,
    CREATE_HIT_STATS,
    CREATE_BROWSER_STATS,
    CREATE_SYSTEM_STATS,
    CREATE_LOCATION_STATS,
    CREATE_SIZE_STATS,
];
