/// Database schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Connection settings for file-backed databases
pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
"#;

/// Version bookkeeping, created before any migration runs
pub const VERSION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Version 1: stores, versions, collector queue and aliases
pub const BASE_SCHEMA: &str = r#"
-- Store registry: local index <-> global store id
CREATE TABLE IF NOT EXISTS stores (
    sidx INTEGER PRIMARY KEY,
    sid BLOB NOT NULL UNIQUE,
    multiplicity INTEGER NOT NULL DEFAULT 0, -- 0 = single user, 1 = multi user
    expelled INTEGER NOT NULL DEFAULT 0
);

-- Per-device tick counters for devices that mutate locally
CREATE TABLE IF NOT EXISTS device_ticks (
    did BLOB PRIMARY KEY,
    tick INTEGER NOT NULL
);

-- Local version vectors, one row per (socid, device)
CREATE TABLE IF NOT EXISTS versions (
    sidx INTEGER NOT NULL,
    oid BLOB NOT NULL,
    cid INTEGER NOT NULL,
    did BLOB NOT NULL,
    tick INTEGER NOT NULL,
    PRIMARY KEY (sidx, oid, cid, did),
    FOREIGN KEY (sidx) REFERENCES stores(sidx)
);

-- Latest vector each peer announced for a socid
CREATE TABLE IF NOT EXISTS announcements (
    sidx INTEGER NOT NULL,
    oid BLOB NOT NULL,
    cid INTEGER NOT NULL,
    peer BLOB NOT NULL,
    did BLOB NOT NULL,
    tick INTEGER NOT NULL,
    PRIMARY KEY (sidx, oid, cid, peer, did),
    FOREIGN KEY (sidx) REFERENCES stores(sidx)
);

-- Per-store collector sequence counter
CREATE TABLE IF NOT EXISTS collector_counters (
    sidx INTEGER PRIMARY KEY,
    next_cs INTEGER NOT NULL,
    FOREIGN KEY (sidx) REFERENCES stores(sidx)
);

-- Pending collection work, at most one live entry per (sidx, oid, cid)
CREATE TABLE IF NOT EXISTS collector_queue (
    sidx INTEGER NOT NULL,
    cs INTEGER NOT NULL,
    oid BLOB NOT NULL,
    cid INTEGER NOT NULL,
    enqueued_at TEXT NOT NULL,
    PRIMARY KEY (sidx, cs),
    UNIQUE (sidx, oid, cid),
    FOREIGN KEY (sidx) REFERENCES stores(sidx)
);

-- Alias -> final target, chains always collapsed
CREATE TABLE IF NOT EXISTS aliases (
    sidx INTEGER NOT NULL,
    alias_oid BLOB NOT NULL,
    target_oid BLOB NOT NULL,
    PRIMARY KEY (sidx, alias_oid),
    FOREIGN KEY (sidx) REFERENCES stores(sidx)
);

CREATE INDEX IF NOT EXISTS idx_announcements_socid ON announcements(sidx, oid, cid);
CREATE INDEX IF NOT EXISTS idx_aliases_target ON aliases(sidx, target_oid);
CREATE INDEX IF NOT EXISTS idx_collector_queue_enqueued ON collector_queue(sidx, enqueued_at);
"#;

/// Version 2: parking for entries blocked by a structural defect
pub const PARKED_ENTRIES_SCHEMA: &str = r#"
-- Entries withdrawn from collection after a structural defect
CREATE TABLE IF NOT EXISTS parked_entries (
    sidx INTEGER NOT NULL,
    oid BLOB NOT NULL,
    cid INTEGER NOT NULL,
    reason TEXT NOT NULL,
    parked_at TEXT NOT NULL,
    PRIMARY KEY (sidx, oid, cid),
    FOREIGN KEY (sidx) REFERENCES stores(sidx)
);
"#;
