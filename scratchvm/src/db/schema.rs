pub(crate) const SCHEMA_VERSION: i32 = 1;

const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

const INSTANCES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS instances (
    name TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    pid INTEGER,
    record TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);
";

pub(crate) fn all_schemas() -> [&'static str; 2] {
    [SCHEMA_VERSION_TABLE, INSTANCES_TABLE]
}
