//! Schema migrations, applied in order and recorded in `schema_migrations`.

use ::duckdb::{Connection, ToSql};

const MIGRATIONS: [(i64, &str); 2] = [
    (
        1,
        "CREATE SEQUENCE IF NOT EXISTS work_item_ids START 1;
         CREATE TABLE IF NOT EXISTS work_items (
             id BIGINT NOT NULL DEFAULT nextval('work_item_ids'),
             external_key VARCHAR NOT NULL,
             status VARCHAR NOT NULL,
             error_message VARCHAR,
             last_error_rate_limited BOOLEAN NOT NULL DEFAULT FALSE,
             attempts BIGINT NOT NULL DEFAULT 0,
             retry_after BIGINT,
             created_at BIGINT NOT NULL,
             updated_at BIGINT NOT NULL
         );",
    ),
    (
        2,
        "CREATE TABLE IF NOT EXISTS result_records (
             external_key VARCHAR PRIMARY KEY,
             provider VARCHAR NOT NULL,
             raw_payload VARCHAR NOT NULL,
             extracted VARCHAR NOT NULL,
             company_name VARCHAR,
             created_at BIGINT NOT NULL,
             updated_at BIGINT NOT NULL
         );",
    ),
];

/// Apply every migration not yet recorded. Returns how many ran.
pub fn apply_migrations(connection: &Connection) -> Result<usize, ::duckdb::Error> {
    connection.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             version BIGINT NOT NULL,
             applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
         );",
    )?;

    let current: i64 = connection.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    let mut applied = 0;
    for (version, sql) in MIGRATIONS {
        if version <= current {
            continue;
        }
        connection.execute_batch(sql)?;
        let params: [&dyn ToSql; 1] = [&version];
        connection.execute(
            "INSERT INTO schema_migrations (version) VALUES (?)",
            params.as_slice(),
        )?;
        applied += 1;
    }

    Ok(applied)
}
