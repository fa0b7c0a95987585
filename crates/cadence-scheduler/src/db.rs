use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Safe to call on every startup. Timestamps are fixed-width RFC 3339 UTC
/// strings (nanosecond precision, `Z` suffix) so text comparison orders them
/// correctly. Structured columns (`schedule`, `data`, `outcome`) hold JSON.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS jobs (
            job_group       TEXT    NOT NULL,
            job_name        TEXT    NOT NULL,
            description     TEXT,
            payload         TEXT    NOT NULL,
            data            TEXT    NOT NULL DEFAULT '{}',
            durable         INTEGER NOT NULL DEFAULT 1,
            concurrency     TEXT    NOT NULL,
            max_concurrent  INTEGER,            -- NULL means unbounded
            timeout_ms      INTEGER,
            PRIMARY KEY (job_group, job_name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS triggers (
            trigger_group        TEXT    NOT NULL,
            trigger_name         TEXT    NOT NULL,
            job_group            TEXT    NOT NULL,
            job_name             TEXT    NOT NULL,
            description          TEXT,
            schedule             TEXT    NOT NULL,   -- JSON-encoded Schedule enum
            state                TEXT    NOT NULL,
            next_fire_time       TEXT,
            previous_fire_time   TEXT,
            misfire_policy       TEXT    NOT NULL,
            misfire_threshold_ms INTEGER,
            priority             INTEGER NOT NULL,
            data                 TEXT    NOT NULL DEFAULT '{}',
            end_time             TEXT,
            times_triggered      INTEGER NOT NULL DEFAULT 0,
            durable              INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (trigger_group, trigger_name),
            FOREIGN KEY (job_group, job_name)
                REFERENCES jobs (job_group, job_name) ON DELETE CASCADE
        ) STRICT;

        -- Acquisition: WHERE state = 'waiting' AND next_fire_time <= ?
        CREATE INDEX IF NOT EXISTS idx_triggers_due
            ON triggers (state, next_fire_time);
        CREATE INDEX IF NOT EXISTS idx_triggers_job
            ON triggers (job_group, job_name);

        -- History outlives the job it describes, so no foreign key here.
        CREATE TABLE IF NOT EXISTS executions (
            fire_id             TEXT NOT NULL PRIMARY KEY,
            job_group           TEXT NOT NULL,
            job_name            TEXT NOT NULL,
            trigger_group       TEXT NOT NULL,
            trigger_name        TEXT NOT NULL,
            scheduled_fire_time TEXT NOT NULL,
            fired_at            TEXT NOT NULL,
            finished_at         TEXT,              -- NULL while running
            outcome             TEXT,              -- JSON-encoded Outcome
            data                TEXT NOT NULL DEFAULT '{}'
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_job
            ON executions (job_group, job_name);
        ",
    )?;
    Ok(())
}
