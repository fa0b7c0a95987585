use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    store::{ExecutionFilter, JobFilter, Store, TriggerFilter},
    types::{
        ExecutionRecord, Job, JobData, JobKey, Outcome, Trigger, TriggerKey, TriggerState,
    },
};

const JOB_COLUMNS: &str = "job_group, job_name, description, payload, data, durable,
     concurrency, max_concurrent, timeout_ms";

const TRIGGER_COLUMNS: &str = "trigger_group, trigger_name, job_group, job_name, description,
     schedule, state, next_fire_time, previous_fire_time, misfire_policy,
     misfire_threshold_ms, priority, data, end_time, times_triggered, durable";

const EXECUTION_COLUMNS: &str = "fire_id, job_group, job_name, trigger_group, trigger_name,
     scheduled_fire_time, fired_at, finished_at, outcome, data";

/// SQLite-backed [`Store`].
///
/// Wraps a single connection in a `Mutex`; every trait call locks it for the
/// duration of one statement or transaction and never across an await point.
/// Clones share the connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("sqlite connection lock poisoned".to_string()))
    }
}

// ── Encoding helpers ────────────────────────────────────────────────

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T> {
    s.parse().map_err(SchedulerError::Corrupt)
}

fn to_u64(column: &str, v: i64) -> Result<u64> {
    u64::try_from(v).map_err(|_| SchedulerError::Corrupt(format!("negative {column}: {v}")))
}

// ── Raw rows ────────────────────────────────────────────────────────

struct JobRow {
    group: String,
    name: String,
    description: Option<String>,
    payload: String,
    data: String,
    durable: bool,
    concurrency: String,
    max_concurrent: Option<i64>,
    timeout_ms: Option<i64>,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        group: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        payload: row.get(3)?,
        data: row.get(4)?,
        durable: row.get(5)?,
        concurrency: row.get(6)?,
        max_concurrent: row.get(7)?,
        timeout_ms: row.get(8)?,
    })
}

impl TryFrom<JobRow> for Job {
    type Error = SchedulerError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            key: JobKey::new(row.name, row.group),
            description: row.description,
            payload: row.payload,
            data: serde_json::from_str(&row.data)?,
            durable: row.durable,
            concurrency: parse_enum(&row.concurrency)?,
            max_concurrent: row
                .max_concurrent
                .map(|m| {
                    u32::try_from(m)
                        .map_err(|_| SchedulerError::Corrupt(format!("bad max_concurrent: {m}")))
                })
                .transpose()?,
            timeout_ms: row.timeout_ms.map(|t| to_u64("timeout_ms", t)).transpose()?,
        })
    }
}

struct TriggerRow {
    group: String,
    name: String,
    job_group: String,
    job_name: String,
    description: Option<String>,
    schedule: String,
    state: String,
    next_fire_time: Option<String>,
    previous_fire_time: Option<String>,
    misfire_policy: String,
    misfire_threshold_ms: Option<i64>,
    priority: i32,
    data: String,
    end_time: Option<String>,
    times_triggered: i64,
    durable: bool,
}

fn read_trigger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TriggerRow> {
    Ok(TriggerRow {
        group: row.get(0)?,
        name: row.get(1)?,
        job_group: row.get(2)?,
        job_name: row.get(3)?,
        description: row.get(4)?,
        schedule: row.get(5)?,
        state: row.get(6)?,
        next_fire_time: row.get(7)?,
        previous_fire_time: row.get(8)?,
        misfire_policy: row.get(9)?,
        misfire_threshold_ms: row.get(10)?,
        priority: row.get(11)?,
        data: row.get(12)?,
        end_time: row.get(13)?,
        times_triggered: row.get(14)?,
        durable: row.get(15)?,
    })
}

impl TryFrom<TriggerRow> for Trigger {
    type Error = SchedulerError;

    fn try_from(row: TriggerRow) -> Result<Self> {
        Ok(Trigger {
            key: TriggerKey::new(row.name, row.group),
            job_key: JobKey::new(row.job_name, row.job_group),
            description: row.description,
            schedule: serde_json::from_str(&row.schedule)?,
            state: parse_enum(&row.state)?,
            next_fire_time: parse_opt_ts(row.next_fire_time)?,
            previous_fire_time: parse_opt_ts(row.previous_fire_time)?,
            misfire_policy: parse_enum(&row.misfire_policy)?,
            misfire_threshold_ms: row
                .misfire_threshold_ms
                .map(|t| to_u64("misfire_threshold_ms", t))
                .transpose()?,
            priority: row.priority,
            data: serde_json::from_str(&row.data)?,
            end_time: parse_opt_ts(row.end_time)?,
            times_triggered: to_u64("times_triggered", row.times_triggered)?,
            durable: row.durable,
        })
    }
}

struct ExecutionRow {
    fire_id: String,
    job_group: String,
    job_name: String,
    trigger_group: String,
    trigger_name: String,
    scheduled_fire_time: String,
    fired_at: String,
    finished_at: Option<String>,
    outcome: Option<String>,
    data: String,
}

fn read_execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok(ExecutionRow {
        fire_id: row.get(0)?,
        job_group: row.get(1)?,
        job_name: row.get(2)?,
        trigger_group: row.get(3)?,
        trigger_name: row.get(4)?,
        scheduled_fire_time: row.get(5)?,
        fired_at: row.get(6)?,
        finished_at: row.get(7)?,
        outcome: row.get(8)?,
        data: row.get(9)?,
    })
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = SchedulerError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let fire_id = Uuid::parse_str(&row.fire_id)
            .map_err(|e| SchedulerError::Corrupt(format!("bad fire id '{}': {e}", row.fire_id)))?;
        let outcome: Option<Outcome> = row
            .outcome
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(ExecutionRecord {
            fire_id,
            job_key: JobKey::new(row.job_name, row.job_group),
            trigger_key: TriggerKey::new(row.trigger_name, row.trigger_group),
            scheduled_fire_time: parse_ts(&row.scheduled_fire_time)?,
            fired_at: parse_ts(&row.fired_at)?,
            finished_at: parse_opt_ts(row.finished_at)?,
            outcome,
            data: serde_json::from_str::<JobData>(&row.data)?,
        })
    }
}

fn collect<R, T>(rows: impl Iterator<Item = rusqlite::Result<R>>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = SchedulerError>,
{
    rows.map(|r| T::try_from(r?)).collect()
}

fn job_exists(conn: &Connection, key: &JobKey) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM jobs WHERE job_group = ?1 AND job_name = ?2",
            params![key.group, key.name],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn trigger_exists(conn: &Connection, key: &TriggerKey) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM triggers WHERE trigger_group = ?1 AND trigger_name = ?2",
            params![key.group, key.name],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn write_job(conn: &Connection, sql: &str, job: &Job) -> Result<usize> {
    let n = conn.execute(
        sql,
        params![
            job.key.group,
            job.key.name,
            job.description,
            job.payload,
            serde_json::to_string(&job.data)?,
            job.durable,
            job.concurrency.to_string(),
            job.max_concurrent.map(i64::from),
            job.timeout_ms.map(|t| t as i64),
        ],
    )?;
    Ok(n)
}

/// Bind every trigger column as ?1..?16 in `TRIGGER_COLUMNS` order.
fn trigger_params(trigger: &Trigger) -> Result<Vec<Box<dyn rusqlite::ToSql>>> {
    Ok(vec![
        Box::new(trigger.key.group.clone()),
        Box::new(trigger.key.name.clone()),
        Box::new(trigger.job_key.group.clone()),
        Box::new(trigger.job_key.name.clone()),
        Box::new(trigger.description.clone()),
        Box::new(serde_json::to_string(&trigger.schedule)?),
        Box::new(trigger.state.to_string()),
        Box::new(opt_ts(trigger.next_fire_time)),
        Box::new(opt_ts(trigger.previous_fire_time)),
        Box::new(trigger.misfire_policy.to_string()),
        Box::new(trigger.misfire_threshold_ms.map(|t| t as i64)),
        Box::new(trigger.priority),
        Box::new(serde_json::to_string(&trigger.data)?),
        Box::new(opt_ts(trigger.end_time)),
        Box::new(trigger.times_triggered as i64),
        Box::new(trigger.durable),
    ])
}

const TRIGGER_SET: &str = "job_group = ?3, job_name = ?4, description = ?5, schedule = ?6,
     state = ?7, next_fire_time = ?8, previous_fire_time = ?9, misfire_policy = ?10,
     misfire_threshold_ms = ?11, priority = ?12, data = ?13, end_time = ?14,
     times_triggered = ?15, durable = ?16";

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, job), fields(job = %job.key))]
    async fn create_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if job_exists(&tx, &job.key)? {
            return Err(SchedulerError::JobExists {
                key: job.key.to_string(),
            });
        }
        write_job(
            &tx,
            &format!("INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
            job,
        )?;
        tx.commit()?;
        debug!("job row inserted");
        Ok(())
    }

    async fn get_job(&self, key: &JobKey) -> Result<Option<Job>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_group = ?1 AND job_name = ?2"),
                params![key.group, key.name],
                read_job_row,
            )
            .optional()?;
        row.map(Job::try_from).transpose()
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let conn = self.lock()?;
        let n = write_job(
            &conn,
            "UPDATE jobs SET description = ?3, payload = ?4, data = ?5, durable = ?6,
                 concurrency = ?7, max_concurrent = ?8, timeout_ms = ?9
             WHERE job_group = ?1 AND job_name = ?2",
            job,
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound {
                key: job.key.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job = %key))]
    async fn delete_job(&self, key: &JobKey) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        // The foreign key cascades too; deleting explicitly keeps this correct
        // on connections opened without `foreign_keys = ON`.
        let triggers = tx.execute(
            "DELETE FROM triggers WHERE job_group = ?1 AND job_name = ?2",
            params![key.group, key.name],
        )?;
        let jobs = tx.execute(
            "DELETE FROM jobs WHERE job_group = ?1 AND job_name = ?2",
            params![key.group, key.name],
        )?;
        tx.commit()?;
        debug!(triggers, "job row deleted");
        Ok(jobs > 0)
    }

    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(group) = &filter.group {
            args.push(group.clone());
            clauses.push(format!("job_group = ?{}", args.len()));
        }
        if let Some(payload) = &filter.payload {
            args.push(payload.clone());
            clauses.push(format!("payload = ?{}", args.len()));
        }
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs{} ORDER BY job_group, job_name",
            where_clause(&clauses)
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), read_job_row)?;
        collect(rows)
    }

    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    async fn create_trigger(&self, trigger: &Trigger) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !job_exists(&tx, &trigger.job_key)? {
            return Err(SchedulerError::JobNotFound {
                key: trigger.job_key.to_string(),
            });
        }
        if trigger_exists(&tx, &trigger.key)? {
            return Err(SchedulerError::TriggerExists {
                key: trigger.key.to_string(),
            });
        }
        let args = trigger_params(trigger)?;
        tx.execute(
            &format!(
                "INSERT INTO triggers ({TRIGGER_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)"
            ),
            params_from_iter(args.iter()),
        )?;
        tx.commit()?;
        debug!("trigger row inserted");
        Ok(())
    }

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {TRIGGER_COLUMNS} FROM triggers
                     WHERE trigger_group = ?1 AND trigger_name = ?2"
                ),
                params![key.group, key.name],
                read_trigger_row,
            )
            .optional()?;
        row.map(Trigger::try_from).transpose()
    }

    async fn update_trigger(&self, trigger: &Trigger) -> Result<()> {
        let conn = self.lock()?;
        let args = trigger_params(trigger)?;
        let n = conn.execute(
            &format!(
                "UPDATE triggers SET {TRIGGER_SET}
                 WHERE trigger_group = ?1 AND trigger_name = ?2"
            ),
            params_from_iter(args.iter()),
        )?;
        if n == 0 {
            return Err(SchedulerError::TriggerNotFound {
                key: trigger.key.to_string(),
            });
        }
        Ok(())
    }

    async fn update_trigger_if(&self, trigger: &Trigger, expected: TriggerState) -> Result<bool> {
        let conn = self.lock()?;
        let mut args = trigger_params(trigger)?;
        args.push(Box::new(expected.to_string()));
        let n = conn.execute(
            &format!(
                "UPDATE triggers SET {TRIGGER_SET}
                 WHERE trigger_group = ?1 AND trigger_name = ?2 AND state = ?17"
            ),
            params_from_iter(args.iter()),
        )?;
        Ok(n == 1)
    }

    async fn delete_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM triggers WHERE trigger_group = ?1 AND trigger_name = ?2",
            params![key.group, key.name],
        )?;
        Ok(n > 0)
    }

    async fn query_triggers(&self, filter: &TriggerFilter) -> Result<Vec<Trigger>> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(job) = &filter.job {
            args.push(job.group.clone());
            args.push(job.name.clone());
            clauses.push(format!(
                "job_group = ?{} AND job_name = ?{}",
                args.len() - 1,
                args.len()
            ));
        }
        if let Some(group) = &filter.group {
            args.push(group.clone());
            clauses.push(format!("trigger_group = ?{}", args.len()));
        }
        if !filter.states.is_empty() {
            let mut slots = Vec::new();
            for state in &filter.states {
                args.push(state.to_string());
                slots.push(format!("?{}", args.len()));
            }
            clauses.push(format!("state IN ({})", slots.join(", ")));
        }
        let sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers{} ORDER BY trigger_group, trigger_name",
            where_clause(&clauses)
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), read_trigger_row)?;
        collect(rows)
    }

    #[instrument(skip(self), fields(now = %now))]
    async fn acquire_due_triggers(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Trigger>> {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front, so a second process
        // sharing the file cannot select the same rows in between.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let due: Vec<Trigger> = {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {TRIGGER_COLUMNS} FROM triggers
                 WHERE state = 'waiting' AND next_fire_time IS NOT NULL AND next_fire_time <= ?1
                 ORDER BY next_fire_time ASC, priority DESC, trigger_group, trigger_name
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![ts(now), limit as i64], read_trigger_row)?;
            collect(rows)?
        };

        let mut acquired = Vec::with_capacity(due.len());
        for mut trigger in due {
            let n = tx.execute(
                "UPDATE triggers SET state = 'acquired'
                 WHERE trigger_group = ?1 AND trigger_name = ?2 AND state = 'waiting'",
                params![trigger.key.group, trigger.key.name],
            )?;
            if n == 1 {
                trigger.state = TriggerState::Acquired;
                acquired.push(trigger);
            }
        }
        tx.commit()?;
        if !acquired.is_empty() {
            debug!(count = acquired.len(), "triggers acquired");
        }
        Ok(acquired)
    }

    async fn transition_trigger(
        &self,
        key: &TriggerKey,
        from: TriggerState,
        to: TriggerState,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE triggers SET state = ?3
             WHERE trigger_group = ?1 AND trigger_name = ?2 AND state = ?4",
            params![key.group, key.name, to.to_string(), from.to_string()],
        )?;
        Ok(n == 1)
    }

    async fn earliest_fire_time(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let earliest: Option<String> = conn.query_row(
            "SELECT MIN(next_fire_time) FROM triggers WHERE state = 'waiting'",
            [],
            |row| row.get(0),
        )?;
        parse_opt_ts(earliest)
    }

    async fn insert_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO executions ({EXECUTION_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)"
            ),
            params![
                record.fire_id.to_string(),
                record.job_key.group,
                record.job_key.name,
                record.trigger_key.group,
                record.trigger_key.name,
                ts(record.scheduled_fire_time),
                ts(record.fired_at),
                opt_ts(record.finished_at),
                record
                    .outcome
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&record.data)?,
            ],
        )?;
        Ok(())
    }

    async fn complete_execution(
        &self,
        fire_id: Uuid,
        finished_at: DateTime<Utc>,
        outcome: &Outcome,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE executions SET finished_at = ?2, outcome = ?3 WHERE fire_id = ?1",
            params![
                fire_id.to_string(),
                ts(finished_at),
                serde_json::to_string(outcome)?
            ],
        )?;
        Ok(())
    }

    async fn query_executions(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(job) = &filter.job {
            args.push(job.group.clone());
            args.push(job.name.clone());
            clauses.push(format!(
                "job_group = ?{} AND job_name = ?{}",
                args.len() - 1,
                args.len()
            ));
        }
        if let Some(trigger) = &filter.trigger {
            args.push(trigger.group.clone());
            args.push(trigger.name.clone());
            clauses.push(format!(
                "trigger_group = ?{} AND trigger_name = ?{}",
                args.len() - 1,
                args.len()
            ));
        }
        match filter.running {
            Some(true) => clauses.push("finished_at IS NULL".to_string()),
            Some(false) => clauses.push("finished_at IS NOT NULL".to_string()),
            None => {}
        }
        let limit = filter
            .limit
            .map(|n| format!(" LIMIT {n}"))
            .unwrap_or_default();
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions{} ORDER BY rowid DESC{limit}",
            where_clause(&clauses)
        );

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), read_execution_row)?;
        collect(rows)
    }

    async fn prune_executions(&self, job: &JobKey, keep: usize) -> Result<usize> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM executions
             WHERE job_group = ?1 AND job_name = ?2 AND finished_at IS NOT NULL
               AND rowid NOT IN (
                   SELECT rowid FROM executions
                   WHERE job_group = ?1 AND job_name = ?2
                   ORDER BY rowid DESC LIMIT ?3
               )",
            params![job.group, job.name, keep],
        )?;
        Ok(deleted)
    }
}

fn where_clause(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}
