//! Database schema for dispatch.db.
//!
//! Version 0 holds the jobs table and their audit events. Version 1 adds the
//! failure counters and the per-worker ban list. Version 2 makes a ban unique
//! per (worker, job).

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};
use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

const JOB_FOREIGN_KEY: ForeignKey = ForeignKey {
    foreign_table: "training_jobs",
    foreign_column: "id",
    on_delete: ForeignKeyOnChange::Cascade,
};

const TRAINING_JOBS_TABLE_V0: Table = Table {
    name: "training_jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("canceled_at", &SqlType::Integer),
        sqlite_column!("failed_at", &SqlType::Integer),
        sqlite_column!("last_heartbeat", &SqlType::Integer),
        sqlite_column!("data_bucket", &SqlType::Text, non_null = true),
        sqlite_column!("checkpoint_bucket", &SqlType::Text, non_null = true),
        sqlite_column!("checkpoint_prefix", &SqlType::Text, non_null = true),
        sqlite_column!("instance_data_prefix", &SqlType::Text, non_null = true),
        sqlite_column!("class_data_prefix", &SqlType::Text),
        sqlite_column!("model_bucket", &SqlType::Text),
        sqlite_column!("model_key", &SqlType::Text),
        sqlite_column!("params", &SqlType::Text, non_null = true, default_value = Some("'{}'")),
    ],
    indices: &[
        ("idx_jobs_status_created", "status, created_at"),
        ("idx_jobs_status_heartbeat", "status, last_heartbeat"),
    ],
    unique_constraints: &[],
};

const JOB_EVENTS_TABLE_V0: Table = Table {
    name: "job_events",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "job_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&JOB_FOREIGN_KEY)
        ),
        sqlite_column!("event_type", &SqlType::Text, non_null = true),
        sqlite_column!("event_data", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_events_job", "job_id, id")],
    unique_constraints: &[],
};

const JOB_FAILURES_TABLE_V1: Table = Table {
    name: "job_failures",
    columns: &[
        sqlite_column!(
            "job_id",
            &SqlType::Text,
            is_primary_key = true,
            foreign_key = Some(&JOB_FOREIGN_KEY)
        ),
        sqlite_column!("attempts", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

const WORKER_BANS_TABLE_V1: Table = Table {
    name: "worker_bans",
    columns: &[
        sqlite_column!("worker_id", &SqlType::Text, non_null = true),
        sqlite_column!(
            "job_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&JOB_FOREIGN_KEY)
        ),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_bans_worker_job", "worker_id, job_id"),
        ("idx_bans_expires", "expires_at"),
    ],
    unique_constraints: &[],
};

const WORKER_BANS_TABLE_V2: Table = Table {
    name: "worker_bans",
    columns: WORKER_BANS_TABLE_V1.columns,
    indices: &[("idx_bans_expires", "expires_at")],
    unique_constraints: &[&["worker_id", "job_id"]],
};

fn add_failure_tracking(conn: &Connection) -> Result<()> {
    JOB_FAILURES_TABLE_V1.create(conn)?;
    WORKER_BANS_TABLE_V1.create(conn)?;
    Ok(())
}

/// Collapses duplicate bans onto their latest expiry, then makes
/// (worker_id, job_id) unique.
fn unique_worker_bans(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE worker_bans SET expires_at = (\
             SELECT MAX(b.expires_at) FROM worker_bans b \
             WHERE b.worker_id = worker_bans.worker_id AND b.job_id = worker_bans.job_id)",
        [],
    )?;
    let removed = conn.execute(
        "DELETE FROM worker_bans WHERE rowid NOT IN (\
             SELECT MIN(rowid) FROM worker_bans GROUP BY worker_id, job_id)",
        [],
    )?;
    if removed > 0 {
        info!("Removed {} duplicate worker bans", removed);
    }
    conn.execute("DROP INDEX IF EXISTS idx_bans_worker_job", [])?;
    conn.execute(
        "CREATE UNIQUE INDEX idx_bans_worker_job_unique ON worker_bans(worker_id, job_id)",
        [],
    )?;
    Ok(())
}

pub const DISPATCH_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[TRAINING_JOBS_TABLE_V0, JOB_EVENTS_TABLE_V0],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[
            TRAINING_JOBS_TABLE_V0,
            JOB_EVENTS_TABLE_V0,
            JOB_FAILURES_TABLE_V1,
            WORKER_BANS_TABLE_V1,
        ],
        migration: Some(add_failure_tracking),
    },
    VersionedSchema {
        version: 2,
        tables: &[
            TRAINING_JOBS_TABLE_V0,
            JOB_EVENTS_TABLE_V0,
            JOB_FAILURES_TABLE_V1,
            WORKER_BANS_TABLE_V2,
        ],
        migration: Some(unique_worker_bans),
    },
];
