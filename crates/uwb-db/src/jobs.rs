//! SQLite implementation of the `JobStore` port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use uwb_core::error::StoreError;
use uwb_core::job::{JobKind, JobRecord, JobStatus};
use uwb_core::ports::{JobFinish, JobStore};

/// Shared SELECT column list for job queries.
const JOB_SELECT_COLUMNS: &str = "id, job_kind, operation_name, target, source_commit, \
     source_firmware, target_firmware, version_major, version_minor, version_patch, \
     version_suffix, build_signature, force, no_rom_zip, status, queue_job_id, process_pid, \
     return_code, error, log_path, artifact_path, reused_from_job_id, extra_mods_archive_path, \
     extra_mods_modules_json, mods_disabled_json, debloat_disabled_json, \
     debloat_add_system_json, debloat_add_product_json, ff_overrides_json, created_at, \
     updated_at, started_at, finished_at";

/// SQLite implementation of the `JobStore` port.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn map_err(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn parse_datetime(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn row_to_job(row: &SqliteRow) -> Result<JobRecord, StoreError> {
    let get_str = |name: &str| -> Result<String, StoreError> {
        row.try_get::<String, _>(name).map_err(map_err)
    };
    let get_opt = |name: &str| -> Result<Option<String>, StoreError> {
        row.try_get::<Option<String>, _>(name).map_err(map_err)
    };
    let get_opt_i64 = |name: &str| -> Result<Option<i64>, StoreError> {
        row.try_get::<Option<i64>, _>(name).map_err(map_err)
    };

    let created_at = parse_datetime(get_opt("created_at")?).unwrap_or_else(Utc::now);
    let updated_at = parse_datetime(get_opt("updated_at")?).unwrap_or(created_at);

    Ok(JobRecord {
        id: get_str("id")?,
        kind: JobKind::parse(&get_opt("job_kind")?.unwrap_or_default()),
        operation_name: get_opt("operation_name")?,
        target: get_str("target")?,
        source_commit: get_opt("source_commit")?.unwrap_or_else(|| "unknown".to_string()),
        source_firmware: get_opt("source_firmware")?,
        target_firmware: get_opt("target_firmware")?,
        version_major: get_opt_i64("version_major")?,
        version_minor: get_opt_i64("version_minor")?,
        version_patch: get_opt_i64("version_patch")?,
        version_suffix: get_opt("version_suffix")?,
        build_signature: get_opt("build_signature")?,
        force: row.try_get::<i64, _>("force").map_err(map_err)? != 0,
        no_rom_zip: row.try_get::<i64, _>("no_rom_zip").map_err(map_err)? != 0,
        status: JobStatus::parse(&get_str("status")?),
        queue_job_id: get_opt("queue_job_id")?,
        process_pid: get_opt_i64("process_pid")?,
        return_code: get_opt_i64("return_code")?,
        error: get_opt("error")?,
        log_path: get_opt("log_path")?,
        artifact_path: get_opt("artifact_path")?,
        reused_from_job_id: get_opt("reused_from_job_id")?,
        extra_mods_archive_path: get_opt("extra_mods_archive_path")?,
        extra_mods_modules_json: get_opt("extra_mods_modules_json")?,
        mods_disabled_json: get_opt("mods_disabled_json")?,
        debloat_disabled_json: get_opt("debloat_disabled_json")?,
        debloat_add_system_json: get_opt("debloat_add_system_json")?,
        debloat_add_product_json: get_opt("debloat_add_product_json")?,
        ff_overrides_json: get_opt("ff_overrides_json")?,
        created_at,
        updated_at,
        started_at: parse_datetime(get_opt("started_at")?),
        finished_at: parse_datetime(get_opt("finished_at")?),
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn insert(&self, job: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO build_jobs (
                id, job_kind, operation_name, target, source_commit,
                source_firmware, target_firmware, version_major, version_minor,
                version_patch, version_suffix, build_signature, force, no_rom_zip,
                status, queue_job_id, process_pid, return_code, error, log_path,
                artifact_path, reused_from_job_id, extra_mods_archive_path,
                extra_mods_modules_json, mods_disabled_json, debloat_disabled_json,
                debloat_add_system_json, debloat_add_product_json, ff_overrides_json,
                created_at, updated_at, started_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(job.kind.as_str())
        .bind(&job.operation_name)
        .bind(&job.target)
        .bind(&job.source_commit)
        .bind(&job.source_firmware)
        .bind(&job.target_firmware)
        .bind(job.version_major)
        .bind(job.version_minor)
        .bind(job.version_patch)
        .bind(&job.version_suffix)
        .bind(&job.build_signature)
        .bind(i64::from(job.force))
        .bind(i64::from(job.no_rom_zip))
        .bind(job.status.as_str())
        .bind(&job.queue_job_id)
        .bind(job.process_pid)
        .bind(job.return_code)
        .bind(&job.error)
        .bind(&job.log_path)
        .bind(&job.artifact_path)
        .bind(&job.reused_from_job_id)
        .bind(&job.extra_mods_archive_path)
        .bind(&job.extra_mods_modules_json)
        .bind(&job.mods_disabled_json)
        .bind(&job.debloat_disabled_json)
        .bind(&job.debloat_add_system_json)
        .bind(&job.debloat_add_product_json)
        .bind(&job.ff_overrides_json)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_SELECT_COLUMNS} FROM build_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_SELECT_COLUMNS} FROM build_jobs ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        rows.iter().map(row_to_job).collect()
    }

    async fn set_queue_job_id(&self, id: &str, queue_job_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE build_jobs SET queue_job_id = ?, updated_at = ? WHERE id = ?")
            .bind(queue_job_id)
            .bind(now_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn mark_running(&self, id: &str, log_path: &str) -> Result<bool, StoreError> {
        let now = now_str();
        let result = sqlx::query(
            "UPDATE build_jobs SET status = 'running', started_at = ?, log_path = ?, updated_at = ? \
             WHERE id = ? AND status = 'queued'",
        )
        .bind(&now)
        .bind(log_path)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_process_pid(&self, id: &str, pid: Option<i64>) -> Result<(), StoreError> {
        sqlx::query("UPDATE build_jobs SET process_pid = ?, updated_at = ? WHERE id = ?")
            .bind(pid)
            .bind(now_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn set_error(&self, id: &str, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE build_jobs SET error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(now_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn mark_finished(&self, id: &str, finish: &JobFinish) -> Result<(), StoreError> {
        let now = now_str();
        // A terminal status is entered exactly once and never left; the
        // `canceled` set by the stopper wins over the supervisor's rc.
        sqlx::query(
            "UPDATE build_jobs SET status = ?, return_code = ?, error = COALESCE(?, error), \
             artifact_path = COALESCE(?, artifact_path), finished_at = ?, process_pid = NULL, \
             updated_at = ? \
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(finish.status.as_str())
        .bind(finish.return_code)
        .bind(&finish.error)
        .bind(&finish.artifact_path)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn find_reusable(
        &self,
        build_signature: &str,
    ) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_SELECT_COLUMNS} FROM build_jobs \
             WHERE build_signature = ? AND status IN ('succeeded', 'reused') \
               AND artifact_path IS NOT NULL \
             ORDER BY finished_at DESC, created_at DESC LIMIT 1"
        ))
        .bind(build_signature)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn latest_artifact_for_target(
        &self,
        target: &str,
    ) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_SELECT_COLUMNS} FROM build_jobs \
             WHERE target = ? AND status IN ('succeeded', 'reused') \
               AND artifact_path IS NOT NULL \
             ORDER BY finished_at DESC, created_at DESC LIMIT 1"
        ))
        .bind(target)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;

        row.as_ref().map(row_to_job).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::setup_test_database;
    use uwb_core::job::JobRecord;

    async fn store() -> SqliteJobStore {
        SqliteJobStore::new(setup_test_database().await.unwrap())
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = store().await;
        let mut job = JobRecord::new_build("b0s", "abc1234");
        job.build_signature = Some("deadbeef".repeat(5));
        job.debloat_disabled_json = Some("[]".to_string());
        store.insert(&job).await.unwrap();

        let loaded = store.get(&job.id).await.unwrap().expect("job exists");
        assert_eq!(loaded.target, "b0s");
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.kind, JobKind::Build);
        assert_eq!(loaded.build_signature, job.build_signature);
        assert!(loaded.started_at.is_none());
    }

    #[tokio::test]
    async fn missing_job_is_none() {
        let store = store().await;
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_transition_requires_queued() {
        let store = store().await;
        let job = JobRecord::new_build("b0s", "abc1234");
        store.insert(&job).await.unwrap();

        assert!(store.mark_running(&job.id, "/logs/x.log").await.unwrap());
        // Second attempt: no longer queued.
        assert!(!store.mark_running(&job.id, "/logs/x.log").await.unwrap());

        let loaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert!(loaded.started_at.is_some());
        assert_eq!(loaded.log_path.as_deref(), Some("/logs/x.log"));
    }

    #[tokio::test]
    async fn terminal_status_is_sticky() {
        let store = store().await;
        let job = JobRecord::new_build("b0s", "abc1234");
        store.insert(&job).await.unwrap();
        store.mark_running(&job.id, "/logs/x.log").await.unwrap();
        store.set_process_pid(&job.id, Some(4242)).await.unwrap();

        store
            .mark_finished(
                &job.id,
                &JobFinish {
                    status: JobStatus::Canceled,
                    return_code: None,
                    error: Some("Build canceled by user (SIGTERM)".into()),
                    artifact_path: None,
                },
            )
            .await
            .unwrap();

        // The supervisor returning later must not override the cancel.
        store
            .mark_finished(
                &job.id,
                &JobFinish {
                    status: JobStatus::Failed,
                    return_code: Some(137),
                    error: Some("Build failed with return code 137".into()),
                    artifact_path: None,
                },
            )
            .await
            .unwrap();

        let loaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Canceled);
        assert!(loaded.process_pid.is_none());
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn reusable_lookup_prefers_most_recent() {
        let store = store().await;
        let signature = "cafe".repeat(10);

        let mut first = JobRecord::new_build("b0s", "abc");
        first.build_signature = Some(signature.clone());
        store.insert(&first).await.unwrap();
        store.mark_running(&first.id, "/l/1.log").await.unwrap();
        store
            .mark_finished(
                &first.id,
                &JobFinish {
                    status: JobStatus::Succeeded,
                    return_code: Some(0),
                    error: None,
                    artifact_path: Some("/out/UN1CA_1.zip".into()),
                },
            )
            .await
            .unwrap();

        let mut second = JobRecord::new_build("b0s", "abc");
        second.build_signature = Some(signature.clone());
        store.insert(&second).await.unwrap();
        store.mark_running(&second.id, "/l/2.log").await.unwrap();
        store
            .mark_finished(
                &second.id,
                &JobFinish {
                    status: JobStatus::Succeeded,
                    return_code: Some(0),
                    error: None,
                    artifact_path: Some("/out/UN1CA_2.zip".into()),
                },
            )
            .await
            .unwrap();

        let found = store.find_reusable(&signature).await.unwrap().unwrap();
        assert_eq!(found.id, second.id);

        // Failed jobs never qualify.
        assert!(store.find_reusable("unknown-signature").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_recent_is_newest_first() {
        let store = store().await;
        for _ in 0..3 {
            store
                .insert(&JobRecord::new_build("b0s", "abc"))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let jobs = store.list_recent(2).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].created_at >= jobs[1].created_at);
    }
}
