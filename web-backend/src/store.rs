// SQLite 持久化实现

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{FromRow, Pool, Sqlite};
use uuid::Uuid;

use vulnscan_core::finding::{Finding, Location, Severity};
use vulnscan_core::{
    JobId, Repository, RepositoryId, ScanJob, ScanStore, SeveritySummary, StoreError,
    SummaryRecord,
};

#[derive(Clone)]
pub struct SqliteStore {
    db: Pool<Sqlite>,
}

#[derive(FromRow)]
struct RepositoryRow {
    id: String,
    name: String,
    source: String,
    created_at: String,
    last_scanned_at: Option<String>,
}

#[derive(FromRow)]
struct FindingRow {
    id: String,
    scan_job_id: String,
    repository_id: String,
    unit_id: String,
    severity: String,
    category: String,
    file_path: String,
    line: Option<i64>,
    description: String,
    raw_severity: String,
    needs_review: bool,
    cwe: Option<String>,
    owasp: Option<String>,
    recommendation: Option<String>,
    original_code: Option<String>,
    fix_code: Option<String>,
    compliance_impact: Option<String>,
    fingerprint: String,
    detected_at: String,
}

#[derive(FromRow)]
struct SummaryRow {
    repository_id: String,
    job_id: String,
    critical: i64,
    high: i64,
    medium: i64,
    low: i64,
    computed_at: String,
    scanned_at: String,
}

impl SqliteStore {
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

// 固定宽度的 RFC3339，保证按字符串比较即按时间比较
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {:?}: {}", value, e)))
}

fn parse_id(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Backend(format!("bad id {:?}: {}", value, e)))
}

fn count(value: i64) -> u64 {
    value.max(0) as u64
}

impl TryFrom<RepositoryRow> for Repository {
    type Error = StoreError;

    fn try_from(row: RepositoryRow) -> Result<Self, Self::Error> {
        Ok(Repository {
            id: row.id,
            name: row.name,
            source: row.source,
            created_at: parse_ts(&row.created_at)?,
            last_scanned_at: row.last_scanned_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

impl TryFrom<FindingRow> for Finding {
    type Error = StoreError;

    fn try_from(row: FindingRow) -> Result<Self, Self::Error> {
        let severity = Severity::from_canonical(&row.severity)
            .ok_or_else(|| StoreError::Backend(format!("unknown severity {:?}", row.severity)))?;
        Ok(Finding {
            id: parse_id(&row.id)?,
            scan_job_id: parse_id(&row.scan_job_id)?,
            repository_id: row.repository_id,
            unit_id: row.unit_id,
            severity,
            category: row.category,
            location: Location {
                file: row.file_path,
                line: row.line.and_then(|l| u32::try_from(l).ok()),
            },
            description: row.description,
            detected_at: parse_ts(&row.detected_at)?,
            raw_severity: row.raw_severity,
            needs_review: row.needs_review,
            cwe: row.cwe,
            owasp: row.owasp,
            recommendation: row.recommendation,
            original_code: row.original_code,
            fix_code: row.fix_code,
            compliance_impact: row.compliance_impact,
            fingerprint: row.fingerprint,
        })
    }
}

impl SummaryRow {
    fn into_record(self) -> Result<(RepositoryId, SummaryRecord), StoreError> {
        let record = SummaryRecord {
            job_id: parse_id(&self.job_id)?,
            summary: SeveritySummary::from_counts(
                count(self.critical),
                count(self.high),
                count(self.medium),
                count(self.low),
            ),
            computed_at: parse_ts(&self.computed_at)?,
            scanned_at: parse_ts(&self.scanned_at)?,
        };
        Ok((self.repository_id, record))
    }
}

const SUMMARY_COLUMNS: &str =
    "repository_id, job_id, critical, high, medium, low, computed_at, scanned_at";

#[async_trait]
impl ScanStore for SqliteStore {
    async fn get_repository(&self, id: &str) -> Result<Option<Repository>, StoreError> {
        sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, name, source, created_at, last_scanned_at FROM repositories WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .map_err(backend)?
        .map(Repository::try_from)
        .transpose()
    }

    async fn upsert_repository(&self, repository: &Repository) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO repositories (id, name, source, created_at, last_scanned_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, source = excluded.source",
        )
        .bind(&repository.id)
        .bind(&repository.name)
        .bind(&repository.source)
        .bind(ts(&repository.created_at))
        .bind(repository.last_scanned_at.as_ref().map(ts))
        .execute(&self.db)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, name, source, created_at, last_scanned_at FROM repositories ORDER BY id",
        )
        .fetch_all(&self.db)
        .await
        .map_err(backend)?
        .into_iter()
        .map(Repository::try_from)
        .collect()
    }

    async fn touch_repository(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE repositories SET last_scanned_at = ? WHERE id = ?")
            .bind(ts(&at))
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn save_job(&self, job: &ScanJob) -> Result<(), StoreError> {
        let snapshot = serde_json::to_string(job)?;
        sqlx::query(
            "INSERT INTO scan_jobs (id, repository_id, state, created_at, completed_at, snapshot)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                completed_at = excluded.completed_at,
                snapshot = excluded.snapshot",
        )
        .bind(job.id.to_string())
        .bind(&job.repository_id)
        .bind(job.state.as_str())
        .bind(ts(&job.created_at))
        .bind(job.completed_at.as_ref().map(ts))
        .bind(snapshot)
        .execute(&self.db)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> Result<Option<ScanJob>, StoreError> {
        let snapshot = sqlx::query_scalar::<_, String>("SELECT snapshot FROM scan_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.db)
            .await
            .map_err(backend)?;

        match snapshot {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn append_findings(&self, findings: &[Finding]) -> Result<(), StoreError> {
        if findings.is_empty() {
            return Ok(());
        }

        // 开始事务
        let mut tx = self.db.begin().await.map_err(backend)?;
        for finding in findings {
            sqlx::query(
                "INSERT OR IGNORE INTO findings (
                    id, scan_job_id, repository_id, unit_id, severity, category, file_path, line,
                    description, raw_severity, needs_review, cwe, owasp, recommendation,
                    original_code, fix_code, compliance_impact, fingerprint, detected_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(finding.id.to_string())
            .bind(finding.scan_job_id.to_string())
            .bind(&finding.repository_id)
            .bind(&finding.unit_id)
            .bind(finding.severity.as_str())
            .bind(&finding.category)
            .bind(&finding.location.file)
            .bind(finding.location.line.map(i64::from))
            .bind(&finding.description)
            .bind(&finding.raw_severity)
            .bind(finding.needs_review)
            .bind(&finding.cwe)
            .bind(&finding.owasp)
            .bind(&finding.recommendation)
            .bind(&finding.original_code)
            .bind(&finding.fix_code)
            .bind(&finding.compliance_impact)
            .bind(&finding.fingerprint)
            .bind(ts(&finding.detected_at))
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;

        tracing::debug!(count = findings.len(), "findings stored");
        Ok(())
    }

    async fn findings_for_job(&self, job_id: JobId) -> Result<Vec<Finding>, StoreError> {
        sqlx::query_as::<_, FindingRow>(
            "SELECT id, scan_job_id, repository_id, unit_id, severity, category, file_path, line,
                    description, raw_severity, needs_review, cwe, owasp, recommendation,
                    original_code, fix_code, compliance_impact, fingerprint, detected_at
             FROM findings WHERE scan_job_id = ? ORDER BY file_path, line",
        )
        .bind(job_id.to_string())
        .fetch_all(&self.db)
        .await
        .map_err(backend)?
        .into_iter()
        .map(Finding::try_from)
        .collect()
    }

    async fn put_summary(&self, repository_id: &str, record: &SummaryRecord) -> Result<bool, StoreError> {
        // 只有不早于现有记录的扫描才能覆盖
        let result = sqlx::query(
            "INSERT INTO severity_summaries (
                repository_id, job_id, critical, high, medium, low, total, computed_at, scanned_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(repository_id) DO UPDATE SET
                job_id = excluded.job_id,
                critical = excluded.critical,
                high = excluded.high,
                medium = excluded.medium,
                low = excluded.low,
                total = excluded.total,
                computed_at = excluded.computed_at,
                scanned_at = excluded.scanned_at
             WHERE excluded.scanned_at >= severity_summaries.scanned_at",
        )
        .bind(repository_id)
        .bind(record.job_id.to_string())
        .bind(record.summary.critical as i64)
        .bind(record.summary.high as i64)
        .bind(record.summary.medium as i64)
        .bind(record.summary.low as i64)
        .bind(record.summary.total as i64)
        .bind(ts(&record.computed_at))
        .bind(ts(&record.scanned_at))
        .execute(&self.db)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_summary(&self, repository_id: &str) -> Result<Option<SummaryRecord>, StoreError> {
        let row = sqlx::query_as::<_, SummaryRow>(&format!(
            "SELECT {} FROM severity_summaries WHERE repository_id = ?",
            SUMMARY_COLUMNS
        ))
        .bind(repository_id)
        .fetch_optional(&self.db)
        .await
        .map_err(backend)?;

        row.map(|r| r.into_record().map(|(_, record)| record))
            .transpose()
    }

    async fn list_summaries(&self) -> Result<Vec<(RepositoryId, SummaryRecord)>, StoreError> {
        sqlx::query_as::<_, SummaryRow>(&format!(
            "SELECT {} FROM severity_summaries ORDER BY repository_id",
            SUMMARY_COLUMNS
        ))
        .fetch_all(&self.db)
        .await
        .map_err(backend)?
        .into_iter()
        .map(SummaryRow::into_record)
        .collect()
    }
}
