//! Dialect-centralized DDL vocabulary.
//!
//! Driver crates translate these definitions into `CREATE TABLE` statements
//! in their own SQL dialect rather than duplicating column lists. Keeping
//! the column set here means adding a field to the queue's schema touches
//! one file instead of N driver crates.

/// One column in a table this crate owns.
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// Portable column type. Driver crates map each variant to their dialect's
/// native type name.
pub enum ColumnType {
    BigIntPrimaryKey,
    BigInt,
    Integer,
    SmallInt,
    Text,
    Blob,
    Timestamp,
    Uuid,
}

pub const JOBS_TABLE: &str = "duramq_jobs";
pub const FAILED_JOBS_TABLE: &str = "duramq_failed_jobs";

pub const JOBS_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "id", ty: ColumnType::BigIntPrimaryKey, nullable: false },
    ColumnDef { name: "uuid", ty: ColumnType::Uuid, nullable: false },
    ColumnDef { name: "name", ty: ColumnType::Text, nullable: false },
    ColumnDef { name: "callable_type", ty: ColumnType::Text, nullable: false },
    ColumnDef { name: "callable", ty: ColumnType::Blob, nullable: false },
    ColumnDef { name: "namespace", ty: ColumnType::Text, nullable: true },
    ColumnDef { name: "object_instance", ty: ColumnType::Blob, nullable: true },
    ColumnDef { name: "path_files", ty: ColumnType::Text, nullable: true },
    ColumnDef { name: "params", ty: ColumnType::Blob, nullable: false },
    ColumnDef { name: "status", ty: ColumnType::Text, nullable: false },
    ColumnDef { name: "priority", ty: ColumnType::SmallInt, nullable: false },
    ColumnDef { name: "pid", ty: ColumnType::Text, nullable: true },
    ColumnDef { name: "timeout", ty: ColumnType::BigInt, nullable: false },
    ColumnDef { name: "retry_count", ty: ColumnType::Integer, nullable: false },
    ColumnDef { name: "max_retries", ty: ColumnType::Integer, nullable: false },
    ColumnDef { name: "retry_delay", ty: ColumnType::BigInt, nullable: false },
    ColumnDef { name: "started_at", ty: ColumnType::Timestamp, nullable: true },
    ColumnDef { name: "completed_at", ty: ColumnType::Timestamp, nullable: true },
    ColumnDef { name: "created_at", ty: ColumnType::Timestamp, nullable: false },
    ColumnDef { name: "updated_at", ty: ColumnType::Timestamp, nullable: false },
];

pub const FAILED_JOBS_COLUMNS: &[ColumnDef] = &[
    ColumnDef { name: "id", ty: ColumnType::BigIntPrimaryKey, nullable: false },
    ColumnDef { name: "uuid", ty: ColumnType::Uuid, nullable: false },
    ColumnDef { name: "job_id", ty: ColumnType::BigInt, nullable: false },
    ColumnDef { name: "exception", ty: ColumnType::Text, nullable: false },
    ColumnDef { name: "payload", ty: ColumnType::Text, nullable: false },
    ColumnDef { name: "failed_at", ty: ColumnType::Timestamp, nullable: false },
];

/// `CASE priority WHEN 'urgent' THEN 0 ... END` — the dispatch ordering
/// expression shared by every dialect since priority is stored as its
/// numeric rank already; kept here so the rank mapping in `Priority::rank`
/// and the SQL order-by stay in one place conceptually.
pub const PRIORITY_ORDER_SQL: &str = "priority ASC, created_at ASC";
