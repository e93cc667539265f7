use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub const DB_FILE_NAME: &str = "gradecore.sqlite3";

/// Value used by freshness queries when a table has no timestamp yet.
pub const EPOCH_TS: &str = "1970-01-01T00:00:00.000000Z";

/// RFC 3339 UTC timestamp with microseconds. Lexicographic order matches time
/// order, which the `MAX(updated_at)` freshness queries rely on.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn open_db(workspace: &Path, busy_timeout: Duration) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(busy_timeout)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS personal_info(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            middle_name TEXT,
            email TEXT,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            personal_info_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(personal_info_id) REFERENCES personal_info(id) ON DELETE SET NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_personal_info ON students(personal_info_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_classes(
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            joined_at TEXT NOT NULL,
            PRIMARY KEY(student_id, class_id),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(class_id) REFERENCES classes(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_classes_class ON student_classes(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_structures(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            structure_name TEXT NOT NULL,
            structure_json TEXT NOT NULL,
            version INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id) ON DELETE CASCADE,
            UNIQUE(class_id, version)
        )",
        [],
    )?;
    // At most one active structure per class.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_grade_structures_one_active
         ON grade_structures(class_id) WHERE is_active = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_categories(
            id TEXT PRIMARY KEY,
            structure_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight REAL NOT NULL,
            position INTEGER NOT NULL,
            FOREIGN KEY(structure_id) REFERENCES grade_structures(id) ON DELETE CASCADE,
            UNIQUE(structure_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_subcategories(
            id TEXT PRIMARY KEY,
            category_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight REAL NOT NULL,
            max_score REAL NOT NULL,
            position INTEGER NOT NULL,
            FOREIGN KEY(category_id) REFERENCES grade_categories(id) ON DELETE CASCADE,
            UNIQUE(category_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_subcategories_category
         ON grade_subcategories(category_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_assessments(
            id TEXT PRIMARY KEY,
            subcategory_id TEXT NOT NULL,
            name TEXT NOT NULL,
            max_score REAL NOT NULL,
            weight REAL,
            passing_score REAL,
            position INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(subcategory_id) REFERENCES grade_subcategories(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_assessments_subcategory
         ON grade_assessments(subcategory_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_scores(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(assessment_id) REFERENCES grade_assessments(id) ON DELETE CASCADE,
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            UNIQUE(assessment_id, student_id)
        )",
        [],
    )?;
    ensure_scores_updated_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_scores_student ON student_scores(student_id)",
        [],
    )?;

    Ok(())
}

fn ensure_scores_updated_at(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before score freshness tracking lack the column.
    if table_has_column(conn, "student_scores", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE student_scores ADD COLUMN updated_at TEXT", [])?;
    conn.execute(
        "UPDATE student_scores SET updated_at = ? WHERE updated_at IS NULL",
        [now_ts()],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
