use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("reviewd.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rubrics(
            id TEXT PRIMARY KEY,
            school TEXT NOT NULL,
            department TEXT NOT NULL,
            UNIQUE(school, department)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS review_specs(
            id TEXT PRIMARY KEY,
            rubric_id TEXT NOT NULL,
            review_name TEXT NOT NULL,
            display_name TEXT NOT NULL,
            faculty_type TEXT NOT NULL,
            deadline_from TEXT,
            deadline_to TEXT,
            requires_ppt INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(rubric_id) REFERENCES rubrics(id),
            UNIQUE(rubric_id, review_name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_review_specs_rubric ON review_specs(rubric_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS spec_components(
            id TEXT PRIMARY KEY,
            review_spec_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(review_spec_id) REFERENCES review_specs(id),
            UNIQUE(review_spec_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_spec_components_spec ON spec_components(review_spec_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS projects(
            id TEXT PRIMARY KEY,
            rubric_id TEXT NOT NULL,
            title TEXT NOT NULL,
            guide_faculty TEXT NOT NULL,
            panel_id TEXT,
            best_project INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(rubric_id) REFERENCES rubrics(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_projects_rubric ON projects(rubric_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            reg_no TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            ppt_approved INTEGER NOT NULL DEFAULT 0,
            ppt_locked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(project_id) REFERENCES projects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_project ON students(project_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS review_records(
            student_id TEXT NOT NULL,
            review_name TEXT NOT NULL,
            comments TEXT NOT NULL DEFAULT '',
            attendance_value INTEGER NOT NULL DEFAULT 1,
            attendance_locked INTEGER NOT NULL DEFAULT 0,
            locked INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY(student_id, review_name),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_review_records_student ON review_records(student_id)",
        [],
    )?;

    // Mark rows are created alongside the record, one per rubric component.
    // The component set is closed at creation time; submissions may only
    // update rows that already exist.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS review_marks(
            student_id TEXT NOT NULL,
            review_name TEXT NOT NULL,
            component TEXT NOT NULL,
            value REAL NOT NULL DEFAULT 0,
            PRIMARY KEY(student_id, review_name, component),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_review_marks_student ON review_marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS deadline_overrides(
            student_id TEXT NOT NULL,
            review_name TEXT NOT NULL,
            from_ts TEXT NOT NULL,
            to_ts TEXT NOT NULL,
            PRIMARY KEY(student_id, review_name),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS extension_requests(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            faculty TEXT NOT NULL,
            faculty_type TEXT NOT NULL,
            review_name TEXT NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            resolved_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_extension_requests_student ON extension_requests(student_id)",
        [],
    )?;
    // At most one pending request per (student, review). Two racing creators
    // cannot both insert; the loser gets a constraint error, surfaced as a
    // conflict by the handler.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_extension_requests_one_pending
         ON extension_requests(student_id, review_name)
         WHERE status = 'pending'",
        [],
    )?;

    Ok(conn)
}
