//! Shared lookup and lock-evaluation plumbing. Every surface that needs to
//! know whether a review is editable goes through `evaluate_lock` here plus
//! the pure predicates in `crate::lock`; the rules are not re-derived per
//! handler.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::err;
use crate::lock::{self, PptStatus, RequestStatus, Role};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

pub fn not_found(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "not_found",
        message: message.into(),
        details: None,
    }
}

pub fn conflict(message: impl Into<String>, details: Option<serde_json::Value>) -> HandlerErr {
    HandlerErr {
        code: "conflict",
        message: message.into(),
        details,
    }
}

pub fn db_err(code: &'static str, e: impl ToString) -> HandlerErr {
    HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

pub fn get_required_role(params: &serde_json::Value, key: &str) -> Result<Role, HandlerErr> {
    let s = get_required_str(params, key)?;
    Role::parse(&s).ok_or_else(|| bad_params(format!("{} must be guide or panel", key)))
}

pub struct StudentRow {
    pub id: String,
    pub project_id: String,
    pub reg_no: String,
}

pub fn find_student(conn: &Connection, reg_no: &str) -> Result<StudentRow, HandlerErr> {
    conn.query_row(
        "SELECT id, project_id, reg_no FROM students WHERE reg_no = ?",
        [reg_no],
        |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                project_id: r.get(1)?,
                reg_no: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(|e| db_err("db_query_failed", e))?
    .ok_or_else(|| not_found(format!("student {} not found", reg_no)))
}

pub struct SpecRow {
    pub owner: Role,
    pub deadline_to: Option<DateTime<Utc>>,
    pub requires_ppt: bool,
    pub components: Vec<(String, f64)>,
}

/// The review spec that applies to a project, resolved through its rubric.
/// A `reviewName` the rubric does not define is a not-found, matching the
/// closed review-name set established at record creation.
pub fn load_spec_for_project(
    conn: &Connection,
    project_id: &str,
    review_name: &str,
) -> Result<SpecRow, HandlerErr> {
    let row: Option<(String, String, Option<String>, i64)> = conn
        .query_row(
            "SELECT rs.id, rs.faculty_type, rs.deadline_to, rs.requires_ppt
             FROM review_specs rs
             JOIN projects p ON p.rubric_id = rs.rubric_id
             WHERE p.id = ? AND rs.review_name = ?",
            (project_id, review_name),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    let Some((spec_id, faculty_type, deadline_to, requires_ppt)) = row else {
        return Err(not_found(format!("review {} not found", review_name)));
    };

    let owner = Role::parse(&faculty_type).ok_or_else(|| HandlerErr {
        code: "db_query_failed",
        message: format!("review {}: bad faculty_type in storage", review_name),
        details: None,
    })?;
    let deadline_to = match deadline_to {
        None => None,
        Some(s) => Some(lock::parse_ts(&s).ok_or_else(|| HandlerErr {
            code: "db_query_failed",
            message: format!("review {}: bad deadline in storage", review_name),
            details: None,
        })?),
    };

    let mut stmt = conn
        .prepare(
            "SELECT name, weight FROM spec_components
             WHERE review_spec_id = ? ORDER BY sort_order",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let components = stmt
        .query_map([&spec_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    Ok(SpecRow {
        owner,
        deadline_to,
        requires_ppt: requires_ppt != 0,
        components,
    })
}

pub struct RecordRow {
    pub comments: String,
    pub attendance_value: bool,
    pub attendance_locked: bool,
    pub locked: bool,
}

pub fn load_record(
    conn: &Connection,
    student_id: &str,
    review_name: &str,
) -> Result<RecordRow, HandlerErr> {
    conn.query_row(
        "SELECT comments, attendance_value, attendance_locked, locked
         FROM review_records WHERE student_id = ? AND review_name = ?",
        (student_id, review_name),
        |r| {
            Ok(RecordRow {
                comments: r.get(0)?,
                attendance_value: r.get::<_, i64>(1)? != 0,
                attendance_locked: r.get::<_, i64>(2)? != 0,
                locked: r.get::<_, i64>(3)? != 0,
            })
        },
    )
    .optional()
    .map_err(|e| db_err("db_query_failed", e))?
    .ok_or_else(|| not_found(format!("review record {} not found", review_name)))
}

pub fn load_marks(
    conn: &Connection,
    student_id: &str,
    review_name: &str,
) -> Result<Vec<(String, f64)>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT component, value FROM review_marks
             WHERE student_id = ? AND review_name = ? ORDER BY component",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    stmt.query_map((student_id, review_name), |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| db_err("db_query_failed", e))
}

pub fn record_json(record: &RecordRow, marks: &[(String, f64)]) -> serde_json::Value {
    let mut marks_obj = serde_json::Map::new();
    for (component, value) in marks {
        marks_obj.insert(component.clone(), json!(value));
    }
    json!({
        "marks": marks_obj,
        "comments": record.comments,
        "attendance": {
            "value": record.attendance_value,
            "locked": record.attendance_locked
        },
        "locked": record.locked
    })
}

/// Latest request for a (student, review, role) tuple, newest first.
pub fn latest_request_status(
    conn: &Connection,
    student_id: &str,
    review_name: &str,
    role: Role,
) -> Result<Option<RequestStatus>, HandlerErr> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM extension_requests
             WHERE student_id = ? AND review_name = ? AND faculty_type = ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            (student_id, review_name, role.as_str()),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(status.as_deref().and_then(RequestStatus::parse))
}

/// Latest request for a (student, review) pair regardless of role; the team
/// aggregation works per review, not per role.
pub fn latest_request_status_any_role(
    conn: &Connection,
    student_id: &str,
    review_name: &str,
) -> Result<Option<RequestStatus>, HandlerErr> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM extension_requests
             WHERE student_id = ? AND review_name = ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            (student_id, review_name),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(status.as_deref().and_then(RequestStatus::parse))
}

fn has_approved_request(
    conn: &Connection,
    student_id: &str,
    review_name: &str,
    role: Role,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM extension_requests
         WHERE student_id = ? AND review_name = ? AND faculty_type = ? AND status = 'approved'
         LIMIT 1",
        (student_id, review_name, role.as_str()),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| db_err("db_query_failed", e))
}

/// The latest override `to` across the whole team, for students that have
/// one. Per-student approvals share the team's furthest deadline.
pub fn team_latest_override_to(
    conn: &Connection,
    project_id: &str,
    review_name: &str,
) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT o.to_ts FROM deadline_overrides o
             JOIN students s ON s.id = o.student_id
             WHERE s.project_id = ? AND o.review_name = ?",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let rows: Vec<String> = stmt
        .query_map((project_id, review_name), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(rows.iter().filter_map(|s| lock::parse_ts(s)).max())
}

pub fn team_ppt_status(conn: &Connection, project_id: &str) -> Result<PptStatus, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT ppt_approved FROM students WHERE project_id = ?")
        .map_err(|e| db_err("db_query_failed", e))?;
    let flags: Vec<bool> = stmt
        .query_map([project_id], |r| Ok(r.get::<_, i64>(0)? != 0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;
    Ok(lock::ppt_status(flags))
}

pub struct LockEval {
    pub locked: bool,
    pub hard_locked: bool,
    pub effective_deadline: Option<DateTime<Utc>>,
    pub ppt_status: PptStatus,
    pub ppt_blocked: bool,
}

/// Full editability evaluation for one student and review, from fresh rows.
pub fn evaluate_lock(
    conn: &Connection,
    student: &StudentRow,
    spec: &SpecRow,
    review_name: &str,
    role: Role,
    now: DateTime<Utc>,
) -> Result<LockEval, HandlerErr> {
    let record = load_record(conn, &student.id, review_name)?;
    let approved = has_approved_request(conn, &student.id, review_name, role)?;
    let override_to = if approved {
        team_latest_override_to(conn, &student.project_id, review_name)?
    } else {
        None
    };
    let effective = lock::effective_deadline(spec.deadline_to, approved, override_to);
    let locked = lock::is_locked(record.locked, role, spec.owner, effective, now);

    let ppt_status = team_ppt_status(conn, &student.project_id)?;
    // The PPT gate only blocks the panel phase; it is orthogonal to the
    // deadline result.
    let ppt_blocked = role == Role::Panel && lock::ppt_blocks(spec.requires_ppt, ppt_status);

    Ok(LockEval {
        locked,
        hard_locked: record.locked,
        effective_deadline: effective,
        ppt_status,
        ppt_blocked,
    })
}
