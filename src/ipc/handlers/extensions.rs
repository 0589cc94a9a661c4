use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, conflict, db_err, find_student, get_required_role, get_required_str,
    latest_request_status, load_spec_for_project, not_found, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::lock::{self, RequestStatus};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn review_status(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let reg_no = get_required_str(params, "regNo")?;
    let review_name = get_required_str(params, "reviewName")?;
    let role = get_required_role(params, "facultyType")?;

    let student = find_student(conn, &reg_no)?;
    // Validates the review name against the rubric before reporting status.
    load_spec_for_project(conn, &student.project_id, &review_name)?;

    let latest = latest_request_status(conn, &student.id, &review_name, role)?;
    // A rejected request changes nothing; for gating it reads as none.
    let status = match latest {
        Some(RequestStatus::Pending) => "pending",
        Some(RequestStatus::Approved) => "approved",
        Some(RequestStatus::Rejected) | None => "none",
    };
    Ok(json!({
        "status": status,
        "latest": latest.map(|s| s.as_str())
    }))
}

fn extension_request(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let reg_no = get_required_str(params, "regNo")?;
    let review_name = get_required_str(params, "reviewName")?;
    let role = get_required_role(params, "facultyType")?;
    let faculty = get_required_str(params, "faculty")?;
    let reason = get_required_str(params, "reason")?;
    if reason.trim().is_empty() {
        return Err(bad_params("reason must not be empty"));
    }

    let student = find_student(conn, &reg_no)?;
    load_spec_for_project(conn, &student.project_id, &review_name)?;

    // One pending request per (student, review) at a time, regardless of
    // role. The partial unique index backs this check against races.
    let pending: Option<String> = conn
        .query_row(
            "SELECT id FROM extension_requests
             WHERE student_id = ? AND review_name = ? AND status = 'pending'",
            (&student.id, &review_name),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    if let Some(existing) = pending {
        return Err(conflict(
            "a pending request already exists for this review",
            Some(json!({ "requestId": existing })),
        ));
    }

    let request_id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO extension_requests(
            id, student_id, faculty, faculty_type, review_name, reason, status, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, 'pending', ?)",
        (
            &request_id,
            &student.id,
            &faculty,
            role.as_str(),
            &review_name,
            &reason,
            &created_at,
        ),
    )
    .map_err(|e| {
        // The unique pending index fires when a racing request won.
        if matches!(
            e.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ConstraintViolation)
        ) {
            conflict("a pending request already exists for this review", None)
        } else {
            db_err("db_insert_failed", e)
        }
    })?;

    Ok(json!({ "requestId": request_id }))
}

fn extension_resolve(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let request_id = get_required_str(params, "requestId")?;
    let status = get_required_str(params, "status")?;
    let status = RequestStatus::parse(&status)
        .filter(|s| *s != RequestStatus::Pending)
        .ok_or_else(|| bad_params("status must be approved or rejected"))?;

    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT student_id, review_name, status FROM extension_requests WHERE id = ?",
            [&request_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    let Some((student_id, review_name, current)) = row else {
        return Err(not_found("request not found"));
    };

    // Approved and rejected are terminal.
    if current != "pending" {
        return Err(conflict(
            format!("request already {}", current),
            Some(json!({ "requestId": request_id })),
        ));
    }

    let now = Utc::now();

    if status == RequestStatus::Rejected {
        conn.execute(
            "UPDATE extension_requests SET status = 'rejected', resolved_at = ? WHERE id = ?",
            (now.to_rfc3339(), &request_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
        return Ok(json!({ "requestId": request_id, "status": "rejected" }));
    }

    // Approval: validate the new deadline fully before touching any state.
    let new_deadline = params
        .get("newDeadline")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_params("approval requires newDeadline"))?;
    let new_deadline = lock::parse_ts(new_deadline)
        .ok_or_else(|| bad_params("newDeadline is not a valid timestamp"))?;
    if new_deadline < now {
        return Err(bad_params("newDeadline must not be in the past"));
    }

    let existing_to: Option<String> = conn
        .query_row(
            "SELECT to_ts FROM deadline_overrides WHERE student_id = ? AND review_name = ?",
            (&student_id, &review_name),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    // Override deadlines only ever advance.
    let final_to = match existing_to.as_deref().and_then(lock::parse_ts) {
        Some(old) if old > new_deadline => old,
        _ => new_deadline,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    tx.execute(
        "UPDATE extension_requests SET status = 'approved', resolved_at = ? WHERE id = ?",
        (now.to_rfc3339(), &request_id),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    // Approval clears the hard lock so the reopened window is usable.
    tx.execute(
        "UPDATE review_records SET locked = 0 WHERE student_id = ? AND review_name = ?",
        (&student_id, &review_name),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    tx.execute(
        "INSERT INTO deadline_overrides(student_id, review_name, from_ts, to_ts)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(student_id, review_name) DO UPDATE SET
           to_ts = excluded.to_ts",
        (
            &student_id,
            &review_name,
            now.to_rfc3339(),
            final_to.to_rfc3339(),
        ),
    )
    .map_err(|e| db_err("db_insert_failed", e))?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({
        "requestId": request_id,
        "status": "approved",
        "newDeadline": final_to.to_rfc3339()
    }))
}

fn extension_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let reg_no = params.get("regNo").and_then(|v| v.as_str());
    let status = params.get("status").and_then(|v| v.as_str());
    if let Some(s) = status {
        if RequestStatus::parse(s).is_none() {
            return Err(bad_params("status must be pending, approved or rejected"));
        }
    }

    let student_id = match reg_no {
        Some(r) => Some(find_student(conn, r)?.id),
        None => None,
    };

    let mut stmt = conn
        .prepare(
            "SELECT e.id, s.reg_no, e.faculty, e.faculty_type, e.review_name,
                    e.reason, e.status, e.created_at, e.resolved_at
             FROM extension_requests e
             JOIN students s ON s.id = e.student_id
             WHERE (?1 IS NULL OR e.student_id = ?1)
               AND (?2 IS NULL OR e.status = ?2)
             ORDER BY e.created_at DESC, e.rowid DESC",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let requests = stmt
        .query_map((&student_id, &status), |r| {
            Ok(json!({
                "requestId": r.get::<_, String>(0)?,
                "regNo": r.get::<_, String>(1)?,
                "faculty": r.get::<_, String>(2)?,
                "facultyType": r.get::<_, String>(3)?,
                "reviewName": r.get::<_, String>(4)?,
                "reason": r.get::<_, String>(5)?,
                "status": r.get::<_, String>(6)?,
                "createdAt": r.get::<_, String>(7)?,
                "resolvedAt": r.get::<_, Option<String>>(8)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    Ok(json!({ "requests": requests }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "review.status" => Some(with_conn(state, req, review_status)),
        "extension.request" => Some(with_conn(state, req, extension_request)),
        "extension.resolve" => Some(with_conn(state, req, extension_resolve)),
        "extension.list" => Some(with_conn(state, req, extension_list)),
        _ => None,
    }
}
