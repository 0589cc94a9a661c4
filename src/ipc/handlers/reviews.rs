use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, conflict, db_err, evaluate_lock, find_student, get_required_role,
    get_required_str, load_marks, load_record, load_spec_for_project, record_json, HandlerErr,
    SpecRow, StudentRow,
};
use crate::ipc::types::{AppState, Request};
use crate::lock::Role;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;

/// One validated, ready-to-write submission. `resets` lists the components
/// whose submitted mark exceeded the weight and was reset to 0.
struct ValidatedSubmission {
    marks: Vec<(String, f64)>,
    comments: String,
    attendance_value: bool,
    resets: Vec<String>,
}

/// The per-component rules of the submission validator:
/// - every rubric component must be present with a finite mark >= 0;
/// - unknown component names are rejected;
/// - a mark above the component weight is stored as 0, not clamped (legacy
///   parity; the caller is told via `resets`);
/// - an absent student gets all-zero marks and empty comments, atomically
///   with the attendance flag.
fn validate_submission(
    spec: &SpecRow,
    params: &serde_json::Value,
) -> Result<ValidatedSubmission, HandlerErr> {
    let Some(marks_obj) = params.get("marks").and_then(|v| v.as_object()) else {
        return Err(bad_params("missing marks{}"));
    };
    let attendance_value = params
        .get("attendance")
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_bool())
        .ok_or_else(|| bad_params("missing attendance.value"))?;
    let comments = match params.get("comments") {
        None => String::new(),
        Some(v) if v.is_null() => String::new(),
        Some(v) => v
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| bad_params("comments must be a string"))?,
    };

    for key in marks_obj.keys() {
        if !spec.components.iter().any(|(name, _)| name == key) {
            return Err(bad_params(format!("unknown component {}", key)));
        }
    }

    let mut marks: Vec<(String, f64)> = Vec::with_capacity(spec.components.len());
    let mut resets: Vec<String> = Vec::new();
    for (name, weight) in &spec.components {
        let Some(raw) = marks_obj.get(name) else {
            return Err(bad_params(format!("missing mark for component {}", name)));
        };
        let value = raw
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| bad_params(format!("mark for {} must be a number", name)))?;
        if value < 0.0 {
            return Err(bad_params(format!("mark for {} must be >= 0", name)));
        }
        // Over-cap is reset to zero, not clamped to the weight.
        if value > *weight {
            resets.push(name.clone());
            marks.push((name.clone(), 0.0));
        } else {
            marks.push((name.clone(), value));
        }
    }

    if !attendance_value {
        for (_, v) in marks.iter_mut() {
            *v = 0.0;
        }
        return Ok(ValidatedSubmission {
            marks,
            comments: String::new(),
            attendance_value: false,
            resets,
        });
    }

    Ok(ValidatedSubmission {
        marks,
        comments,
        attendance_value: true,
        resets,
    })
}

/// Gate checks shared by single and bulk submission. Authorization first,
/// then hard/deadline lock, then the panel PPT gate.
fn check_submit_gates(
    conn: &Connection,
    student: &StudentRow,
    spec: &SpecRow,
    review_name: &str,
    role: Role,
) -> Result<(), HandlerErr> {
    if role != spec.owner {
        return Err(HandlerErr {
            code: "forbidden",
            message: format!(
                "review {} is owned by {} faculty",
                review_name,
                spec.owner.as_str()
            ),
            details: None,
        });
    }

    let eval = evaluate_lock(conn, student, spec, review_name, role, Utc::now())?;
    if eval.locked {
        let reason = if eval.hard_locked { "hard_locked" } else { "deadline_passed" };
        return Err(conflict(
            format!("review {} is locked", review_name),
            Some(json!({ "regNo": student.reg_no, "reason": reason })),
        ));
    }
    if eval.ppt_blocked {
        return Err(conflict(
            "panel editing blocked until guide ppt approval completes",
            Some(json!({ "pptStatus": eval.ppt_status.as_str() })),
        ));
    }
    Ok(())
}

fn write_submission(
    conn: &Connection,
    student_id: &str,
    review_name: &str,
    sub: &ValidatedSubmission,
) -> Result<(), HandlerErr> {
    for (component, value) in &sub.marks {
        conn.execute(
            "UPDATE review_marks SET value = ?
             WHERE student_id = ? AND review_name = ? AND component = ?",
            (value, student_id, review_name, component),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    }
    conn.execute(
        "UPDATE review_records SET comments = ?, attendance_value = ?
         WHERE student_id = ? AND review_name = ?",
        (
            &sub.comments,
            sub.attendance_value as i64,
            student_id,
            review_name,
        ),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    Ok(())
}

fn review_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let reg_no = get_required_str(params, "regNo")?;
    let review_name = get_required_str(params, "reviewName")?;
    let student = find_student(conn, &reg_no)?;
    let record = load_record(conn, &student.id, &review_name)?;
    let marks = load_marks(conn, &student.id, &review_name)?;
    Ok(json!({
        "regNo": student.reg_no,
        "reviewName": review_name,
        "record": record_json(&record, &marks)
    }))
}

fn review_lock_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let reg_no = get_required_str(params, "regNo")?;
    let review_name = get_required_str(params, "reviewName")?;
    let role = get_required_role(params, "facultyType")?;

    let student = find_student(conn, &reg_no)?;
    let spec = load_spec_for_project(conn, &student.project_id, &review_name)?;
    let eval = evaluate_lock(conn, &student, &spec, &review_name, role, Utc::now())?;

    Ok(json!({
        "locked": eval.locked,
        "hardLocked": eval.hard_locked,
        "effectiveDeadline": eval.effective_deadline.map(|d| d.to_rfc3339()),
        "pptBlocked": eval.ppt_blocked,
        "pptStatus": eval.ppt_status.as_str()
    }))
}

fn review_submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let reg_no = get_required_str(params, "regNo")?;
    let review_name = get_required_str(params, "reviewName")?;
    let role = get_required_role(params, "facultyType")?;

    let student = find_student(conn, &reg_no)?;
    let spec = load_spec_for_project(conn, &student.project_id, &review_name)?;
    check_submit_gates(conn, &student, &spec, &review_name, role)?;

    let record = load_record(conn, &student.id, &review_name)?;
    let sub = validate_submission(&spec, params)?;
    if record.attendance_locked && sub.attendance_value != record.attendance_value {
        return Err(conflict(
            "attendance is locked for this review",
            Some(json!({ "regNo": student.reg_no })),
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    write_submission(&tx, &student.id, &review_name, &sub)?;
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    let record = load_record(conn, &student.id, &review_name)?;
    let marks = load_marks(conn, &student.id, &review_name)?;
    Ok(json!({
        "record": record_json(&record, &marks),
        "resets": sub.resets
    }))
}

fn review_submit_bulk(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let project_id = get_required_str(params, "projectId")?;
    let review_name = get_required_str(params, "reviewName")?;
    let role = get_required_role(params, "facultyType")?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing entries[]"));
    };

    let spec = load_spec_for_project(conn, &project_id, &review_name)?;

    // Validate everything before writing anything; one bad entry fails the
    // whole batch with no partial mutation.
    let mut validated: Vec<(StudentRow, ValidatedSubmission)> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let reg_no = entry
            .get("regNo")
            .and_then(|v| v.as_str())
            .ok_or_else(|| bad_params(format!("entries[{}] missing regNo", i)))?;
        let student = find_student(conn, reg_no)?;
        if student.project_id != project_id {
            return Err(bad_params(format!(
                "student {} does not belong to project",
                reg_no
            )));
        }
        check_submit_gates(conn, &student, &spec, &review_name, role)?;
        let record = load_record(conn, &student.id, &review_name)?;
        let sub = validate_submission(&spec, entry)?;
        if record.attendance_locked && sub.attendance_value != record.attendance_value {
            return Err(conflict(
                "attendance is locked for this review",
                Some(json!({ "regNo": student.reg_no })),
            ));
        }
        validated.push((student, sub));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    for (student, sub) in &validated {
        write_submission(&tx, &student.id, &review_name, sub)?;
    }
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    let results: Vec<serde_json::Value> = validated
        .iter()
        .map(|(student, sub)| {
            json!({
                "regNo": student.reg_no,
                "resets": sub.resets
            })
        })
        .collect();
    Ok(json!({ "updated": validated.len(), "results": results }))
}

/// Admin-side hard lock. Setting `locked` here is independent of deadlines;
/// only an approved extension (or this method) clears it again.
fn review_set_lock(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let reg_no = get_required_str(params, "regNo")?;
    let review_name = get_required_str(params, "reviewName")?;
    let locked = params
        .get("locked")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| bad_params("missing locked"))?;
    let attendance_locked = params.get("attendanceLocked").and_then(|v| v.as_bool());

    let student = find_student(conn, &reg_no)?;
    load_record(conn, &student.id, &review_name)?;

    conn.execute(
        "UPDATE review_records SET locked = ?,
            attendance_locked = COALESCE(?, attendance_locked)
         WHERE student_id = ? AND review_name = ?",
        (
            locked as i64,
            attendance_locked.map(|b| b as i64),
            &student.id,
            &review_name,
        ),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
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
        "review.get" => Some(with_conn(state, req, review_get)),
        "review.lockStatus" => Some(with_conn(state, req, review_lock_status)),
        "review.submit" => Some(with_conn(state, req, review_submit)),
        "review.submitBulk" => Some(with_conn(state, req, review_submit_bulk)),
        "review.setLock" => Some(with_conn(state, req, review_set_lock)),
        _ => None,
    }
}
