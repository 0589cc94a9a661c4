use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_err, evaluate_lock, get_required_role, get_required_str, latest_request_status_any_role,
    load_spec_for_project, not_found, team_latest_override_to, team_ppt_status, HandlerErr,
    StudentRow,
};
use crate::ipc::types::{AppState, Request};
use crate::lock::{self, TeamRequestStatus};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

/// Per-team, per-review projection over the evaluator and workflow state.
/// Pure read side: recomputed from fresh rows on every call, never cached.
fn team_review_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let project_id = get_required_str(params, "projectId")?;
    let review_name = get_required_str(params, "reviewName")?;
    let role = get_required_role(params, "facultyType")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM projects WHERE id = ?", [&project_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    if exists.is_none() {
        return Err(not_found("project not found"));
    }

    let spec = load_spec_for_project(conn, &project_id, &review_name)?;
    let now = Utc::now();

    let mut stmt = conn
        .prepare("SELECT id, project_id, reg_no FROM students WHERE project_id = ? ORDER BY reg_no")
        .map_err(|e| db_err("db_query_failed", e))?;
    let students: Vec<StudentRow> = stmt
        .query_map([&project_id], |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                project_id: r.get(1)?,
                reg_no: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let mut latest_statuses = Vec::with_capacity(students.len());
    let mut any_locked = false;
    let mut students_json: Vec<serde_json::Value> = Vec::with_capacity(students.len());
    for student in &students {
        let latest = latest_request_status_any_role(conn, &student.id, &review_name)?;
        let eval = evaluate_lock(conn, student, &spec, &review_name, role, now)?;
        if eval.locked {
            any_locked = true;
        }
        students_json.push(json!({
            "regNo": student.reg_no,
            "locked": eval.locked,
            "requestStatus": latest.map(|s| s.as_str())
        }));
        latest_statuses.push(latest);
    }

    let team_status = lock::team_request_status(latest_statuses);

    // Team deadline: the rubric's own, unless an approved extension swaps in
    // the latest override across the team (falling back to the rubric
    // deadline when no student carries one).
    let team_deadline = if team_status == TeamRequestStatus::Approved {
        team_latest_override_to(conn, &project_id, &review_name)?.or(spec.deadline_to)
    } else {
        spec.deadline_to
    };
    let deadline_passed = match team_deadline {
        None => false,
        Some(d) => now > d,
    };

    let locked = lock::team_locked(any_locked, team_status);
    let ppt = team_ppt_status(conn, &project_id)?;

    Ok(json!({
        "requestStatus": team_status.as_str(),
        "deadlinePassed": deadline_passed,
        "locked": locked,
        "effectiveDeadline": team_deadline.map(|d| d.to_rfc3339()),
        "requiresPPT": spec.requires_ppt,
        "pptStatus": ppt.as_str(),
        "students": students_json
    }))
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
        "team.reviewStatus" => Some(with_conn(state, req, team_review_status)),
        _ => None,
    }
}
