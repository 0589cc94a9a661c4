use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::lock;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

fn db_err(code: &'static str, e: impl ToString) -> HandlerErr {
    HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

fn project_exists(conn: &Connection, project_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM projects WHERE id = ?", [project_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| db_err("db_query_failed", e))
}

fn project_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school = get_required_str(params, "school")?;
    let department = get_required_str(params, "department")?;
    let title = get_required_str(params, "title")?;
    let guide_faculty = get_required_str(params, "guideFaculty")?;
    let Some(students_arr) = params.get("students").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing students[]"));
    };
    if students_arr.is_empty() {
        return Err(bad_params("students[] must not be empty"));
    }

    let mut students: Vec<(String, String)> = Vec::with_capacity(students_arr.len());
    for (i, s) in students_arr.iter().enumerate() {
        let reg_no = s
            .get("regNo")
            .and_then(|v| v.as_str())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| bad_params(format!("students[{}] missing regNo", i)))?;
        let name = s
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if students.iter().any(|(r, _)| r == &reg_no) {
            return Err(bad_params(format!("duplicate regNo {}", reg_no)));
        }
        students.push((reg_no, name));
    }

    let rubric_id: Option<String> = conn
        .query_row(
            "SELECT id FROM rubrics WHERE school = ? AND department = ?",
            (&school, &department),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    let Some(rubric_id) = rubric_id else {
        return Err(HandlerErr {
            code: "not_found",
            message: "no rubric configured for unit".to_string(),
            details: Some(json!({ "school": school, "department": department })),
        });
    };

    for (reg_no, _) in &students {
        let taken: Option<i64> = conn
            .query_row("SELECT 1 FROM students WHERE reg_no = ?", [reg_no], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| db_err("db_query_failed", e))?;
        if taken.is_some() {
            return Err(HandlerErr {
                code: "conflict",
                message: format!("regNo {} already registered", reg_no),
                details: None,
            });
        }
    }

    // Review records are fanned out from the rubric at creation time: one
    // record and one zeroed mark row per component, for every student and
    // every review spec. The component key set is closed here.
    let mut spec_stmt = conn
        .prepare("SELECT id, review_name FROM review_specs WHERE rubric_id = ? ORDER BY sort_order")
        .map_err(|e| db_err("db_query_failed", e))?;
    let specs: Vec<(String, String)> = spec_stmt
        .query_map([&rubric_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let mut components: Vec<(String, Vec<String>)> = Vec::with_capacity(specs.len());
    for (spec_id, review_name) in &specs {
        let mut comp_stmt = conn
            .prepare("SELECT name FROM spec_components WHERE review_spec_id = ? ORDER BY sort_order")
            .map_err(|e| db_err("db_query_failed", e))?;
        let names: Vec<String> = comp_stmt
            .query_map([spec_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| db_err("db_query_failed", e))?;
        components.push((review_name.clone(), names));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;

    let project_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO projects(id, rubric_id, title, guide_faculty) VALUES(?, ?, ?, ?)",
        (&project_id, &rubric_id, &title, &guide_faculty),
    )
    .map_err(|e| db_err("db_insert_failed", e))?;

    let mut student_ids: Vec<String> = Vec::with_capacity(students.len());
    for (reg_no, name) in &students {
        let student_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO students(id, project_id, reg_no, name) VALUES(?, ?, ?, ?)",
            (&student_id, &project_id, reg_no, name),
        )
        .map_err(|e| db_err("db_insert_failed", e))?;

        for (review_name, component_names) in &components {
            tx.execute(
                "INSERT INTO review_records(student_id, review_name) VALUES(?, ?)",
                (&student_id, review_name),
            )
            .map_err(|e| db_err("db_insert_failed", e))?;
            for component in component_names {
                tx.execute(
                    "INSERT INTO review_marks(student_id, review_name, component, value)
                     VALUES(?, ?, ?, 0)",
                    (&student_id, review_name, component),
                )
                .map_err(|e| db_err("db_insert_failed", e))?;
            }
        }
        student_ids.push(student_id);
    }

    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;
    Ok(json!({ "projectId": project_id, "studentIds": student_ids }))
}

fn project_assign_panel(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let project_id = get_required_str(params, "projectId")?;
    let panel_id = get_required_str(params, "panelId")?;

    if !project_exists(conn, &project_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "project not found".to_string(),
            details: None,
        });
    }
    conn.execute(
        "UPDATE projects SET panel_id = ? WHERE id = ?",
        (&panel_id, &project_id),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn project_set_best(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let project_id = get_required_str(params, "projectId")?;
    let best = params
        .get("best")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| bad_params("missing best"))?;

    if !project_exists(conn, &project_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "project not found".to_string(),
            details: None,
        });
    }
    conn.execute(
        "UPDATE projects SET best_project = ? WHERE id = ?",
        (best as i64, &project_id),
    )
    .map_err(|e| db_err("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn project_set_ppt_approval(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let approved = params
        .get("approved")
        .and_then(|v| v.as_bool())
        .ok_or_else(|| bad_params("missing approved"))?;

    // Per-student flags are authoritative; the projectId form is the legacy
    // project-level write and stamps every student on the team.
    let targets: Vec<(String, String, bool)> = if let Some(reg_no) =
        params.get("regNo").and_then(|v| v.as_str())
    {
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT id, reg_no, ppt_locked FROM students WHERE reg_no = ?",
                [reg_no],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(|e| db_err("db_query_failed", e))?;
        let Some((id, reg_no, locked)) = row else {
            return Err(HandlerErr {
                code: "not_found",
                message: "student not found".to_string(),
                details: None,
            });
        };
        vec![(id, reg_no, locked != 0)]
    } else if let Some(project_id) = params.get("projectId").and_then(|v| v.as_str()) {
        if !project_exists(conn, project_id)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "project not found".to_string(),
                details: None,
            });
        }
        let mut stmt = conn
            .prepare("SELECT id, reg_no, ppt_locked FROM students WHERE project_id = ?")
            .map_err(|e| db_err("db_query_failed", e))?;
        stmt.query_map([project_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?
    } else {
        return Err(bad_params("missing regNo or projectId"));
    };

    let locked: Vec<&str> = targets
        .iter()
        .filter(|(_, _, l)| *l)
        .map(|(_, r, _)| r.as_str())
        .collect();
    if !locked.is_empty() {
        return Err(HandlerErr {
            code: "conflict",
            message: "ppt approval is locked".to_string(),
            details: Some(json!({ "regNos": locked })),
        });
    }

    // Optional admin freeze of the flag once the guide phase is settled.
    let lock_flag = params.get("lock").and_then(|v| v.as_bool());

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;
    for (student_id, _, _) in &targets {
        tx.execute(
            "UPDATE students SET ppt_approved = ?,
                ppt_locked = COALESCE(?, ppt_locked)
             WHERE id = ?",
            (approved as i64, lock_flag.map(|b| b as i64), student_id),
        )
        .map_err(|e| db_err("db_update_failed", e))?;
    }
    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;

    Ok(json!({ "approved": targets.len() }))
}

fn project_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let project_id = get_required_str(params, "projectId")?;

    let row: Option<(String, String, Option<String>, i64)> = conn
        .query_row(
            "SELECT title, guide_faculty, panel_id, best_project FROM projects WHERE id = ?",
            [&project_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;
    let Some((title, guide_faculty, panel_id, best_project)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "project not found".to_string(),
            details: None,
        });
    };

    let mut stmt = conn
        .prepare(
            "SELECT reg_no, name, ppt_approved, ppt_locked
             FROM students WHERE project_id = ? ORDER BY reg_no",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let students: Vec<(String, String, bool, bool)> = stmt
        .query_map([&project_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)? != 0,
                r.get::<_, i64>(3)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let ppt = lock::ppt_status(students.iter().map(|(_, _, a, _)| *a));
    let students_json: Vec<serde_json::Value> = students
        .iter()
        .map(|(reg_no, name, approved, locked)| {
            json!({
                "regNo": reg_no,
                "name": name,
                "pptApproved": approved,
                "pptLocked": locked
            })
        })
        .collect();

    Ok(json!({
        "projectId": project_id,
        "title": title,
        "guideFaculty": guide_faculty,
        "panelId": panel_id,
        "bestProject": best_project != 0,
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
        "project.create" => Some(with_conn(state, req, project_create)),
        "project.assignPanel" => Some(with_conn(state, req, project_assign_panel)),
        "project.setPptApproval" => Some(with_conn(state, req, project_set_ppt_approval)),
        "project.setBestProject" => Some(with_conn(state, req, project_set_best)),
        "project.get" => Some(with_conn(state, req, project_get)),
        _ => None,
    }
}
