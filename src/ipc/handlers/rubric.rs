use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::lock::{self, Role};
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

struct SpecInput {
    review_name: String,
    display_name: String,
    faculty_type: Role,
    components: Vec<(String, f64)>,
    deadline_from: Option<String>,
    deadline_to: Option<String>,
    requires_ppt: bool,
}

fn parse_deadline_field(
    review_name: &str,
    obj: &serde_json::Map<String, serde_json::Value>,
) -> Result<(Option<String>, Option<String>), HandlerErr> {
    let Some(deadline) = obj.get("deadline") else {
        return Ok((None, None));
    };
    if deadline.is_null() {
        return Ok((None, None));
    }
    let Some(d) = deadline.as_object() else {
        return Err(bad_params(format!(
            "review {}: deadline must be an object or null",
            review_name
        )));
    };
    let mut out = (None, None);
    for (key, slot) in [("from", &mut out.0), ("to", &mut out.1)] {
        let Some(v) = d.get(key) else { continue };
        if v.is_null() {
            continue;
        }
        let Some(s) = v.as_str() else {
            return Err(bad_params(format!(
                "review {}: deadline.{} must be an RFC 3339 string",
                review_name, key
            )));
        };
        if lock::parse_ts(s).is_none() {
            return Err(bad_params(format!(
                "review {}: deadline.{} is not a valid timestamp",
                review_name, key
            )));
        }
        *slot = Some(s.to_string());
    }
    Ok(out)
}

fn parse_spec_input(i: usize, review: &serde_json::Value) -> Result<SpecInput, HandlerErr> {
    let Some(obj) = review.as_object() else {
        return Err(bad_params(format!("reviews[{}] must be an object", i)));
    };

    let review_name = obj
        .get("reviewName")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_params(format!("reviews[{}] missing reviewName", i)))?;
    let display_name = obj
        .get("displayName")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| review_name.clone());
    let faculty_type = obj
        .get("facultyType")
        .and_then(|v| v.as_str())
        .and_then(Role::parse)
        .ok_or_else(|| {
            bad_params(format!(
                "review {}: facultyType must be guide or panel",
                review_name
            ))
        })?;
    let requires_ppt = obj
        .get("requiresPPT")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let Some(components_arr) = obj.get("components").and_then(|v| v.as_array()) else {
        return Err(bad_params(format!(
            "review {}: missing components[]",
            review_name
        )));
    };
    if components_arr.is_empty() {
        return Err(bad_params(format!(
            "review {}: components[] must not be empty",
            review_name
        )));
    }
    let mut components: Vec<(String, f64)> = Vec::with_capacity(components_arr.len());
    for c in components_arr {
        let name = c
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| bad_params(format!("review {}: component missing name", review_name)))?;
        let weight = c
            .get("weight")
            .and_then(|v| v.as_f64())
            .filter(|w| w.is_finite() && *w >= 0.0)
            .ok_or_else(|| {
                bad_params(format!(
                    "review {}: component {} weight must be a non-negative number",
                    review_name, name
                ))
            })?;
        if components.iter().any(|(n, _)| n == &name) {
            return Err(bad_params(format!(
                "review {}: duplicate component {}",
                review_name, name
            )));
        }
        components.push((name, weight));
    }

    let (deadline_from, deadline_to) = parse_deadline_field(&review_name, obj)?;

    Ok(SpecInput {
        review_name,
        display_name,
        faculty_type,
        components,
        deadline_from,
        deadline_to,
        requires_ppt,
    })
}

fn rubric_define(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school = get_required_str(params, "school")?;
    let department = get_required_str(params, "department")?;
    let Some(reviews_arr) = params.get("reviews").and_then(|v| v.as_array()) else {
        return Err(bad_params("missing reviews[]"));
    };

    let mut specs: Vec<SpecInput> = Vec::with_capacity(reviews_arr.len());
    for (i, review) in reviews_arr.iter().enumerate() {
        let spec = parse_spec_input(i, review)?;
        if specs.iter().any(|s| s.review_name == spec.review_name) {
            return Err(bad_params(format!(
                "duplicate reviewName {}",
                spec.review_name
            )));
        }
        specs.push(spec);
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM rubrics WHERE school = ? AND department = ?",
            (&school, &department),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;

    if let Some(rubric_id) = &existing {
        let project_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM projects WHERE rubric_id = ?",
                [rubric_id],
                |r| r.get(0),
            )
            .map_err(|e| db_err("db_query_failed", e))?;
        if project_count > 0 {
            return Err(HandlerErr {
                code: "conflict",
                message: "rubric already in use by projects; cannot redefine".to_string(),
                details: Some(json!({ "projects": project_count })),
            });
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| db_err("db_tx_failed", e))?;

    let rubric_id = match existing {
        Some(id) => {
            tx.execute(
                "DELETE FROM spec_components WHERE review_spec_id IN (
                    SELECT id FROM review_specs WHERE rubric_id = ?
                 )",
                [&id],
            )
            .map_err(|e| db_err("db_update_failed", e))?;
            tx.execute("DELETE FROM review_specs WHERE rubric_id = ?", [&id])
                .map_err(|e| db_err("db_update_failed", e))?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO rubrics(id, school, department) VALUES(?, ?, ?)",
                (&id, &school, &department),
            )
            .map_err(|e| db_err("db_insert_failed", e))?;
            id
        }
    };

    for (i, spec) in specs.iter().enumerate() {
        let spec_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO review_specs(
                id, rubric_id, review_name, display_name, faculty_type,
                deadline_from, deadline_to, requires_ppt, sort_order
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &spec_id,
                &rubric_id,
                &spec.review_name,
                &spec.display_name,
                spec.faculty_type.as_str(),
                &spec.deadline_from,
                &spec.deadline_to,
                spec.requires_ppt as i64,
                i as i64,
            ),
        )
        .map_err(|e| db_err("db_insert_failed", e))?;
        for (j, (name, weight)) in spec.components.iter().enumerate() {
            tx.execute(
                "INSERT INTO spec_components(id, review_spec_id, name, weight, sort_order)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &spec_id,
                    name,
                    weight,
                    j as i64,
                ),
            )
            .map_err(|e| db_err("db_insert_failed", e))?;
        }
    }

    tx.commit().map_err(|e| db_err("db_commit_failed", e))?;
    Ok(json!({ "rubricId": rubric_id }))
}

fn spec_json(conn: &Connection, spec_id: &str, row: &SpecRow, editable: bool) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT name, weight FROM spec_components
             WHERE review_spec_id = ? ORDER BY sort_order",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let components = stmt
        .query_map([spec_id], |r| {
            Ok(json!({
                "name": r.get::<_, String>(0)?,
                "weight": r.get::<_, f64>(1)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let deadline = match (&row.deadline_from, &row.deadline_to) {
        (None, None) => serde_json::Value::Null,
        (from, to) => json!({ "from": from, "to": to }),
    };

    Ok(json!({
        "reviewName": row.review_name,
        "displayName": row.display_name,
        "facultyType": row.faculty_type.as_str(),
        "components": components,
        "deadline": deadline,
        "requiresPPT": row.requires_ppt,
        "editable": editable
    }))
}

struct SpecRow {
    id: String,
    review_name: String,
    display_name: String,
    faculty_type: Role,
    deadline_from: Option<String>,
    deadline_to: Option<String>,
    requires_ppt: bool,
}

fn load_specs(conn: &Connection, rubric_id: &str) -> Result<Vec<SpecRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, review_name, display_name, faculty_type,
                    deadline_from, deadline_to, requires_ppt
             FROM review_specs WHERE rubric_id = ? ORDER BY sort_order",
        )
        .map_err(|e| db_err("db_query_failed", e))?;
    let rows = stmt
        .query_map([rubric_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, i64>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| db_err("db_query_failed", e))?;

    let mut specs = Vec::with_capacity(rows.len());
    for (id, review_name, display_name, faculty_type, from, to, requires_ppt) in rows {
        let faculty_type = Role::parse(&faculty_type).ok_or_else(|| HandlerErr {
            code: "db_query_failed",
            message: format!("review {}: bad faculty_type in storage", review_name),
            details: None,
        })?;
        specs.push(SpecRow {
            id,
            review_name,
            display_name,
            faculty_type,
            deadline_from: from,
            deadline_to: to,
            requires_ppt: requires_ppt != 0,
        });
    }
    Ok(specs)
}

fn rubric_resolve(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school = get_required_str(params, "school")?;
    let department = get_required_str(params, "department")?;
    let role = get_required_str(params, "facultyType")
        .and_then(|s| Role::parse(&s).ok_or_else(|| bad_params("facultyType must be guide or panel")))?;

    let rubric_id: Option<String> = conn
        .query_row(
            "SELECT id FROM rubrics WHERE school = ? AND department = ?",
            (&school, &department),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_err("db_query_failed", e))?;

    // No rubric configured for the unit means no reviews, not an error.
    let Some(rubric_id) = rubric_id else {
        return Ok(json!({ "reviews": [] }));
    };

    let mut reviews: Vec<serde_json::Value> = Vec::new();
    for spec in load_specs(conn, &rubric_id)? {
        match (role, spec.faculty_type) {
            // Guides edit their own reviews and get a read-only view of
            // panel reviews for status display.
            (Role::Guide, Role::Guide) => reviews.push(spec_json(conn, &spec.id, &spec, true)?),
            (Role::Guide, Role::Panel) => reviews.push(spec_json(conn, &spec.id, &spec, false)?),
            (Role::Panel, Role::Panel) => reviews.push(spec_json(conn, &spec.id, &spec, true)?),
            (Role::Panel, Role::Guide) => {}
        }
    }

    Ok(json!({ "reviews": reviews }))
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
        "rubric.define" => Some(with_conn(state, req, rubric_define)),
        "rubric.resolve" => Some(with_conn(state, req, rubric_resolve)),
        _ => None,
    }
}
