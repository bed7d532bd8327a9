use crate::engine;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };

    let include_archived = req
        .params
        .get("includeArchived")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    // Include the record count so the UI can show a useful dashboard.
    let sql = if include_archived {
        "SELECT
           s.id,
           s.name,
           s.archived,
           (SELECT COUNT(*) FROM attendance_records r WHERE r.subject_id = s.id) AS record_count
         FROM subjects s
         ORDER BY s.name"
    } else {
        "SELECT
           s.id,
           s.name,
           s.archived,
           (SELECT COUNT(*) FROM attendance_records r WHERE r.subject_id = s.id) AS record_count
         FROM subjects s
         WHERE s.archived = 0
         ORDER BY s.name"
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let archived: i64 = row.get(2)?;
            let record_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "archived": archived != 0,
                "recordCount": record_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "validation_error", "name must not be empty", None);
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, archived, created_at) VALUES(?, ?, 0, ?)",
        (&subject_id, &name, engine::today()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(
        &req.id,
        json!({ "subjectId": subject_id, "name": name, "archived": false }),
    )
}

// Soft-delete only: the subject drops out of scheduling and analytics,
// its attendance history stays.
fn handle_subjects_archive(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(
            &req.id,
            "not_found",
            "subject not found",
            Some(json!({ "subjectId": subject_id })),
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE subjects SET archived = 1 WHERE id = ?",
        [&subject_id],
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "archived": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.archive" => Some(handle_subjects_archive(state, req)),
        _ => None,
    }
}
