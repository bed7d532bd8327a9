use crate::engine::{self, DayOfWeek};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
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

    fn db(e: rusqlite::Error) -> Self {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

impl From<engine::EngineError> for HandlerErr {
    fn from(e: engine::EngineError) -> Self {
        HandlerErr {
            code: match e.code.as_str() {
                "invalid_date" => "invalid_date",
                "validation_error" => "validation_error",
                _ => "bad_params",
            },
            message: e.message,
            details: e.details,
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

#[derive(Debug, Clone)]
struct TimetableRow {
    id: String,
    name: String,
    active: bool,
    archived: bool,
}

fn load_timetable(conn: &Connection, timetable_id: &str) -> Result<Option<TimetableRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, name, active, archived FROM timetables WHERE id = ?",
        [timetable_id],
        |r| {
            Ok(TimetableRow {
                id: r.get(0)?,
                name: r.get(1)?,
                active: r.get::<_, i64>(2)? != 0,
                archived: r.get::<_, i64>(3)? != 0,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db)
}

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

struct SlotInput {
    day: DayOfWeek,
    subject_id: String,
    start_time: String,
    end_time: String,
}

fn parse_slot_input(conn: &Connection, raw: &serde_json::Value) -> Result<SlotInput, HandlerErr> {
    let day_raw = get_required_str(raw, "day")?;
    let Some(day) = DayOfWeek::parse(&day_raw) else {
        return Err(HandlerErr {
            code: "validation_error",
            message: format!("unknown day: {}", day_raw),
            details: Some(json!({ "day": day_raw })),
        });
    };
    let subject_id = get_required_str(raw, "subjectId")?;
    let start_time = get_required_str(raw, "startTime")?;
    let end_time = get_required_str(raw, "endTime")?;
    engine::validate_slot_times(&start_time, &end_time)?;
    if !subject_exists(conn, &subject_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: Some(json!({ "subjectId": subject_id })),
        });
    }
    Ok(SlotInput {
        day,
        subject_id,
        start_time,
        end_time,
    })
}

fn slots_json(conn: &Connection, timetable_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, day, subject_id, start_time, end_time, sort_order
             FROM slots
             WHERE timetable_id = ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::db)?;
    stmt.query_map([timetable_id], |r| {
        let id: String = r.get(0)?;
        let day: String = r.get(1)?;
        let subject_id: String = r.get(2)?;
        let start_time: String = r.get(3)?;
        let end_time: String = r.get(4)?;
        let sort_order: i64 = r.get(5)?;
        Ok(json!({
            "id": id,
            "day": day,
            "subjectId": subject_id,
            "startTime": start_time,
            "endTime": end_time,
            "sortOrder": sort_order
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn timetables_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, active, archived FROM timetables ORDER BY name")
        .map_err(HandlerErr::db)?;
    let rows: Vec<TimetableRow> = stmt
        .query_map([], |r| {
            Ok(TimetableRow {
                id: r.get(0)?,
                name: r.get(1)?,
                active: r.get::<_, i64>(2)? != 0,
                archived: r.get::<_, i64>(3)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut out = Vec::with_capacity(rows.len());
    for t in rows {
        let slots = slots_json(conn, &t.id)?;
        out.push(json!({
            "id": t.id,
            "name": t.name,
            "active": t.active,
            "archived": t.archived,
            "slots": slots
        }));
    }
    Ok(json!({ "timetables": out }))
}

fn timetables_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "validation_error",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }

    let slot_inputs: Vec<SlotInput> = match params.get("slots").and_then(|v| v.as_array()) {
        None => Vec::new(),
        Some(raw_slots) => {
            let mut parsed = Vec::with_capacity(raw_slots.len());
            for raw in raw_slots {
                parsed.push(parse_slot_input(conn, raw)?);
            }
            parsed
        }
    };

    let timetable_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "INSERT INTO timetables(id, name, active, archived) VALUES(?, ?, 0, 0)",
        (&timetable_id, &name),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "timetables" })),
    })?;
    for (i, slot) in slot_inputs.iter().enumerate() {
        tx.execute(
            "INSERT INTO slots(id, timetable_id, day, subject_id, start_time, end_time, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &timetable_id,
                slot.day.as_str(),
                &slot.subject_id,
                &slot.start_time,
                &slot.end_time,
                i as i64,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "slots" })),
        })?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    let slots = slots_json(conn, &timetable_id)?;
    Ok(json!({
        "timetableId": timetable_id,
        "name": name,
        "active": false,
        "archived": false,
        "slots": slots
    }))
}

fn timetables_add_slot(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let timetable_id = get_required_str(params, "timetableId")?;
    let Some(timetable) = load_timetable(conn, &timetable_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "timetable not found".to_string(),
            details: Some(json!({ "timetableId": timetable_id })),
        });
    };
    if timetable.archived {
        return Err(HandlerErr {
            code: "invalid_state",
            message: "cannot modify an archived timetable".to_string(),
            details: Some(json!({ "timetableId": timetable.id })),
        });
    }
    let slot = parse_slot_input(conn, params)?;

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM slots WHERE timetable_id = ?",
            [&timetable_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;
    let slot_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO slots(id, timetable_id, day, subject_id, start_time, end_time, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &slot_id,
            &timetable_id,
            slot.day.as_str(),
            &slot.subject_id,
            &slot.start_time,
            &slot.end_time,
            next_sort,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "slots" })),
    })?;

    Ok(json!({
        "slotId": slot_id,
        "timetableId": timetable_id,
        "day": slot.day.as_str(),
        "subjectId": slot.subject_id,
        "startTime": slot.start_time,
        "endTime": slot.end_time,
        "sortOrder": next_sort
    }))
}

fn timetables_remove_slot(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let slot_id = get_required_str(params, "slotId")?;
    let removed = conn
        .execute("DELETE FROM slots WHERE id = ?", [&slot_id])
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "slots" })),
        })?;
    if removed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "slot not found".to_string(),
            details: Some(json!({ "slotId": slot_id })),
        });
    }
    Ok(json!({ "ok": true }))
}

// Draft -> Active. Every other timetable drops back to Draft inside the
// same transaction, so a concurrent reader never observes two active
// timetables, nor zero mid-transition.
fn timetables_activate(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let timetable_id = get_required_str(params, "timetableId")?;
    let Some(timetable) = load_timetable(conn, &timetable_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "timetable not found".to_string(),
            details: Some(json!({ "timetableId": timetable_id })),
        });
    };
    if timetable.archived {
        return Err(HandlerErr {
            code: "invalid_state",
            message: "archived timetables cannot be activated".to_string(),
            details: Some(json!({ "timetableId": timetable.id })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute("UPDATE timetables SET active = 0 WHERE id != ?", [&timetable_id])
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "timetables" })),
        })?;
    tx.execute(
        "UPDATE timetables SET active = 1 WHERE id = ?",
        [&timetable_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "timetables" })),
    })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "timetableId": timetable_id, "active": true }))
}

// Terminal state. An active timetable loses its active flag in the same
// transition; there is no un-archive.
fn timetables_archive(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let timetable_id = get_required_str(params, "timetableId")?;
    let Some(_) = load_timetable(conn, &timetable_id)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "timetable not found".to_string(),
            details: Some(json!({ "timetableId": timetable_id })),
        });
    };

    conn.execute(
        "UPDATE timetables SET archived = 1, active = 0 WHERE id = ?",
        [&timetable_id],
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "timetables" })),
    })?;

    Ok(json!({ "timetableId": timetable_id, "archived": true, "active": false }))
}

fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
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
        "timetables.list" => Some(with_db(state, req, |conn, _| timetables_list(conn))),
        "timetables.create" => Some(with_db(state, req, timetables_create)),
        "timetables.addSlot" => Some(with_db(state, req, timetables_add_slot)),
        "timetables.removeSlot" => Some(with_db(state, req, timetables_remove_slot)),
        "timetables.activate" => Some(with_db(state, req, timetables_activate)),
        "timetables.archive" => Some(with_db(state, req, timetables_archive)),
        _ => None,
    }
}
