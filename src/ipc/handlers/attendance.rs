use crate::engine::{self, AttendanceRecord, AttendanceStatus};
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

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let status_raw: String = row.get(3)?;
    Ok(AttendanceRecord {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        date: row.get(2)?,
        // Unknown stored statuses cannot occur: mark() is the only writer.
        status: AttendanceStatus::parse(&status_raw).unwrap_or(AttendanceStatus::Absent),
        locked: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

const RECORD_COLUMNS: &str = "id, subject_id, date, status, locked, created_at";

fn record_json(r: &AttendanceRecord) -> serde_json::Value {
    serde_json::to_value(r).unwrap_or_else(|_| json!({}))
}

/// Write-once marking. The `UNIQUE(subject_id, date)` constraint is the
/// duplicate check: `INSERT OR IGNORE` plus the changed-row count is a
/// single atomic uniqueness-check-and-insert, never check-then-write.
fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let status_raw = get_required_str(params, "status")?;
    let Some(status) = AttendanceStatus::parse(&status_raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("unknown status: {}", status_raw),
            details: Some(json!({ "status": status_raw })),
        });
    };

    let today = engine::today();
    let date = match params.get("date").and_then(|v| v.as_str()) {
        Some(d) => d.to_string(),
        None => today.clone(),
    };
    let parsed = engine::parse_date(&date).map_err(|e| HandlerErr {
        code: "invalid_date",
        message: e.message,
        details: e.details,
    })?;
    // Retroactive marking is fine; attendance cannot precede occurrence.
    let today_parsed = engine::parse_date(&today).map_err(|e| HandlerErr {
        code: "invalid_date",
        message: e.message,
        details: e.details,
    })?;
    if parsed > today_parsed {
        return Err(HandlerErr {
            code: "invalid_date",
            message: "cannot mark attendance for a future date".to_string(),
            details: Some(json!({ "date": date, "today": today })),
        });
    }

    if !subject_exists(conn, &subject_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: Some(json!({ "subjectId": subject_id })),
        });
    }

    let record_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().to_rfc3339();
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO attendance_records(id, subject_id, date, status, locked, created_at)
             VALUES(?, ?, ?, ?, 1, ?)",
            (&record_id, &subject_id, &date, status.as_str(), &created_at),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_records" })),
        })?;
    if inserted == 0 {
        return Err(HandlerErr {
            code: "duplicate_record",
            message: "attendance already marked for this subject and date".to_string(),
            details: Some(json!({ "subjectId": subject_id, "date": date })),
        });
    }

    let record = conn
        .query_row(
            &format!(
                "SELECT {} FROM attendance_records WHERE id = ?",
                RECORD_COLUMNS
            ),
            [&record_id],
            |r| record_from_row(r),
        )
        .map_err(HandlerErr::db)?;
    Ok(json!({ "record": record_json(&record) }))
}

/// Records are locked at creation; the only thing this method can do is
/// classify the failure. Callers wanting to fix a mistaken mark need an
/// explicit correction flow, which the engine deliberately does not offer.
fn attendance_set_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let record_id = get_required_str(params, "recordId")?;
    let existing: Option<String> = conn
        .query_row(
            "SELECT status FROM attendance_records WHERE id = ?",
            [&record_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    match existing {
        Some(status) => Err(HandlerErr {
            code: "record_locked",
            message: "attendance records are immutable once created".to_string(),
            details: Some(json!({ "recordId": record_id, "status": status })),
        }),
        None => Err(HandlerErr {
            code: "not_found",
            message: "attendance record not found".to_string(),
            details: Some(json!({ "recordId": record_id })),
        }),
    }
}

fn attendance_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = params.get("subjectId").and_then(|v| v.as_str());
    let from = params.get("from").and_then(|v| v.as_str());
    let to = params.get("to").and_then(|v| v.as_str());
    for d in [from, to].into_iter().flatten() {
        engine::parse_date(d).map_err(|e| HandlerErr {
            code: "invalid_date",
            message: e.message,
            details: e.details,
        })?;
    }

    let mut sql = format!(
        "SELECT {} FROM attendance_records WHERE 1=1",
        RECORD_COLUMNS
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(s) = subject_id {
        sql.push_str(" AND subject_id = ?");
        binds.push(s.to_string());
    }
    if let Some(f) = from {
        sql.push_str(" AND date >= ?");
        binds.push(f.to_string());
    }
    if let Some(t) = to {
        sql.push_str(" AND date <= ?");
        binds.push(t.to_string());
    }
    sql.push_str(" ORDER BY date, subject_id");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let records: Vec<AttendanceRecord> = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            record_from_row(r)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let records_json: Vec<serde_json::Value> = records.iter().map(record_json).collect();
    Ok(json!({ "records": records_json }))
}

/// Per-subject summaries plus the overall figure, one shared algorithm.
/// Archived subjects are out of analytics entirely; their ledger rows stay.
fn attendance_summary(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut subj_stmt = conn
        .prepare("SELECT id, name FROM subjects WHERE archived = 0 ORDER BY name")
        .map_err(HandlerErr::db)?;
    let subjects: Vec<(String, String)> = subj_stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut rec_stmt = conn
        .prepare(&format!(
            "SELECT {} FROM attendance_records r
             WHERE EXISTS (SELECT 1 FROM subjects s WHERE s.id = r.subject_id AND s.archived = 0)
             ORDER BY date",
            RECORD_COLUMNS
        ))
        .map_err(HandlerErr::db)?;
    let records: Vec<AttendanceRecord> = rec_stmt
        .query_map([], |r| record_from_row(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let per_subject: Vec<serde_json::Value> = subjects
        .iter()
        .map(|(id, name)| {
            let own: Vec<AttendanceRecord> = records
                .iter()
                .filter(|r| r.subject_id == *id)
                .cloned()
                .collect();
            let summary = engine::summarize(&own);
            json!({
                "subjectId": id,
                "name": name,
                "summary": summary
            })
        })
        .collect();

    let overall = engine::summarize(&records);
    Ok(json!({
        "subjects": per_subject,
        "overall": overall
    }))
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
        "attendance.mark" => Some(with_db(state, req, attendance_mark)),
        "attendance.setStatus" => Some(with_db(state, req, attendance_set_status)),
        "attendance.list" => Some(with_db(state, req, attendance_list)),
        "attendance.summary" => Some(with_db(state, req, attendance_summary)),
        _ => None,
    }
}
