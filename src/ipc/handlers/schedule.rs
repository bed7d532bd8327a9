use crate::engine::{self, DayOfWeek, Slot, Subject, Timetable};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

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

fn load_subjects(conn: &Connection) -> Result<Vec<Subject>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name, archived FROM subjects ORDER BY name")
        .map_err(HandlerErr::db)?;
    stmt.query_map([], |r| {
        Ok(Subject {
            id: r.get(0)?,
            name: r.get(1)?,
            archived: r.get::<_, i64>(2)? != 0,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::db)
}

fn load_timetables(conn: &Connection) -> Result<Vec<Timetable>, HandlerErr> {
    let mut tt_stmt = conn
        .prepare("SELECT id, name, active, archived FROM timetables ORDER BY name")
        .map_err(HandlerErr::db)?;
    let shells: Vec<Timetable> = tt_stmt
        .query_map([], |r| {
            Ok(Timetable {
                id: r.get(0)?,
                name: r.get(1)?,
                active: r.get::<_, i64>(2)? != 0,
                archived: r.get::<_, i64>(3)? != 0,
                slots: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut slot_stmt = conn
        .prepare(
            "SELECT id, day, subject_id, start_time, end_time, sort_order
             FROM slots
             WHERE timetable_id = ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::db)?;
    let mut out = Vec::with_capacity(shells.len());
    for mut t in shells {
        let slots: Vec<Slot> = slot_stmt
            .query_map([&t.id], |r| {
                let day_raw: String = r.get(1)?;
                // Slot writes validate the day, so a bad value here means
                // the row was corrupted; fail the query rather than guess.
                let day = DayOfWeek::parse(&day_raw).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        format!("unknown day: {}", day_raw).into(),
                    )
                })?;
                Ok(Slot {
                    id: r.get(0)?,
                    day,
                    subject_id: r.get(2)?,
                    start_time: r.get(3)?,
                    end_time: r.get(4)?,
                    sort_order: r.get(5)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?;
        t.slots = slots;
        out.push(t);
    }
    Ok(out)
}

/// Which subjects are due on a date (today by default). The resolver is
/// pure; this handler only fetches its inputs and reports which policy
/// produced the result.
fn schedule_day(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let date = match params.get("date").and_then(|v| v.as_str()) {
        Some(d) => d.to_string(),
        None => engine::today(),
    };
    let day = engine::day_of_week(&date).map_err(|e| HandlerErr {
        code: "invalid_date",
        message: e.message,
        details: e.details,
    })?;

    let subjects = load_subjects(conn)?;
    let timetables = load_timetables(conn)?;
    let has_active = timetables.iter().any(|t| t.active && !t.archived);
    let scheduled =
        engine::scheduled_subjects(&date, &subjects, &timetables).map_err(|e| HandlerErr {
            code: "invalid_date",
            message: e.message,
            details: e.details,
        })?;

    let subjects_json: Vec<serde_json::Value> = scheduled
        .iter()
        .map(|s| json!({ "id": s.id, "name": s.name }))
        .collect();
    Ok(json!({
        "date": date,
        "day": day,
        "source": if has_active { "timetable" } else { "fallback" },
        "subjects": subjects_json
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method.as_str() != "schedule.day" {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    Some(match schedule_day(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    })
}
