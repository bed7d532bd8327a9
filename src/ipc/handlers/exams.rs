use crate::engine::{self, Chapter};
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

fn chapter_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chapter> {
    Ok(Chapter {
        id: row.get(0)?,
        name: row.get(1)?,
        theory_progress: row.get(2)?,
        practice_progress: row.get(3)?,
        weightage: row.get(4)?,
    })
}

fn chapter_json(c: &Chapter) -> serde_json::Value {
    // overallProgress and priorityScore are derived on read, never stored.
    json!({
        "id": c.id,
        "name": c.name,
        "theoryProgress": c.theory_progress,
        "practiceProgress": c.practice_progress,
        "weightage": c.weightage,
        "overallProgress": engine::overall_progress(c),
        "priorityScore": engine::priority_score(c)
    })
}

fn exams_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut exam_stmt = conn
        .prepare("SELECT id, name, archived FROM exams WHERE archived = 0 ORDER BY name")
        .map_err(HandlerErr::db)?;
    let exams: Vec<(String, String, bool)> = exam_stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut es_stmt = conn
        .prepare(
            "SELECT id, subject_id, due_date FROM exam_subjects WHERE exam_id = ? ORDER BY rowid",
        )
        .map_err(HandlerErr::db)?;
    let mut ch_stmt = conn
        .prepare(
            "SELECT id, name, theory_progress, practice_progress, weightage
             FROM chapters
             WHERE exam_subject_id = ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::db)?;

    let mut exams_json = Vec::with_capacity(exams.len());
    for (exam_id, name, archived) in exams {
        let exam_subjects: Vec<(String, String, Option<String>)> = es_stmt
            .query_map([&exam_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?;

        let mut subjects_json = Vec::with_capacity(exam_subjects.len());
        for (es_id, subject_id, due_date) in exam_subjects {
            let chapters: Vec<Chapter> = ch_stmt
                .query_map([&es_id], |r| chapter_from_row(r))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db)?;
            subjects_json.push(json!({
                "examSubjectId": es_id,
                "subjectId": subject_id,
                "dueDate": due_date,
                "chapters": chapters.iter().map(chapter_json).collect::<Vec<_>>()
            }));
        }

        exams_json.push(json!({
            "id": exam_id,
            "name": name,
            "archived": archived,
            "subjects": subjects_json
        }));
    }

    Ok(json!({ "exams": exams_json }))
}

fn exams_create(
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

    let exam_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO exams(id, name, archived) VALUES(?, ?, 0)",
        (&exam_id, &name),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "exams" })),
    })?;

    Ok(json!({ "examId": exam_id, "name": name }))
}

fn exams_archive(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let updated = conn
        .execute("UPDATE exams SET archived = 1 WHERE id = ?", [&exam_id])
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "exams" })),
        })?;
    if updated == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam not found".to_string(),
            details: Some(json!({ "examId": exam_id })),
        });
    }
    Ok(json!({ "examId": exam_id, "archived": true }))
}

fn exams_add_subject(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let due_date = match params.get("dueDate").and_then(|v| v.as_str()) {
        Some(d) => {
            engine::parse_date(d)?;
            Some(d.to_string())
        }
        None => None,
    };

    let exam_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM exams WHERE id = ?", [&exam_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::db)?;
    if exam_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam not found".to_string(),
            details: Some(json!({ "examId": exam_id })),
        });
    }
    let subject_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if subject_exists.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: Some(json!({ "subjectId": subject_id })),
        });
    }

    // UNIQUE(exam_id, subject_id) does the duplicate check; a silently
    // ignored insert means the pair is already attached.
    let es_id = Uuid::new_v4().to_string();
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO exam_subjects(id, exam_id, subject_id, due_date) VALUES(?, ?, ?, ?)",
            (&es_id, &exam_id, &subject_id, &due_date),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "exam_subjects" })),
        })?;
    if inserted == 0 {
        return Err(HandlerErr {
            code: "duplicate_record",
            message: "subject is already attached to this exam".to_string(),
            details: Some(json!({ "examId": exam_id, "subjectId": subject_id })),
        });
    }

    Ok(json!({
        "examSubjectId": es_id,
        "examId": exam_id,
        "subjectId": subject_id,
        "dueDate": due_date
    }))
}

fn exams_add_chapter(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_subject_id = get_required_str(params, "examSubjectId")?;
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "validation_error",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }
    let weightage = params
        .get("weightage")
        .and_then(|v| v.as_f64())
        .unwrap_or(1.0);
    engine::validate_weightage(weightage)?;

    let parent: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM exam_subjects WHERE id = ?",
            [&exam_subject_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if parent.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "exam subject not found".to_string(),
            details: Some(json!({ "examSubjectId": exam_subject_id })),
        });
    }

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM chapters WHERE exam_subject_id = ?",
            [&exam_subject_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;
    let chapter_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO chapters(id, exam_subject_id, name, theory_progress, practice_progress, weightage, sort_order)
         VALUES(?, ?, ?, 0, 0, ?, ?)",
        (&chapter_id, &exam_subject_id, &name, weightage, next_sort),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "chapters" })),
    })?;

    let chapter = Chapter {
        id: chapter_id,
        name,
        theory_progress: 0,
        practice_progress: 0,
        weightage,
    };
    Ok(json!({ "chapter": chapter_json(&chapter) }))
}

fn exams_update_chapter_progress(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let chapter_id = get_required_str(params, "chapterId")?;

    let existing: Option<Chapter> = conn
        .query_row(
            "SELECT id, name, theory_progress, practice_progress, weightage
             FROM chapters WHERE id = ?",
            [&chapter_id],
            |r| chapter_from_row(r),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(mut chapter) = existing else {
        return Err(HandlerErr {
            code: "not_found",
            message: "chapter not found".to_string(),
            details: Some(json!({ "chapterId": chapter_id })),
        });
    };

    if let Some(v) = params.get("theoryProgress") {
        let Some(n) = v.as_i64() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "theoryProgress must be an integer".to_string(),
                details: None,
            });
        };
        engine::validate_progress_value(n)?;
        chapter.theory_progress = n;
    }
    if let Some(v) = params.get("practiceProgress") {
        let Some(n) = v.as_i64() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "practiceProgress must be an integer".to_string(),
                details: None,
            });
        };
        engine::validate_progress_value(n)?;
        chapter.practice_progress = n;
    }
    if let Some(v) = params.get("weightage") {
        let Some(n) = v.as_f64() else {
            return Err(HandlerErr {
                code: "bad_params",
                message: "weightage must be a number".to_string(),
                details: None,
            });
        };
        engine::validate_weightage(n)?;
        chapter.weightage = n;
    }

    conn.execute(
        "UPDATE chapters SET theory_progress = ?, practice_progress = ?, weightage = ? WHERE id = ?",
        (
            chapter.theory_progress,
            chapter.practice_progress,
            chapter.weightage,
            &chapter.id,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "chapters" })),
    })?;

    Ok(json!({ "chapter": chapter_json(&chapter) }))
}

fn exams_attention(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.name, es.subject_id,
                    c.id, c.name, c.theory_progress, c.practice_progress, c.weightage
             FROM chapters c
             JOIN exam_subjects es ON es.id = c.exam_subject_id
             JOIN exams e ON e.id = es.exam_id
             WHERE e.archived = 0
             ORDER BY e.name, es.rowid, c.sort_order",
        )
        .map_err(HandlerErr::db)?;
    let input: Vec<(String, String, String, Chapter)> = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                Chapter {
                    id: r.get(3)?,
                    name: r.get(4)?,
                    theory_progress: r.get(5)?,
                    practice_progress: r.get(6)?,
                    weightage: r.get(7)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let chapters = engine::attention_chapters(&input);
    Ok(json!({
        "threshold": engine::ATTENTION_THRESHOLD,
        "chapters": chapters
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
        "exams.list" => Some(with_db(state, req, |conn, _| exams_list(conn))),
        "exams.create" => Some(with_db(state, req, exams_create)),
        "exams.archive" => Some(with_db(state, req, exams_archive)),
        "exams.addSubject" => Some(with_db(state, req, exams_add_subject)),
        "exams.addChapter" => Some(with_db(state, req, exams_add_chapter)),
        "exams.updateChapterProgress" => {
            Some(with_db(state, req, exams_update_chapter_progress))
        }
        "exams.attention" => Some(with_db(state, req, |conn, _| exams_attention(conn))),
        _ => None,
    }
}
