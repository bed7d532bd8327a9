use chrono::{Datelike, Local, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Attendance percentage at or above this is "safe"; below is "risk".
pub const SAFE_THRESHOLD: i64 = 75;

/// Chapters whose priority score exceeds this surface in the attention list.
pub const ATTENTION_THRESHOLD: i64 = 40;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

/// Round-half-up to the nearest integer: `Int(x + 0.5)`.
/// Used for attendance percentages and chapter progress/priority alike;
/// the recovery prediction simulates with exactly this rule.
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EngineError {
    pub fn with_details(code: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl DayOfWeek {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sunday" => Some(Self::Sunday),
            "monday" => Some(Self::Monday),
            "tuesday" => Some(Self::Tuesday),
            "wednesday" => Some(Self::Wednesday),
            "thursday" => Some(Self::Thursday),
            "friday" => Some(Self::Friday),
            "saturday" => Some(Self::Saturday),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sunday => "sunday",
            Self::Monday => "monday",
            Self::Tuesday => "tuesday",
            Self::Wednesday => "wednesday",
            Self::Thursday => "thursday",
            Self::Friday => "friday",
            Self::Saturday => "saturday",
        }
    }
}

impl From<Weekday> for DayOfWeek {
    fn from(w: Weekday) -> Self {
        match w {
            Weekday::Sun => Self::Sunday,
            Weekday::Mon => Self::Monday,
            Weekday::Tue => Self::Tuesday,
            Weekday::Wed => Self::Wednesday,
            Weekday::Thu => Self::Thursday,
            Weekday::Fri => Self::Friday,
            Weekday::Sat => Self::Saturday,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Cancelled,
    Extra,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "cancelled" => Some(Self::Cancelled),
            "extra" => Some(Self::Extra),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Cancelled => "cancelled",
            Self::Extra => "extra",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Safe,
    Risk,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub archived: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: String,
    pub day: DayOfWeek,
    pub subject_id: String,
    pub start_time: String,
    pub end_time: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timetable {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub archived: bool,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub subject_id: String,
    pub date: String,
    pub status: AttendanceStatus,
    pub locked: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub total: i64,
    pub present: i64,
    pub percent: i64,
    pub zone: Zone,
    #[serde(rename = "classesNeededFor75")]
    pub classes_needed_for_75: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    pub name: String,
    pub theory_progress: i64,
    pub practice_progress: i64,
    pub weightage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttentionChapter {
    pub exam_id: String,
    pub exam_name: String,
    pub subject_id: String,
    pub chapter_id: String,
    pub chapter_name: String,
    pub overall_progress: i64,
    pub priority_score: i64,
}

/// Today's date on the local calendar, `YYYY-MM-DD`. Local rather than
/// UTC: a user east of Greenwich marking attendance at 00:30 is marking
/// today, not yesterday.
pub fn today() -> String {
    Local::now().date_naive().format(DATE_FORMAT).to_string()
}

pub fn parse_date(date: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|_| {
        EngineError::with_details(
            "invalid_date",
            format!("date must be YYYY-MM-DD, got {:?}", date),
            serde_json::json!({ "date": date }),
        )
    })
}

pub fn day_of_week(date: &str) -> Result<DayOfWeek, EngineError> {
    Ok(parse_date(date)?.weekday().into())
}

/// A slot time must be a zero-padded 24-hour `HH:mm` string.
pub fn parse_time(time: &str) -> Result<NaiveTime, EngineError> {
    let well_formed = time.len() == 5 && time.as_bytes()[2] == b':';
    if !well_formed {
        return Err(EngineError::with_details(
            "validation_error",
            format!("time must be HH:mm, got {:?}", time),
            serde_json::json!({ "time": time }),
        ));
    }
    NaiveTime::parse_from_str(time, TIME_FORMAT).map_err(|_| {
        EngineError::with_details(
            "validation_error",
            format!("time must be HH:mm, got {:?}", time),
            serde_json::json!({ "time": time }),
        )
    })
}

/// A slot must have positive duration.
pub fn validate_slot_times(start_time: &str, end_time: &str) -> Result<(), EngineError> {
    let start = parse_time(start_time)?;
    let end = parse_time(end_time)?;
    if start >= end {
        return Err(EngineError::with_details(
            "validation_error",
            "startTime must be before endTime",
            serde_json::json!({ "startTime": start_time, "endTime": end_time }),
        ));
    }
    Ok(())
}

/// Resolves which subjects are scheduled on `date`.
///
/// With an active non-archived timetable: the subjects its slots
/// reference on that weekday, ordered by slot start time (insertion
/// order on ties), each subject once even when double-booked, archived
/// subjects excluded. Without one: every non-archived subject — a user
/// with no timetable still sees everything as due.
pub fn scheduled_subjects(
    date: &str,
    subjects: &[Subject],
    timetables: &[Timetable],
) -> Result<Vec<Subject>, EngineError> {
    let day = day_of_week(date)?;

    let Some(active) = timetables.iter().find(|t| t.active && !t.archived) else {
        return Ok(subjects.iter().filter(|s| !s.archived).cloned().collect());
    };

    let mut day_slots: Vec<&Slot> = active.slots.iter().filter(|s| s.day == day).collect();
    day_slots.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then(a.sort_order.cmp(&b.sort_order))
    });

    let mut seen: HashSet<&str> = HashSet::new();
    let mut out: Vec<Subject> = Vec::new();
    for slot in day_slots {
        if !seen.insert(slot.subject_id.as_str()) {
            continue;
        }
        // A slot may reference a subject archived after the timetable
        // was built; such slots resolve to nothing.
        if let Some(subject) = subjects
            .iter()
            .find(|s| s.id == slot.subject_id && !s.archived)
        {
            out.push(subject.clone());
        }
    }
    Ok(out)
}

fn percent_of(present: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    round_half_up(100.0 * present as f64 / total as f64)
}

/// Smallest number of additional consecutive present classes needed to
/// reach the safe threshold. Simulated step by step under the same
/// rounding rule as the displayed percentage; a closed form diverges
/// from this at boundary percentages, so the loop is the contract.
pub fn classes_needed_for_75(total: i64, present: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    let mut total = total;
    let mut present = present;
    let mut needed = 0;
    while percent_of(present, total) < SAFE_THRESHOLD {
        total += 1;
        present += 1;
        needed += 1;
    }
    needed
}

/// Aggregates a record set into the attendance summary. Subject-agnostic:
/// callers filter by subject for per-subject figures and pass the full
/// set for the overall one.
pub fn summarize(records: &[AttendanceRecord]) -> AttendanceSummary {
    let total = records.len() as i64;
    let present = records
        .iter()
        .filter(|r| r.status == AttendanceStatus::Present)
        .count() as i64;
    let percent = percent_of(present, total);
    let zone = if percent >= SAFE_THRESHOLD {
        Zone::Safe
    } else {
        Zone::Risk
    };
    AttendanceSummary {
        total,
        present,
        percent,
        zone,
        classes_needed_for_75: classes_needed_for_75(total, present),
    }
}

pub fn overall_progress(chapter: &Chapter) -> i64 {
    round_half_up((chapter.theory_progress + chapter.practice_progress) as f64 / 2.0)
}

/// Low completion times high weightage; zero weightage pins the score
/// to zero regardless of completion.
pub fn priority_score(chapter: &Chapter) -> i64 {
    let remaining = 100 - overall_progress(chapter);
    round_half_up(remaining as f64 * chapter.weightage)
}

pub fn validate_progress_value(value: i64) -> Result<(), EngineError> {
    if !(0..=100).contains(&value) {
        return Err(EngineError::with_details(
            "validation_error",
            "progress must be between 0 and 100",
            serde_json::json!({ "value": value }),
        ));
    }
    Ok(())
}

pub fn validate_weightage(value: f64) -> Result<(), EngineError> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::with_details(
            "validation_error",
            "weightage must be a non-negative number",
            serde_json::json!({ "value": value }),
        ));
    }
    Ok(())
}

/// Chapters needing attention across all exams, highest priority first.
/// Input order is preserved on equal scores.
pub fn attention_chapters(
    input: &[(String, String, String, Chapter)],
) -> Vec<AttentionChapter> {
    let mut out: Vec<AttentionChapter> = input
        .iter()
        .filter_map(|(exam_id, exam_name, subject_id, chapter)| {
            let score = priority_score(chapter);
            if score <= ATTENTION_THRESHOLD {
                return None;
            }
            Some(AttentionChapter {
                exam_id: exam_id.clone(),
                exam_name: exam_name.clone(),
                subject_id: subject_id.clone(),
                chapter_id: chapter.id.clone(),
                chapter_name: chapter.name.clone(),
                overall_progress: overall_progress(chapter),
                priority_score: score,
            })
        })
        .collect();
    out.sort_by(|a, b| b.priority_score.cmp(&a.priority_score));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subject_id: &str, date: &str, status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            id: format!("{}-{}", subject_id, date),
            subject_id: subject_id.to_string(),
            date: date.to_string(),
            status,
            locked: true,
            created_at: "2024-03-01T08:00:00Z".to_string(),
        }
    }

    fn subject(id: &str, archived: bool) -> Subject {
        Subject {
            id: id.to_string(),
            name: id.to_uppercase(),
            archived,
        }
    }

    fn slot(id: &str, day: DayOfWeek, subject_id: &str, start: &str, sort_order: i64) -> Slot {
        Slot {
            id: id.to_string(),
            day,
            subject_id: subject_id.to_string(),
            start_time: start.to_string(),
            end_time: "23:00".to_string(),
            sort_order,
        }
    }

    #[test]
    fn round_half_up_at_boundaries() {
        assert_eq!(round_half_up(0.0), 0);
        assert_eq!(round_half_up(74.5), 75);
        assert_eq!(round_half_up(74.4999), 74);
        assert_eq!(round_half_up(99.5), 100);
    }

    #[test]
    fn day_of_week_known_dates() {
        assert_eq!(day_of_week("2024-03-04").unwrap(), DayOfWeek::Monday);
        assert_eq!(day_of_week("2024-03-05").unwrap(), DayOfWeek::Tuesday);
        assert_eq!(day_of_week("2024-03-10").unwrap(), DayOfWeek::Sunday);
    }

    #[test]
    fn malformed_dates_are_invalid_date() {
        for bad in ["2024-3-4", "04-03-2024", "yesterday", ""] {
            let e = day_of_week(bad).unwrap_err();
            assert_eq!(e.code, "invalid_date", "{:?}", bad);
        }
    }

    #[test]
    fn slot_times_validated() {
        assert!(validate_slot_times("09:00", "10:30").is_ok());
        assert_eq!(
            validate_slot_times("10:30", "09:00").unwrap_err().code,
            "validation_error"
        );
        assert_eq!(
            validate_slot_times("09:00", "09:00").unwrap_err().code,
            "validation_error"
        );
        assert_eq!(
            validate_slot_times("9:00", "10:00").unwrap_err().code,
            "validation_error"
        );
    }

    #[test]
    fn summarize_three_of_four_present_is_exactly_safe() {
        let records = vec![
            record("cs101", "2024-03-01", AttendanceStatus::Present),
            record("cs101", "2024-03-04", AttendanceStatus::Present),
            record("cs101", "2024-03-05", AttendanceStatus::Absent),
            record("cs101", "2024-03-06", AttendanceStatus::Present),
        ];
        let s = summarize(&records);
        assert_eq!(s.total, 4);
        assert_eq!(s.present, 3);
        assert_eq!(s.percent, 75);
        assert_eq!(s.zone, Zone::Safe);
        assert_eq!(s.classes_needed_for_75, 0);
    }

    #[test]
    fn summarize_empty_is_zero_and_risk_free_prediction() {
        let s = summarize(&[]);
        assert_eq!(s.total, 0);
        assert_eq!(s.present, 0);
        assert_eq!(s.percent, 0);
        assert_eq!(s.classes_needed_for_75, 0);
    }

    #[test]
    fn cancelled_and_extra_count_toward_total_not_present() {
        let records = vec![
            record("m", "2024-03-01", AttendanceStatus::Present),
            record("m", "2024-03-04", AttendanceStatus::Cancelled),
            record("m", "2024-03-05", AttendanceStatus::Extra),
        ];
        let s = summarize(&records);
        assert_eq!(s.total, 3);
        assert_eq!(s.present, 1);
        assert_eq!(s.percent, 33);
        assert_eq!(s.zone, Zone::Risk);
    }

    #[test]
    fn percent_bounds_and_zone_consistency() {
        for total in 0..30_i64 {
            for present in 0..=total {
                let p = percent_of(present, total);
                assert!((0..=100).contains(&p));
                let records: Vec<AttendanceRecord> = (0..total)
                    .map(|i| {
                        let status = if i < present {
                            AttendanceStatus::Present
                        } else {
                            AttendanceStatus::Absent
                        };
                        record("s", &format!("2024-01-{:02}", i + 1), status)
                    })
                    .collect();
                let s = summarize(&records);
                assert_eq!(s.zone == Zone::Safe, s.percent >= 75);
            }
        }
    }

    #[test]
    fn prediction_is_minimal() {
        for total in 1..40_i64 {
            for present in 0..=total {
                let n = classes_needed_for_75(total, present);
                assert!(n >= 0);
                assert!(percent_of(present + n, total + n) >= 75);
                if n > 0 {
                    assert!(percent_of(present + n - 1, total + n - 1) < 75);
                }
            }
        }
    }

    #[test]
    fn prediction_zero_case() {
        assert_eq!(classes_needed_for_75(0, 0), 0);
    }

    #[test]
    fn resolver_falls_back_to_all_subjects_without_active_timetable() {
        let subjects = vec![subject("math", false), subject("physics", false)];
        let got = scheduled_subjects("2024-03-04", &subjects, &[]).unwrap();
        assert_eq!(got.len(), 2);

        // A draft (inactive) timetable does not change the fallback.
        let draft = Timetable {
            id: "t1".to_string(),
            name: "Draft".to_string(),
            active: false,
            archived: false,
            slots: vec![slot("s1", DayOfWeek::Monday, "math", "09:00", 0)],
        };
        let got = scheduled_subjects("2024-03-04", &subjects, &[draft]).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn resolver_matches_weekday_only() {
        let subjects = vec![subject("math", false), subject("physics", false)];
        let timetable = Timetable {
            id: "t1".to_string(),
            name: "Term".to_string(),
            active: true,
            archived: false,
            slots: vec![slot("s1", DayOfWeek::Monday, "physics", "09:00", 0)],
        };
        let monday = scheduled_subjects("2024-03-04", &subjects, &[timetable.clone()]).unwrap();
        assert_eq!(monday.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), ["physics"]);
        let tuesday = scheduled_subjects("2024-03-05", &subjects, &[timetable]).unwrap();
        assert!(tuesday.is_empty());
    }

    #[test]
    fn resolver_orders_by_start_time_and_dedupes() {
        let subjects = vec![
            subject("math", false),
            subject("physics", false),
            subject("chem", false),
        ];
        let timetable = Timetable {
            id: "t1".to_string(),
            name: "Term".to_string(),
            active: true,
            archived: false,
            slots: vec![
                slot("s1", DayOfWeek::Monday, "chem", "11:00", 0),
                slot("s2", DayOfWeek::Monday, "math", "09:00", 1),
                // Double-booked subject: appears once, at its earliest slot.
                slot("s3", DayOfWeek::Monday, "math", "14:00", 2),
                slot("s4", DayOfWeek::Monday, "physics", "10:00", 3),
            ],
        };
        let got = scheduled_subjects("2024-03-04", &subjects, &[timetable]).unwrap();
        assert_eq!(
            got.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            ["math", "physics", "chem"]
        );
    }

    #[test]
    fn resolver_excludes_archived_subjects_even_when_slotted() {
        let subjects = vec![subject("math", false), subject("latin", true)];
        let timetable = Timetable {
            id: "t1".to_string(),
            name: "Term".to_string(),
            active: true,
            archived: false,
            slots: vec![
                slot("s1", DayOfWeek::Monday, "latin", "08:00", 0),
                slot("s2", DayOfWeek::Monday, "math", "09:00", 1),
            ],
        };
        let got = scheduled_subjects("2024-03-04", &subjects, &[timetable]).unwrap();
        assert_eq!(got.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), ["math"]);
    }

    fn chapter(theory: i64, practice: i64, weightage: f64) -> Chapter {
        Chapter {
            id: "ch".to_string(),
            name: "Chapter".to_string(),
            theory_progress: theory,
            practice_progress: practice,
            weightage,
        }
    }

    #[test]
    fn chapter_progress_and_priority() {
        let c = chapter(20, 20, 1.0);
        assert_eq!(overall_progress(&c), 20);
        assert_eq!(priority_score(&c), 80);

        // Odd sums round half up.
        assert_eq!(overall_progress(&chapter(50, 51, 1.0)), 51);
    }

    #[test]
    fn zero_weightage_is_deprioritized() {
        let c = chapter(0, 0, 0.0);
        assert_eq!(priority_score(&c), 0);
    }

    #[test]
    fn attention_filters_and_sorts_descending() {
        let input = vec![
            ("e1".to_string(), "Finals".to_string(), "math".to_string(), chapter(20, 20, 1.0)), // 80
            ("e1".to_string(), "Finals".to_string(), "math".to_string(), chapter(80, 80, 1.0)), // 20: out
            ("e1".to_string(), "Finals".to_string(), "chem".to_string(), chapter(0, 0, 2.0)),   // 200
            ("e2".to_string(), "Midterm".to_string(), "chem".to_string(), chapter(60, 60, 1.0)), // 40: not > 40
        ];
        let got = attention_chapters(&input);
        assert_eq!(
            got.iter().map(|c| c.priority_score).collect::<Vec<_>>(),
            [200, 80]
        );
        assert_eq!(got[0].subject_id, "chem");
    }

    #[test]
    fn today_is_well_formed() {
        let t = today();
        assert!(parse_date(&t).is_ok());
    }
}
