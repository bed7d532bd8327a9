pub mod attendance;
pub mod backup_exchange;
pub mod core;
pub mod exams;
pub mod schedule;
pub mod subjects;
pub mod timetables;
