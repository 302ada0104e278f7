//! Quiz Module
//!
//! The business layer served by data nodes: users with instructor or
//! student roles, multiple-choice questions, and one answer per student
//! per question.

pub mod auth;
mod protocol;
mod service;

pub use protocol::{FailureCode, Notification, QuestionView, Request, Response, Role, ServerFrame};
pub use service::{apply, Session, SessionUser};

/// Application tables of a data node store
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    salt TEXT NOT NULL,
    digest TEXT NOT NULL,
    role TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS questions (
    id INTEGER PRIMARY KEY,
    author_id INTEGER NOT NULL REFERENCES users(id),
    prompt TEXT NOT NULL,
    choices TEXT NOT NULL,
    correct INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS answers (
    question_id INTEGER NOT NULL REFERENCES questions(id),
    student_id INTEGER NOT NULL REFERENCES users(id),
    choice INTEGER NOT NULL,
    correct INTEGER NOT NULL,
    answered_at TEXT NOT NULL,
    PRIMARY KEY (question_id, student_id)
);
"#;
