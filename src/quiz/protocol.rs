//! Quiz Request Protocol
//!
//! Messages exchanged between `quizctl` sessions and data nodes over the
//! framed TCP connection.

use serde::{Deserialize, Serialize};

use crate::replication::Version;

/// Logical role of an authenticated user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Creates questions
    Instructor,
    /// Answers questions
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Instructor => "instructor",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "instructor" => Some(Role::Instructor),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    SignUp {
        username: String,
        password: String,
        role: Role,
    },
    Login {
        username: String,
        password: String,
    },
    Logout,
    CreateQuestion {
        prompt: String,
        choices: Vec<String>,
        correct: u32,
    },
    ListQuestions,
    SubmitAnswer {
        question_id: i64,
        choice: u32,
    },
}

impl Request {
    /// Does this request write to the store?
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Request::SignUp { .. } | Request::CreateQuestion { .. } | Request::SubmitAnswer { .. }
        )
    }

    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::SignUp { .. } => "SignUp",
            Request::Login { .. } => "Login",
            Request::Logout => "Logout",
            Request::CreateQuestion { .. } => "CreateQuestion",
            Request::ListQuestions => "ListQuestions",
            Request::SubmitAnswer { .. } => "SubmitAnswer",
        }
    }
}

/// Why a request failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    /// Uniqueness violation (username taken, question already answered)
    Conflict,
    Unauthenticated,
    /// Authenticated with the wrong role
    Forbidden,
    NotFound,
    InvalidCredentials,
    /// Mutation sent to a backup
    NotPrimary,
    /// Malformed arguments
    Invalid,
    /// Replication stalled; try again later
    Unavailable,
    Internal,
}

/// One question as presented to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionView {
    pub id: i64,
    pub prompt: String,
    pub choices: Vec<String>,
    pub author: String,
    /// Only shown to instructors
    pub correct: Option<u32>,
    /// The requesting student's earlier answer
    pub answered: Option<u32>,
}

/// Server response to exactly one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Pong { version: Version },
    SignedUp { user_id: i64 },
    LoggedIn { username: String, role: Role },
    LoggedOut,
    QuestionCreated { question_id: i64 },
    Questions(Vec<QuestionView>),
    AnswerRecorded { correct: bool },
    Failure { code: FailureCode, message: String },
}

impl Response {
    pub fn failure(code: FailureCode, message: impl Into<String>) -> Self {
        Response::Failure {
            code,
            message: message.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Response::Failure { .. })
    }
}

/// Out-of-band message from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// This node just became primary; writes are accepted again
    PrimaryRestored,
    /// Idle-connection keepalive
    Keepalive,
}

/// Server-to-client frame body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Response(Response),
    Notification(Notification),
}
