//! Quiz Request Handling
//!
//! Executes one request against a locked store. Mutations are expressed as
//! parameterised statements with every nondeterministic value (ids, salts,
//! timestamps) computed here and bound, so replaying them on a backup
//! reproduces the primary's rows exactly.

use rusqlite::{params, OptionalExtension};

use super::auth;
use super::protocol::{FailureCode, QuestionView, Request, Response, Role};
use crate::error::{Error, Result};
use crate::replication::{ReplicaLogEntry, SqlStatement};
use crate::store::StoreGuard;

/// Authenticated user of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub user_id: i64,
    pub username: String,
    pub role: Role,
}

/// Per-connection session state on the server
#[derive(Debug, Default)]
pub struct Session {
    pub user: Option<SessionUser>,
}

/// Apply one request. Returns the response and, for a committed mutation,
/// the entry to replicate.
pub fn apply(store: &mut StoreGuard<'_>, session: &mut Session, request: Request) -> (Response, Option<ReplicaLogEntry>) {
    let result = match request {
        Request::Ping => store.version().map(|version| (Response::Pong { version }, None)),
        Request::SignUp { username, password, role } => sign_up(store, &username, &password, role),
        Request::Login { username, password } => login(store, session, &username, &password).map(|r| (r, None)),
        Request::Logout => {
            session.user = None;
            Ok((Response::LoggedOut, None))
        }
        Request::CreateQuestion { prompt, choices, correct } => {
            create_question(store, session, prompt, choices, correct)
        }
        Request::ListQuestions => list_questions(store, session).map(|r| (r, None)),
        Request::SubmitAnswer { question_id, choice } => submit_answer(store, session, question_id, choice),
    };

    match result {
        Ok(outcome) => outcome,
        Err(Error::Conflict(message)) => (Response::failure(FailureCode::Conflict, message), None),
        Err(e) => {
            tracing::error!("Request failed: {}", e);
            (Response::failure(FailureCode::Internal, e.to_string()), None)
        }
    }
}

type Outcome = (Response, Option<ReplicaLogEntry>);

fn refuse(code: FailureCode, message: impl Into<String>) -> Result<Outcome> {
    Ok((Response::failure(code, message), None))
}

fn require(session: &Session, role: Role) -> std::result::Result<&SessionUser, Response> {
    match session.user {
        None => Err(Response::failure(FailureCode::Unauthenticated, "login required")),
        Some(ref user) if user.role != role => Err(Response::failure(
            FailureCode::Forbidden,
            format!("only a {} may do this", role),
        )),
        Some(ref user) => Ok(user),
    }
}

fn next_id(store: &StoreGuard<'_>, table: &str) -> Result<i64> {
    let sql = format!("SELECT COALESCE(MAX(id), 0) + 1 FROM {}", table);
    Ok(store.connection().query_row(&sql, [], |row| row.get(0))?)
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn sign_up(store: &mut StoreGuard<'_>, username: &str, password: &str, role: Role) -> Result<Outcome> {
    let username = username.trim();
    if username.is_empty() || password.is_empty() {
        return refuse(FailureCode::Invalid, "username and password are required");
    }

    let user_id = next_id(store, "users")?;
    let salt = auth::new_salt();
    let digest = auth::digest(&salt, password);

    let committed = store.commit(vec![SqlStatement::new(
        "INSERT INTO users (id, username, salt, digest, role, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        vec![
            user_id.into(),
            username.into(),
            salt.into(),
            digest.into(),
            role.as_str().into(),
            now().into(),
        ],
    )])?;

    tracing::info!("Signed up {} as {}", username, role);
    Ok((Response::SignedUp { user_id }, Some(committed.entry)))
}

fn login(store: &StoreGuard<'_>, session: &mut Session, username: &str, password: &str) -> Result<Response> {
    let row: Option<(i64, String, String, String)> = store
        .connection()
        .query_row(
            "SELECT id, salt, digest, role FROM users WHERE username = ?1",
            params![username.trim()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let (user_id, role) = match row {
        Some((id, salt, digest, role)) if auth::verify(&salt, password, &digest) => (id, role),
        _ => return Ok(Response::failure(FailureCode::InvalidCredentials, "unknown user or wrong password")),
    };

    let role = Role::parse(&role).ok_or_else(|| Error::Store(format!("user {} has unknown role {}", user_id, role)))?;

    session.user = Some(SessionUser {
        user_id,
        username: username.trim().to_string(),
        role,
    });
    Ok(Response::LoggedIn {
        username: username.trim().to_string(),
        role,
    })
}

fn create_question(
    store: &mut StoreGuard<'_>,
    session: &Session,
    prompt: String,
    choices: Vec<String>,
    correct: u32,
) -> Result<Outcome> {
    let author_id = match require(session, Role::Instructor) {
        Ok(user) => user.user_id,
        Err(response) => return Ok((response, None)),
    };

    if prompt.trim().is_empty() || choices.len() < 2 {
        return refuse(FailureCode::Invalid, "a question needs a prompt and at least two choices");
    }
    if correct as usize >= choices.len() {
        return refuse(FailureCode::Invalid, format!("correct choice {} out of range", correct));
    }

    let question_id = next_id(store, "questions")?;
    let choices = serde_json::to_string(&choices).map_err(|e| Error::Internal(e.to_string()))?;

    let committed = store.commit(vec![SqlStatement::new(
        "INSERT INTO questions (id, author_id, prompt, choices, correct, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        vec![
            question_id.into(),
            author_id.into(),
            prompt.into(),
            choices.into(),
            (correct as i64).into(),
            now().into(),
        ],
    )])?;

    Ok((Response::QuestionCreated { question_id }, Some(committed.entry)))
}

fn list_questions(store: &StoreGuard<'_>, session: &Session) -> Result<Response> {
    let user = match session.user {
        Some(ref user) => user,
        None => return Ok(Response::failure(FailureCode::Unauthenticated, "login required")),
    };

    let mut stmt = store.connection().prepare(
        "SELECT q.id, q.prompt, q.choices, u.username, q.correct, a.choice
         FROM questions q
         JOIN users u ON u.id = q.author_id
         LEFT JOIN answers a ON a.question_id = q.id AND a.student_id = ?1
         ORDER BY q.id",
    )?;

    let rows = stmt.query_map(params![user.user_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, Option<i64>>(5)?,
        ))
    })?;

    let mut questions = Vec::new();
    for row in rows {
        let (id, prompt, choices, author, correct, answered) = row?;
        let choices: Vec<String> = serde_json::from_str(&choices)
            .map_err(|e| Error::Store(format!("question {} has malformed choices: {}", id, e)))?;

        questions.push(QuestionView {
            id,
            prompt,
            choices,
            author,
            correct: (user.role == Role::Instructor).then_some(correct as u32),
            answered: answered.map(|c| c as u32),
        });
    }

    Ok(Response::Questions(questions))
}

fn submit_answer(store: &mut StoreGuard<'_>, session: &Session, question_id: i64, choice: u32) -> Result<Outcome> {
    let student_id = match require(session, Role::Student) {
        Ok(user) => user.user_id,
        Err(response) => return Ok((response, None)),
    };

    let question: Option<(String, i64)> = store
        .connection()
        .query_row(
            "SELECT choices, correct FROM questions WHERE id = ?1",
            params![question_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (choices, correct) = match question {
        Some(q) => q,
        None => return refuse(FailureCode::NotFound, format!("no question {}", question_id)),
    };

    let count = serde_json::from_str::<Vec<String>>(&choices)
        .map_err(|e| Error::Store(format!("question {} has malformed choices: {}", question_id, e)))?
        .len();
    if choice as usize >= count {
        return refuse(FailureCode::Invalid, format!("choice {} out of range", choice));
    }

    let is_correct = choice as i64 == correct;
    let committed = store
        .commit(vec![SqlStatement::new(
            "INSERT INTO answers (question_id, student_id, choice, correct, answered_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            vec![
                question_id.into(),
                student_id.into(),
                (choice as i64).into(),
                is_correct.into(),
                now().into(),
            ],
        )])
        .map_err(|e| match e {
            Error::Conflict(_) => Error::Conflict(format!("question {} already answered", question_id)),
            other => other,
        })?;

    Ok((Response::AnswerRecorded { correct: is_correct }, Some(committed.entry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quiz::SCHEMA;
    use crate::store::Store;
    use tempfile::TempDir;

    fn sign_up_req(username: &str, role: Role) -> Request {
        Request::SignUp {
            username: username.to_string(),
            password: "secret".to_string(),
            role,
        }
    }

    fn login_req(username: &str) -> Request {
        Request::Login {
            username: username.to_string(),
            password: "secret".to_string(),
        }
    }

    fn open(dir: &TempDir, name: &str) -> Store {
        Store::open(dir.path().join(name), SCHEMA).unwrap()
    }

    #[tokio::test]
    async fn test_sign_up_and_login() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "quiz.db");
        let mut guard = store.lock().await;
        let mut session = Session::default();

        let (response, entry) = apply(&mut guard, &mut session, sign_up_req("ana", Role::Instructor));
        assert_eq!(response, Response::SignedUp { user_id: 1 });
        assert_eq!(entry.unwrap().version, 1);

        let (response, entry) = apply(&mut guard, &mut session, sign_up_req("ana", Role::Student));
        assert!(matches!(response, Response::Failure { code: FailureCode::Conflict, .. }));
        assert!(entry.is_none());
        assert_eq!(guard.version().unwrap(), 1);

        let wrong = Request::Login {
            username: "ana".into(),
            password: "nope".into(),
        };
        let (response, _) = apply(&mut guard, &mut session, wrong);
        assert!(matches!(response, Response::Failure { code: FailureCode::InvalidCredentials, .. }));
        assert!(session.user.is_none());

        let (response, entry) = apply(&mut guard, &mut session, login_req("ana"));
        assert!(entry.is_none());
        assert_eq!(
            response,
            Response::LoggedIn {
                username: "ana".into(),
                role: Role::Instructor
            }
        );
        assert_eq!(session.user.as_ref().unwrap().user_id, 1);
    }

    #[tokio::test]
    async fn test_roles_are_enforced() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "quiz.db");
        let mut guard = store.lock().await;
        let mut session = Session::default();

        let create = Request::CreateQuestion {
            prompt: "2 + 2?".into(),
            choices: vec!["3".into(), "4".into()],
            correct: 1,
        };

        let (response, _) = apply(&mut guard, &mut session, create.clone());
        assert!(matches!(response, Response::Failure { code: FailureCode::Unauthenticated, .. }));

        apply(&mut guard, &mut session, sign_up_req("bo", Role::Student));
        apply(&mut guard, &mut session, login_req("bo"));
        let (response, entry) = apply(&mut guard, &mut session, create);
        assert!(matches!(response, Response::Failure { code: FailureCode::Forbidden, .. }));
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn test_answer_once_per_question() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "quiz.db");
        let mut guard = store.lock().await;

        let mut instructor = Session::default();
        apply(&mut guard, &mut instructor, sign_up_req("ana", Role::Instructor));
        apply(&mut guard, &mut instructor, login_req("ana"));
        let (response, _) = apply(
            &mut guard,
            &mut instructor,
            Request::CreateQuestion {
                prompt: "Capital of France?".into(),
                choices: vec!["Lyon".into(), "Paris".into(), "Nice".into()],
                correct: 1,
            },
        );
        assert_eq!(response, Response::QuestionCreated { question_id: 1 });

        let mut student = Session::default();
        apply(&mut guard, &mut student, sign_up_req("bo", Role::Student));
        apply(&mut guard, &mut student, login_req("bo"));

        let (response, _) = apply(&mut guard, &mut student, Request::SubmitAnswer { question_id: 9, choice: 0 });
        assert!(matches!(response, Response::Failure { code: FailureCode::NotFound, .. }));

        let (response, _) = apply(&mut guard, &mut student, Request::SubmitAnswer { question_id: 1, choice: 5 });
        assert!(matches!(response, Response::Failure { code: FailureCode::Invalid, .. }));

        let (response, entry) = apply(&mut guard, &mut student, Request::SubmitAnswer { question_id: 1, choice: 1 });
        assert_eq!(response, Response::AnswerRecorded { correct: true });
        assert!(entry.is_some());

        let (response, entry) = apply(&mut guard, &mut student, Request::SubmitAnswer { question_id: 1, choice: 0 });
        assert!(matches!(response, Response::Failure { code: FailureCode::Conflict, .. }));
        assert!(entry.is_none());

        match apply(&mut guard, &mut student, Request::ListQuestions).0 {
            Response::Questions(questions) => {
                assert_eq!(questions.len(), 1);
                assert_eq!(questions[0].answered, Some(1));
                assert_eq!(questions[0].correct, None);
                assert_eq!(questions[0].author, "ana");
            }
            other => panic!("unexpected response {:?}", other),
        }

        match apply(&mut guard, &mut instructor, Request::ListQuestions).0 {
            Response::Questions(questions) => assert_eq!(questions[0].correct, Some(1)),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mutations_replay_identically() {
        let dir = TempDir::new().unwrap();
        let primary = open(&dir, "primary.db");
        let backup = open(&dir, "backup.db");

        let mut entries = Vec::new();
        {
            let mut guard = primary.lock().await;
            let mut session = Session::default();
            for request in [sign_up_req("ana", Role::Instructor), sign_up_req("bo", Role::Student)] {
                let (_, entry) = apply(&mut guard, &mut session, request);
                entries.push(entry.unwrap());
            }
        }

        for entry in &entries {
            backup.replay(entry).await.unwrap();
        }

        // Credentials created on the primary work against the backup copy
        let mut guard = backup.lock().await;
        let mut session = Session::default();
        let (response, _) = apply(&mut guard, &mut session, login_req("bo"));
        assert_eq!(
            response,
            Response::LoggedIn {
                username: "bo".into(),
                role: Role::Student
            }
        );
        assert_eq!(guard.version().unwrap(), 2);
    }
}
