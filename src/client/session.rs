//! Client Session State
//!
//! What a client remembers across transport reconnects: the credentials of
//! the last successful login, the role it granted, and the primary it was
//! talking to. Lives for the process only.

use crate::quiz::{Request, Response, Role};
use crate::replication::PrimaryEndpoint;

/// Credentials replayed after a reconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn login_request(&self) -> Request {
        Request::Login {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ClientSession {
    credentials: Option<Credentials>,
    role: Option<Role>,
    primary: Option<PrimaryEndpoint>,
}

impl ClientSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Role granted by the last login; `None` = unauthenticated
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.role.is_some()
    }

    /// Last primary a connection was established with
    pub fn primary(&self) -> Option<PrimaryEndpoint> {
        self.primary
    }

    pub fn set_primary(&mut self, primary: PrimaryEndpoint) {
        self.primary = Some(primary);
    }

    /// Update from one completed request/response exchange
    pub fn observe(&mut self, request: &Request, response: &Response) {
        match (request, response) {
            (Request::Login { username, password }, Response::LoggedIn { role, .. }) => {
                self.credentials = Some(Credentials {
                    username: username.clone(),
                    password: password.clone(),
                });
                self.role = Some(*role);
            }
            (Request::Logout, Response::LoggedOut) => self.forget(),
            _ => {}
        }
    }

    /// Drop cached credentials (explicit logout or rejected replay)
    pub fn forget(&mut self) {
        self.credentials = None;
        self.role = None;
    }
}
