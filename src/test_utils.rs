//! In-memory collaborators for unit tests.

use crate::audience::Destination;
use crate::broker::{BrokerError, MessageHeaders, Publisher};
use crate::event::{Member, Project, ProjectStatus, Role, User};
use crate::fetcher::{FetchError, RecordFetcher};
use crate::notification::SlackMessage;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn member(user_id: i64, role: Role, is_primary: bool) -> Member {
    Member {
        user_id,
        role,
        is_primary,
    }
}

pub fn project(id: i64, members: Vec<Member>) -> Project {
    Project {
        id,
        name: format!("Project {id}"),
        description: Some("A test project".to_string()),
        status: ProjectStatus::Draft,
        members,
    }
}

pub fn user(id: i64, handle: &str) -> User {
    User {
        user_id: id,
        handle: handle.to_string(),
        first_name: Some("First".to_string()),
        last_name: Some("Last".to_string()),
    }
}

pub fn slack(text: &str) -> SlackMessage {
    SlackMessage {
        text: text.to_string(),
        attachments: vec![],
    }
}

#[derive(Debug, Clone)]
pub struct Published {
    pub destination: Destination,
    pub payload: Value,
    pub headers: Option<MessageHeaders>,
}

/// Records every publish; can be told to fail the next N publishes.
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<Published>>,
    failures: AtomicUsize,
}

impl RecordingPublisher {
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<Published> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        payload: &Value,
        headers: Option<&MessageHeaders>,
    ) -> Result<(), BrokerError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Command("injected publish failure".to_string()));
        }

        self.messages.lock().unwrap().push(Published {
            destination: destination.clone(),
            payload: payload.clone(),
            headers: headers.cloned(),
        });
        Ok(())
    }
}

/// Serves projects and users from maps; unknown ids answer 404.
#[derive(Default)]
pub struct StubFetcher {
    projects: HashMap<i64, Project>,
    users: HashMap<i64, User>,
    calls: AtomicUsize,
}

impl StubFetcher {
    pub fn with_project(mut self, project: Project) -> Self {
        self.projects.insert(project.id, project);
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.users.insert(user.user_id, user);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordFetcher for StubFetcher {
    async fn fetch_project(&self, id: i64) -> Result<Project, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.projects.get(&id).cloned().ok_or(FetchError::Status {
            url: format!("stub://projects/{id}"),
            status: StatusCode::NOT_FOUND,
        })
    }

    async fn fetch_user(&self, id: i64) -> Result<User, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.users.get(&id).cloned().ok_or(FetchError::Status {
            url: format!("stub://users/{id}"),
            status: StatusCode::NOT_FOUND,
        })
    }
}
