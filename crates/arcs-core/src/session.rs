//! Live session tracking.
//!
//! A session associates exactly one device-leg with zero or more
//! controller-legs under a server-minted identifier. A device-id has at
//! most one active session: a repeat authentication ADOPTS the existing
//! session (the new device-leg replaces the old one) rather than refusing.
//!
//! All operations are serialized under a single mutex; none of them block.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;

/// Connection identifier, minted by the connection handler.
pub type ConnId = String;

/// Session id alphabet: uppercase alphanumerics minus the confusable
/// 0/O and 1/I, so a code can be read over the phone.
const SESSION_ID_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a session id.
pub const SESSION_ID_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("maximum concurrent sessions reached ({0})")]
    MaxSessions(usize),
}

/// One live session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub device_id: String,
    pub device_conn: Option<ConnId>,
    pub controllers: Vec<ConnId>,
    pub device_info: Option<Value>,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub active: bool,
}

impl Session {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Result of `create_or_adopt`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub session_id: String,
    /// True when an existing live session for the device was adopted.
    pub adopted: bool,
    /// The device-leg the adopted session previously had, to be closed.
    pub replaced_device_conn: Option<ConnId>,
}

/// Tracks all live sessions.
pub struct SessionManager {
    inner: Mutex<HashMap<String, Session>>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    fn generate_id(sessions: &HashMap<String, Session>) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let id: String = (0..SESSION_ID_LEN)
                .map(|_| SESSION_ID_CHARSET[rng.gen_range(0..SESSION_ID_CHARSET.len())] as char)
                .collect();
            if !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Create a session for a device, or adopt its existing one.
    pub fn create_or_adopt(
        &self,
        device_id: &str,
        device_conn: ConnId,
    ) -> Result<CreateOutcome, SessionError> {
        let mut sessions = self.inner.lock();

        if let Some(session) = sessions
            .values_mut()
            .find(|s| s.device_id == device_id && s.active)
        {
            let replaced = session.device_conn.replace(device_conn);
            session.last_activity = Instant::now();
            return Ok(CreateOutcome {
                session_id: session.id.clone(),
                adopted: true,
                replaced_device_conn: replaced,
            });
        }

        if sessions.len() >= self.max_sessions {
            return Err(SessionError::MaxSessions(self.max_sessions));
        }

        let id = Self::generate_id(&sessions);
        let now = Instant::now();
        sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                device_id: device_id.to_string(),
                device_conn: Some(device_conn),
                controllers: Vec::new(),
                device_info: None,
                created_at: now,
                last_activity: now,
                active: true,
            },
        );
        Ok(CreateOutcome {
            session_id: id,
            adopted: false,
            replaced_device_conn: None,
        })
    }

    /// Attach a controller-leg. Fails if the session is missing or inactive.
    pub fn join(&self, session_id: &str, controller: ConnId) -> bool {
        let mut sessions = self.inner.lock();
        match sessions.get_mut(session_id) {
            Some(session) if session.active => {
                if !session.controllers.contains(&controller) {
                    session.controllers.push(controller);
                }
                session.last_activity = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Detach a controller-leg. The session stays alive.
    pub fn remove_controller(&self, session_id: &str, controller: &str) -> bool {
        let mut sessions = self.inner.lock();
        match sessions.get_mut(session_id) {
            Some(session) => {
                let before = session.controllers.len();
                session.controllers.retain(|c| c != controller);
                session.last_activity = Instant::now();
                session.controllers.len() != before
            }
            None => false,
        }
    }

    /// Update `last_activity`.
    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.inner.lock().get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    /// Record the device-supplied info blob for controller joins.
    pub fn set_device_info(&self, session_id: &str, info: Value) {
        if let Some(session) = self.inner.lock().get_mut(session_id) {
            session.device_info = Some(info);
        }
    }

    /// Remove a session, returning it for notification and audit.
    pub fn close(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().remove(session_id)
    }

    /// Remove every session idle longer than `idle_timeout`.
    pub fn sweep(&self, idle_timeout: Duration) -> Vec<Session> {
        let now = Instant::now();
        let mut sessions = self.inner.lock();
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| now.duration_since(s.last_activity) > idle_timeout)
            .map(|s| s.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| sessions.remove(id))
            .collect()
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.lock().get(session_id).cloned()
    }

    pub fn find_by_device(&self, device_id: &str) -> Option<String> {
        self.inner
            .lock()
            .values()
            .find(|s| s.device_id == device_id)
            .map(|s| s.id.clone())
    }

    pub fn find_by_controller(&self, controller: &str) -> Option<String> {
        self.inner
            .lock()
            .values()
            .find(|s| s.controllers.iter().any(|c| c == controller))
            .map(|s| s.id.clone())
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }
}
