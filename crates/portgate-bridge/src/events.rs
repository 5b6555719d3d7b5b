//! Control events surfaced by the bridge

use crate::link::BoxedStream;
use portgate_proto::Tunnel;
use std::fmt;
use std::net::SocketAddr;

pub enum BridgeEvent {
    /// A client asked for a task to be served
    OpenTask(Tunnel),
    /// A client withdrew a task
    CloseTask(Tunnel),
    /// A client's control connection is gone
    CloseClient(i64),
    /// An already authenticated stream presenting a secret-mode password
    Secret(SecretSession),
}

/// Inbound secret-mode stream, matched to a task by password digest
pub struct SecretSession {
    /// Lowercase hex MD5 of the presented password
    pub password_md5: String,
    pub stream: BoxedStream,
    pub remote_addr: Option<SocketAddr>,
}

impl SecretSession {
    pub fn new(password_md5: impl Into<String>, stream: BoxedStream) -> Self {
        Self {
            password_md5: password_md5.into(),
            stream,
            remote_addr: None,
        }
    }
}

impl fmt::Debug for SecretSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretSession")
            .field("password_md5", &self.password_md5)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for BridgeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeEvent::OpenTask(task) => write!(f, "OpenTask({})", task.id),
            BridgeEvent::CloseTask(task) => write!(f, "CloseTask({})", task.id),
            BridgeEvent::CloseClient(id) => write!(f, "CloseClient({})", id),
            BridgeEvent::Secret(session) => write!(f, "Secret({:?})", session),
        }
    }
}
