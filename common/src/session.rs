//! Per-server SSH session ownership
//!
//! The [`SessionManager`] holds exactly one session slot per configured server. A worker obtains
//! exclusive use of a server's session by taking a [`SessionLease`]; while the lease is alive no
//! other worker can touch that session, so transfers to the same server are serialized and
//! cross-server transfers run in parallel.
//!
//! Session lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Degraded -> Disconnected
//! ```
//!
//! `Degraded` is entered through [`SessionLease::mark_degraded`] after a protocol-level failure;
//! the next [`SessionLease::acquire`] tears the session down and establishes a new one.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::instrument;

use crate::config::ServerProfile;
use crate::error::Error;
use crate::ssh::{RemoteSession, SshConnector, TransportTuning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

struct Slot {
    profile: Arc<ServerProfile>,
    state: SessionState,
    session: Option<Box<dyn RemoteSession>>,
    // authentication failures are final for the whole run
    auth_failure: Option<String>,
    connects: u64,
}

impl Slot {
    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        self.state = SessionState::Disconnected;
    }
}

pub struct SessionManager {
    connector: Arc<dyn SshConnector>,
    tuning: TransportTuning,
    slots: HashMap<String, Arc<tokio::sync::Mutex<Slot>>>,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn SshConnector>,
        tuning: TransportTuning,
        servers: &[Arc<ServerProfile>],
    ) -> Self {
        let slots = servers
            .iter()
            .map(|profile| {
                let slot = Slot {
                    profile: profile.clone(),
                    state: SessionState::Disconnected,
                    session: None,
                    auth_failure: None,
                    connects: 0,
                };
                (profile.name.clone(), Arc::new(tokio::sync::Mutex::new(slot)))
            })
            .collect();
        Self {
            connector,
            tuning,
            slots,
        }
    }

    fn slot(&self, server: &str) -> Result<&Arc<tokio::sync::Mutex<Slot>>, Error> {
        self.slots
            .get(server)
            .ok_or_else(|| Error::Config(format!("unknown server '{server}'")))
    }

    /// Waits for exclusive use of the server's session slot.
    pub async fn lease(&self, server: &str) -> Result<SessionLease, Error> {
        let guard = self.slot(server)?.clone().lock_owned().await;
        Ok(SessionLease {
            guard,
            connector: self.connector.clone(),
            tuning: self.tuning,
        })
    }

    pub async fn state(&self, server: &str) -> Result<SessionState, Error> {
        Ok(self.slot(server)?.lock().await.state)
    }

    /// Number of sessions successfully established for the server so far.
    pub async fn connections(&self, server: &str) -> Result<u64, Error> {
        Ok(self.slot(server)?.lock().await.connects)
    }

    /// Closes every open session.
    pub async fn disconnect_all(&self) {
        for (server, slot) in &self.slots {
            let mut guard = slot.clone().lock_owned().await;
            if guard.session.is_none() {
                continue;
            }
            tracing::debug!("closing session to '{server}'");
            if let Err(err) = tokio::task::spawn_blocking(move || guard.teardown()).await {
                tracing::warn!("failed closing session to '{server}': {err}");
            }
        }
    }
}

/// Exclusive access to one server's session slot.
pub struct SessionLease {
    guard: tokio::sync::OwnedMutexGuard<Slot>,
    connector: Arc<dyn SshConnector>,
    tuning: TransportTuning,
}

impl SessionLease {
    #[must_use]
    pub fn server(&self) -> &str {
        &self.guard.profile.name
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.guard.state
    }

    /// Returns a connected session, connecting first when needed.
    ///
    /// Blocking; call it from the blocking pool. An existing session is reused only if it is
    /// `Connected` and passes its health check. A remembered authentication failure is returned
    /// right away without contacting the server.
    #[instrument(skip(self), fields(server = %self.guard.profile.name))]
    pub fn acquire(&mut self) -> Result<&mut dyn RemoteSession, Error> {
        let slot = &mut *self.guard;
        if let Some(message) = &slot.auth_failure {
            return Err(Error::Auth {
                server: slot.profile.name.clone(),
                message: message.clone(),
            });
        }
        let healthy = slot.state == SessionState::Connected
            && slot.session.as_mut().is_some_and(|session| session.is_alive());
        if !healthy {
            let previous = slot.state;
            slot.teardown();
            slot.state = SessionState::Connecting;
            if slot.connects == 0 {
                tracing::info!("connecting to '{}'", slot.profile.name);
            } else {
                tracing::info!(
                    "reconnecting to '{}' (previous session {})",
                    slot.profile.name,
                    previous
                );
            }
            match self.connector.connect(&slot.profile, &self.tuning) {
                Ok(session) => {
                    slot.session = Some(session);
                    slot.state = SessionState::Connected;
                    slot.connects += 1;
                    tracing::debug!("session #{} established", slot.connects);
                }
                Err(err) => {
                    slot.state = SessionState::Disconnected;
                    if let Error::Auth { message, .. } = &err {
                        tracing::error!("authentication to '{}' failed: {message}", slot.profile.name);
                        slot.auth_failure = Some(message.clone());
                    } else {
                        tracing::warn!("connecting to '{}' failed: {err}", slot.profile.name);
                    }
                    return Err(err);
                }
            }
        }
        match slot.session.as_mut() {
            Some(session) => Ok(session.as_mut()),
            None => Err(Error::Protocol(format!(
                "no session available for '{}'",
                slot.profile.name
            ))),
        }
    }

    /// Forces the next [`SessionLease::acquire`] to establish a new session.
    pub fn mark_degraded(&mut self, err: &Error) {
        if self.guard.session.is_some() {
            tracing::warn!(
                "session to '{}' degraded after {} error: {err}",
                self.guard.profile.name,
                err.class()
            );
            self.guard.state = SessionState::Degraded;
        }
    }
}
