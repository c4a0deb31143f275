//! Stable facade over a replaceable inbound session.
//!
//! Callers of an inbound controller keep one [`SessionHandle`] while the
//! fleet swaps the session behind it each time the controller reconnects.

use async_trait::async_trait;
use spcore_wire::{ConfigChange, DeviceActionRequest, Identification};
use std::collections::HashSet;
use std::sync::{Arc, RwLock, Weak};

use crate::controller::{read, write, ControllerSession};
use crate::observer::ControllerState;
use crate::SessionError;

pub(crate) struct HandleCell {
    id: u64,
    target: RwLock<Option<ControllerSession>>,
}

/// Forwards every operation to the session it currently targets
#[derive(Clone)]
pub struct SessionHandle {
    cell: Arc<HandleCell>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.cell.id)
            .field("target", &self.target().map(|session| session.id()))
            .finish()
    }
}

impl SessionHandle {
    /// Handle targeting `session`
    pub fn new(id: u64, session: ControllerSession) -> Self {
        Self {
            cell: Arc::new(HandleCell {
                id,
                target: RwLock::new(Some(session)),
            }),
        }
    }

    /// Handle with no target; every request fails with `NotConnected`
    pub fn detached(id: u64) -> Self {
        Self {
            cell: Arc::new(HandleCell {
                id,
                target: RwLock::new(None),
            }),
        }
    }

    /// Id assigned when the handle was registered
    pub fn id(&self) -> u64 {
        self.cell.id
    }

    /// Session currently behind the handle
    pub fn target(&self) -> Option<ControllerSession> {
        read(&self.cell.target).clone()
    }

    /// Point the handle at `session`; returns the previous target
    pub(crate) fn retarget(&self, session: ControllerSession) -> Option<ControllerSession> {
        write(&self.cell.target).replace(session)
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleCell> {
        Arc::downgrade(&self.cell)
    }

    pub(crate) fn from_cell(cell: Arc<HandleCell>) -> Self {
        Self { cell }
    }

    fn live(&self) -> Result<ControllerSession, SessionError> {
        self.target().ok_or(SessionError::NotConnected)
    }
}

#[async_trait]
impl ControllerState for SessionHandle {
    fn is_online(&self) -> bool {
        self.target().is_some_and(|session| session.is_online())
    }

    fn is_stopping(&self) -> bool {
        self.target().is_some_and(|session| session.is_stopping())
    }

    fn log_prefix(&self) -> String {
        match self.target() {
            Some(session) => session.log_prefix(),
            None => format!("[{}] ", self.cell.id),
        }
    }

    fn identification(&self) -> Option<Identification> {
        self.target().and_then(|session| session.identification())
    }

    fn send_config_change(&self, change: ConfigChange) -> Result<i64, SessionError> {
        self.live()?.send_config_change(change)
    }

    fn send_device_action(&self, action: DeviceActionRequest) -> Result<i64, SessionError> {
        self.live()?.send_device_action(action)
    }

    fn start_event_stream(&self) -> Result<(), SessionError> {
        self.live()?.start_event_stream()
    }

    fn acknowledge_events(&self, ids: &HashSet<i64>) -> Result<(), SessionError> {
        self.live()?.acknowledge_events(ids)
    }

    async fn stop(&self) {
        if let Some(session) = self.target() {
            session.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::controller::SessionSettings;

    fn inbound(id: u64) -> ControllerSession {
        ControllerSession::new(
            id,
            ControllerConfig::inbound("AA:BB:CC:DD:EE:FF"),
            SessionSettings::default(),
        )
    }

    #[test]
    fn test_detached_handle_is_not_connected() {
        let handle = SessionHandle::detached(7);
        assert!(!handle.is_online());
        assert!(!handle.is_stopping());
        assert_eq!(handle.log_prefix(), "[7] ");
        assert!(matches!(
            handle.send_config_change(ConfigChange::default()),
            Err(SessionError::NotConnected)
        ));
        assert!(matches!(
            handle.start_event_stream(),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn test_retarget_swaps_session() {
        let first = inbound(1);
        let handle = SessionHandle::new(1, first.clone());
        assert_eq!(handle.target().map(|s| s.id()), Some(1));

        let previous = handle.retarget(inbound(2));
        assert_eq!(previous.map(|s| s.id()), Some(1));
        assert_eq!(handle.target().map(|s| s.id()), Some(2));
        assert_eq!(handle.id(), 1);
    }

    #[tokio::test]
    async fn test_stop_reaches_target() {
        let session = inbound(3);
        let handle = SessionHandle::new(3, session.clone());
        handle.stop().await;
        assert!(session.is_stopping());
        assert!(handle.is_stopping());
    }
}
