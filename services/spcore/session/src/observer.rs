//! Observer traits and the controller state interface they receive.

use async_trait::async_trait;
use spcore_wire::{
    ConfigChange, ConfigChangeResult, DeviceActionRequest, DeviceActionResult, Event,
    Identification, SpCoreMessage,
};
use std::collections::HashSet;

use crate::SessionError;

/// Operations available on a controller, whether held directly or through a handle
#[async_trait]
pub trait ControllerState: Send + Sync {
    /// Whether the controller has identified on the current connection
    fn is_online(&self) -> bool;

    /// Whether the controller has been stopped
    fn is_stopping(&self) -> bool;

    /// Prefix used on every log line for this controller
    fn log_prefix(&self) -> String;

    /// Identification received on the current connection
    fn identification(&self) -> Option<Identification>;

    /// Send a configuration change; returns the request id
    fn send_config_change(&self, change: ConfigChange) -> Result<i64, SessionError>;

    /// Send a device action; returns the request id
    fn send_device_action(&self, action: DeviceActionRequest) -> Result<i64, SessionError>;

    /// Ask the controller to deliver events continuously
    fn start_event_stream(&self) -> Result<(), SessionError>;

    /// Tell the controller which events have been consumed
    fn acknowledge_events(&self, ids: &HashSet<i64>) -> Result<(), SessionError>;

    /// Stop the controller and wait for its connection to close
    async fn stop(&self);
}

/// Receives controller lifecycle and result notifications.
///
/// Callbacks run on the connection's reader task and should return quickly.
#[allow(unused_variables)]
pub trait SessionObserver: Send + Sync {
    /// Controller identified and is ready for requests
    fn on_online(&self, session: &dyn ControllerState) {}

    /// Controller connection was lost
    fn on_offline(&self, session: &dyn ControllerState) {}

    /// Result for a configuration change sent earlier
    fn on_config_change_result(
        &self,
        session: &dyn ControllerState,
        change: &ConfigChange,
        result: &ConfigChangeResult,
    ) {
    }

    /// Result for a device action sent earlier
    fn on_device_action_result(
        &self,
        session: &dyn ControllerState,
        action: &DeviceActionRequest,
        result: &DeviceActionResult,
    ) {
    }

    /// Events delivered by the controller; never called with an empty slice
    fn on_events(&self, session: &dyn ControllerState, events: &[Event]) {}

    /// Message of a kind the session does not handle itself
    fn on_unhandled_message(&self, session: &dyn ControllerState, message: &SpCoreMessage) {}
}

/// Receives fleet-level notifications
#[allow(unused_variables)]
pub trait FleetObserver: Send + Sync {
    /// A controller dialed in with an identity matching no configured controller
    fn on_unknown_controller_rejected(&self, identification: &Identification) {}
}

/// Observer that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

impl FleetObserver for NoopObserver {}
