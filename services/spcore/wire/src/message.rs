//! Protobuf message schema carried in frame bodies.
//!
//! Only the message kinds the session state machine consumes are modeled in
//! detail. Configuration records are carried as opaque payloads owned by the
//! hardware data model.

/// Top-level message carried in every frame body
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SpCoreMessage {
    /// Discriminator
    #[prost(enumeration = "MessageKind", tag = "1")]
    pub kind: i32,
    /// Peer identity, present on `Identification`
    #[prost(message, optional, tag = "2")]
    pub identification: ::core::option::Option<Identification>,
    /// Reason carried by `Terminate`
    #[prost(enumeration = "TerminationReason", optional, tag = "3")]
    pub termination_reason: ::core::option::Option<i32>,
    /// Configuration change request
    #[prost(message, optional, tag = "4")]
    pub config_change: ::core::option::Option<ConfigChange>,
    /// Result of a configuration change
    #[prost(message, optional, tag = "5")]
    pub config_change_result: ::core::option::Option<ConfigChangeResult>,
    /// Device action request
    #[prost(message, optional, tag = "6")]
    pub device_action_request: ::core::option::Option<DeviceActionRequest>,
    /// Result of a device action
    #[prost(message, optional, tag = "7")]
    pub device_action_result: ::core::option::Option<DeviceActionResult>,
    /// Event batch
    #[prost(message, repeated, tag = "8")]
    pub events: ::prost::alloc::vec::Vec<Event>,
    /// Event stream control
    #[prost(message, optional, tag = "9")]
    pub event_flow_control: ::core::option::Option<EventFlowControl>,
    /// Device state snapshots
    #[prost(message, repeated, tag = "10")]
    pub device_state_records: ::prost::alloc::vec::Vec<DeviceStateRecord>,
}

/// Identity and capabilities announced at the start of a connection
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Identification {
    /// Controller id, normally its MAC address
    #[prost(string, optional, tag = "1")]
    pub id: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "2")]
    pub software_version: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "3")]
    pub protocol_version: ::core::option::Option<::prost::alloc::string::String>,
    /// Largest body the sender accepts
    #[prost(uint32, optional, tag = "4")]
    pub max_body_length: ::core::option::Option<u32>,
    #[prost(string, optional, tag = "5")]
    pub device_model: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "6")]
    pub serial_number: ::core::option::Option<::prost::alloc::string::String>,
    /// Pre-shared password, if the sender has one
    #[prost(string, optional, tag = "7")]
    pub password: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "8")]
    pub capabilities: ::core::option::Option<ProtocolCapabilities>,
}

/// Optional protocol features the sender understands
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtocolCapabilities {
    #[prost(bool, optional, tag = "1")]
    pub supports_identification_password: ::core::option::Option<bool>,
    #[prost(bool, optional, tag = "2")]
    pub supports_identification_password_upstream: ::core::option::Option<bool>,
    #[prost(int32, optional, tag = "3")]
    pub max_device_action_type: ::core::option::Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub max_termination_reason: ::core::option::Option<i32>,
}

/// Opaque configuration record
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigRecord {
    #[prost(int64, optional, tag = "1")]
    pub unid: ::core::option::Option<i64>,
    #[prost(string, optional, tag = "2")]
    pub name: ::core::option::Option<::prost::alloc::string::String>,
    /// Record body encoded by the data model layer
    #[prost(bytes = "vec", optional, tag = "3")]
    pub payload: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

/// Batch of configuration records to apply on the controller
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigChange {
    /// Assigned by the session when unset
    #[prost(int64, optional, tag = "1")]
    pub request_id: ::core::option::Option<i64>,
    #[prost(message, repeated, tag = "2")]
    pub schedules: ::prost::alloc::vec::Vec<ConfigRecord>,
    #[prost(message, repeated, tag = "3")]
    pub holidays: ::prost::alloc::vec::Vec<ConfigRecord>,
    #[prost(message, repeated, tag = "4")]
    pub devices: ::prost::alloc::vec::Vec<ConfigRecord>,
    #[prost(message, repeated, tag = "5")]
    pub credentials: ::prost::alloc::vec::Vec<ConfigRecord>,
    #[prost(message, repeated, tag = "6")]
    pub privileges: ::prost::alloc::vec::Vec<ConfigRecord>,
}

/// Outcome of a configuration change
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigChangeResult {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    /// Human-readable failure; absent means success
    #[prost(string, optional, tag = "2")]
    pub exception: ::core::option::Option<::prost::alloc::string::String>,
}

/// Request to act on a device attached to the controller
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceActionRequest {
    /// Assigned by the session when unset
    #[prost(int64, optional, tag = "1")]
    pub request_id: ::core::option::Option<i64>,
    #[prost(enumeration = "DeviceActionType", optional, tag = "2")]
    pub action_type: ::core::option::Option<i32>,
    /// Target device unid
    #[prost(int64, optional, tag = "3")]
    pub device_id: ::core::option::Option<i64>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub params: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

/// Outcome of a device action
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceActionResult {
    #[prost(int64, tag = "1")]
    pub request_id: i64,
    /// Human-readable failure; absent means success
    #[prost(string, optional, tag = "2")]
    pub exception: ::core::option::Option<::prost::alloc::string::String>,
}

/// Event reported by the controller
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(int64, optional, tag = "1")]
    pub unid: ::core::option::Option<i64>,
    #[prost(int32, optional, tag = "2")]
    pub code: ::core::option::Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub sub_code: ::core::option::Option<i32>,
    #[prost(int64, optional, tag = "4")]
    pub device_id: ::core::option::Option<i64>,
    #[prost(int64, optional, tag = "5")]
    pub credential_id: ::core::option::Option<i64>,
    #[prost(int64, optional, tag = "6")]
    pub hw_time_millis: ::core::option::Option<i64>,
    #[prost(int32, optional, tag = "7")]
    pub priority: ::core::option::Option<i32>,
    #[prost(string, optional, tag = "8")]
    pub data: ::core::option::Option<::prost::alloc::string::String>,
}

/// Controls delivery of events and acknowledges consumed ones
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventFlowControl {
    #[prost(enumeration = "EventFlow", optional, tag = "1")]
    pub flow: ::core::option::Option<i32>,
    /// Unids of events the receiver has consumed
    #[prost(int64, repeated, tag = "2")]
    pub consume: ::prost::alloc::vec::Vec<i64>,
}

/// Opaque device state snapshot
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceStateRecord {
    #[prost(int64, optional, tag = "1")]
    pub device_id: ::core::option::Option<i64>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub state: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

/// Message discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    /// Unrecognized kind
    Unknown = 0,
    /// Keepalive
    Ping = 1,
    /// Identity announcement
    Identification = 2,
    /// Peer is closing the session
    Terminate = 3,
    /// Configuration change request
    ConfigChange = 4,
    /// Configuration change result
    ConfigChangeResult = 5,
    /// Device action request
    DeviceActionRequest = 6,
    /// Device action result
    DeviceActionResult = 7,
    /// Event batch
    EventBatch = 8,
    /// Event stream control
    EventFlowControl = 9,
    /// Device state snapshots
    DeviceStateRecord = 10,
    /// Several sections bundled in one message
    Multi = 11,
}

/// Why a peer terminated the session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TerminationReason {
    /// No reason given
    Unspecified = 0,
    /// Peer is shutting down
    Shutdown = 1,
    /// Peer does not recognise this side
    UnknownPeer = 2,
    /// Identification was rejected
    IdentificationRejected = 3,
    /// Peer saw a protocol violation
    ProtocolError = 4,
}

/// Device action types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DeviceActionType {
    /// Not set
    Unspecified = 0,
    /// Unlock a door for one access time
    DoorMomentaryUnlock = 1,
    /// Lock a door until further notice
    DoorLock = 2,
    /// Unlock a door until further notice
    DoorUnlock = 3,
    /// Return a door to its scheduled mode
    DoorModeRestore = 4,
    /// Energize an output
    OutputOn = 5,
    /// De-energize an output
    OutputOff = 6,
    /// Reboot the controller
    ControllerReboot = 7,
}

/// Event stream modes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventFlow {
    /// Not set
    Unspecified = 0,
    /// Deliver events continuously as they occur
    StartContinuous = 1,
    /// Stop delivering events
    Stop = 2,
}

impl SpCoreMessage {
    /// Empty message of the given kind
    pub fn of_kind(kind: MessageKind) -> Self {
        Self {
            kind: kind as i32,
            ..Default::default()
        }
    }

    /// Keepalive
    pub fn ping() -> Self {
        Self::of_kind(MessageKind::Ping)
    }

    /// Identity announcement
    pub fn identification(identification: Identification) -> Self {
        Self {
            identification: Some(identification),
            ..Self::of_kind(MessageKind::Identification)
        }
    }

    /// Session termination with a reason
    pub fn terminate(reason: TerminationReason) -> Self {
        Self {
            termination_reason: Some(reason as i32),
            ..Self::of_kind(MessageKind::Terminate)
        }
    }

    /// Configuration change request
    pub fn config_change(change: ConfigChange) -> Self {
        Self {
            config_change: Some(change),
            ..Self::of_kind(MessageKind::ConfigChange)
        }
    }

    /// Configuration change result
    pub fn config_change_result(request_id: i64, exception: Option<String>) -> Self {
        Self {
            config_change_result: Some(ConfigChangeResult {
                request_id,
                exception,
            }),
            ..Self::of_kind(MessageKind::ConfigChangeResult)
        }
    }

    /// Device action request
    pub fn device_action(action: DeviceActionRequest) -> Self {
        Self {
            device_action_request: Some(action),
            ..Self::of_kind(MessageKind::DeviceActionRequest)
        }
    }

    /// Device action result
    pub fn device_action_result(request_id: i64, exception: Option<String>) -> Self {
        Self {
            device_action_result: Some(DeviceActionResult {
                request_id,
                exception,
            }),
            ..Self::of_kind(MessageKind::DeviceActionResult)
        }
    }

    /// Event batch
    pub fn event_batch(events: Vec<Event>) -> Self {
        Self {
            events,
            ..Self::of_kind(MessageKind::EventBatch)
        }
    }

    /// Event stream control
    pub fn event_flow_control(control: EventFlowControl) -> Self {
        Self {
            event_flow_control: Some(control),
            ..Self::of_kind(MessageKind::EventFlowControl)
        }
    }
}

impl ConfigChangeResult {
    /// A result without an exception string is a success
    pub fn is_success(&self) -> bool {
        self.exception.as_deref().map_or(true, str::is_empty)
    }
}

impl DeviceActionResult {
    /// A result without an exception string is a success
    pub fn is_success(&self) -> bool {
        self.exception.as_deref().map_or(true, str::is_empty)
    }
}

impl ConfigRecord {
    /// Record with a unid and a name and no payload
    pub fn named(unid: i64, name: impl Into<String>) -> Self {
        Self {
            unid: Some(unid),
            name: Some(name.into()),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_reads_as_unknown() {
        let message = SpCoreMessage {
            kind: 99,
            ..Default::default()
        };
        assert_eq!(message.kind(), MessageKind::Unknown);
    }

    #[test]
    fn test_result_success() {
        let ok = ConfigChangeResult {
            request_id: 1,
            exception: None,
        };
        let failed = ConfigChangeResult {
            request_id: 1,
            exception: Some("no such schedule".into()),
        };
        assert!(ok.is_success());
        assert!(!failed.is_success());
    }

    #[test]
    fn test_terminate_reason() {
        let message = SpCoreMessage::terminate(TerminationReason::Shutdown);
        assert_eq!(message.kind(), MessageKind::Terminate);
        assert_eq!(message.termination_reason(), TerminationReason::Shutdown);
    }
}
