//! Discovery wire protocol: message types, service type and version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current discovery protocol version. Frames with another version are ignored.
pub const PROTOCOL_VERSION: u8 = 1;

/// Service type shared by every RemoteStash instance.
pub const SERVICE_TYPE: &str = "_remotestash._tcp";

/// Advertised property carrying the stable device UUID.
pub const UUID_PROPERTY: &str = "uuid";

/// Advertised property naming the kind of device (informational).
pub const TYPE_PROPERTY: &str = "type";

/// All discovery messages. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Browser solicits announcements from every advertiser of `service_type`.
    Query {
        protocol_version: u8,
        service_type: String,
    },
    /// Advertiser presence: instance name and transfer port. No identity yet.
    Announce {
        protocol_version: u8,
        service_type: String,
        name: String,
        port: u16,
    },
    /// Browser asks one advertiser for its full record.
    ResolveRequest {
        protocol_version: u8,
        service_type: String,
        name: String,
    },
    /// Full record. The host is the datagram's source address.
    ResolveResponse {
        protocol_version: u8,
        service_type: String,
        name: String,
        port: u16,
        properties: BTreeMap<String, String>,
    },
    /// Advertiser is going away.
    Goodbye {
        protocol_version: u8,
        service_type: String,
        name: String,
    },
}

impl Message {
    pub fn query() -> Self {
        Message::Query {
            protocol_version: PROTOCOL_VERSION,
            service_type: SERVICE_TYPE.to_string(),
        }
    }

    pub fn announce(name: &str, port: u16) -> Self {
        Message::Announce {
            protocol_version: PROTOCOL_VERSION,
            service_type: SERVICE_TYPE.to_string(),
            name: name.to_string(),
            port,
        }
    }

    pub fn resolve_request(name: &str) -> Self {
        Message::ResolveRequest {
            protocol_version: PROTOCOL_VERSION,
            service_type: SERVICE_TYPE.to_string(),
            name: name.to_string(),
        }
    }

    pub fn resolve_response(name: &str, port: u16, properties: BTreeMap<String, String>) -> Self {
        Message::ResolveResponse {
            protocol_version: PROTOCOL_VERSION,
            service_type: SERVICE_TYPE.to_string(),
            name: name.to_string(),
            port,
            properties,
        }
    }

    pub fn goodbye(name: &str) -> Self {
        Message::Goodbye {
            protocol_version: PROTOCOL_VERSION,
            service_type: SERVICE_TYPE.to_string(),
            name: name.to_string(),
        }
    }

    pub fn protocol_version(&self) -> u8 {
        match self {
            Message::Query { protocol_version, .. }
            | Message::Announce { protocol_version, .. }
            | Message::ResolveRequest { protocol_version, .. }
            | Message::ResolveResponse { protocol_version, .. }
            | Message::Goodbye { protocol_version, .. } => *protocol_version,
        }
    }

    pub fn service_type(&self) -> &str {
        match self {
            Message::Query { service_type, .. }
            | Message::Announce { service_type, .. }
            | Message::ResolveRequest { service_type, .. }
            | Message::ResolveResponse { service_type, .. }
            | Message::Goodbye { service_type, .. } => service_type,
        }
    }

    /// True when this frame belongs to our protocol version and service type.
    pub fn is_ours(&self) -> bool {
        self.protocol_version() == PROTOCOL_VERSION && self.service_type() == SERVICE_TYPE
    }
}
