//! RemoteStash protocol core.
//! Host-driven: no network I/O; host passes discovery events and wire bytes, receives
//! notifications, items and status snapshots.

pub mod availability;
pub mod identity;
pub mod item;
pub mod mime;
pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod wire;

pub use availability::{Availability, Change, IdentityMismatch, StatusReport};
pub use identity::{DeviceId, IdentityError};
pub use item::{Bitmap, CodecError, EncodedItem, FileItemError, Item, ItemKind};
pub use protocol::{Message, PROTOCOL_VERSION, SERVICE_TYPE};
pub use registry::{DiscoveryEvent, DiscoverySet, PeerDescriptor, PeerKey, PeerNotification};
pub use transfer::Operation;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
