//! External collaborator traits. The host stack supplies the GATT transport
//! and the per-device authorization policy; the media player supplies the
//! state source. All three are substituted with in-memory fakes in tests.

use std::fmt::Debug;
use std::hash::Hash;

use crate::{
    Characteristic, ErrorCode, Features, ObjectId, PlayingOrder, Prop, Request, SearchItem, Uuid16,
};

/// Error type reported when the transport fails a service table operation.
/// Reported upward as a status, never retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("service registration failed")]
    AddService,
    #[error("service removal failed")]
    RemoveService,
}

/// Token correlating a read or write callback with its response.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct RequestId(pub u32);

/// Response status forwarded to the transport.
pub type Status = std::result::Result<(), ErrorCode>;

/// GATT service definition derived from the capability table and handed to
/// the transport at initialization.
#[derive(Clone, Debug)]
pub struct ServiceDef {
    pub uuid: Uuid16,
    pub characteristics: Vec<CharacteristicDef>,
}

/// One characteristic of a [`ServiceDef`].
#[derive(Clone, Copy, Debug)]
pub struct CharacteristicDef {
    pub chr: Characteristic,
    pub uuid: Uuid16,
    pub props: Prop,
    /// Whether a Client Characteristic Configuration descriptor is attached.
    pub cccd: bool,
}

/// GATT transport capability set consumed by the service.
pub trait GattTransport {
    /// Peer device identity.
    type Peer: Clone + Debug + Eq + Hash;

    /// Registers the service attribute table.
    fn add_service(&self, def: &ServiceDef) -> std::result::Result<(), TransportError>;

    /// Removes a previously registered service.
    fn remove_service(&self, uuid: Uuid16) -> std::result::Result<(), TransportError>;

    /// Sends a characteristic value notification to one peer.
    fn notify(&self, peer: &Self::Peer, chr: Characteristic, val: &[u8]);

    /// Completes a read or write request. Responses to write-without-response
    /// commands may be dropped by the transport.
    fn send_response(&self, peer: &Self::Peer, req: RequestId, status: Status, val: &[u8]);

    /// Returns the currently connected peers.
    fn connected_peers(&self) -> Vec<Self::Peer>;
}

/// Per-device authorization decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Authorization {
    Allowed,
    Rejected,
    /// No decision recorded for the device. Treated the same as `Rejected`.
    Unknown,
}

/// External per-device allow-list. Consulted before any read, write, or
/// descriptor access is serviced.
pub trait AuthorizationProvider<P> {
    fn authorize(&self, peer: &P) -> Authorization;
}

/// Object-identifier characteristics a central may reassign by writing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ObjectIdField {
    CurrentTrack,
    NextTrack,
    CurrentGroup,
}

/// Media player callback set. Invoked synchronously from the transport's
/// callback context with no service lock held, so an implementation may
/// supply a result or republish state from within the callback. Callbacks
/// must still be non-blocking or bounded, as the service provides no timeout
/// and a stalled callback starves every subsequent GATT event.
pub trait MediaStateSource {
    /// Returns the feature set for the service instance being initialized.
    fn features(&self) -> Features;

    /// A central reassigned an object identifier.
    fn set_object_id(&self, field: ObjectIdField, id: ObjectId);

    /// A central requested an absolute track position in milliseconds.
    fn set_track_position(&self, ms: i64);

    /// A central requested a playback speed factor.
    fn set_playback_speed(&self, speed: f32);

    /// A central requested a playing order. Already validated against the
    /// published supported-orders mask.
    fn set_playing_order(&self, order: PlayingOrder);

    /// A validated control point request. The player reports the outcome via
    /// [`control_request_result`](crate::MediaControlService::control_request_result).
    fn control_request(&self, req: Request);

    /// A validated search request. The player reports the outcome via
    /// [`search_request_result`](crate::MediaControlService::search_request_result).
    fn search_request(&self, query: Vec<SearchItem>);
}
