//! Generic Media Control Service ([GMCS]) GATT server.
//!
//! This crate implements the media control profile surface of a BLE
//! peripheral: the state of a media player is exposed through the service's
//! characteristics, and control commands written to the media and search
//! control points are forwarded to the player. Connection establishment,
//! pairing, and advertising are the host stack's concern; the stack plugs in
//! through the [`GattTransport`], [`AuthorizationProvider`], and
//! [`MediaStateSource`] traits.
//!
//! All entry points must be invoked from the transport's serialized callback
//! context (see [`MediaControlService`]).
//!
//! [GMCS]: https://www.bluetooth.com/specifications/specs/media-control-service-1-0/

pub use {caps::*, codec::ObjectId, consts::*, server::*, transport::*};

mod caps;
mod codec;
mod consts;
mod server;
mod sub;
mod transport;

pub(crate) type SyncMutex<T> = parking_lot::Mutex<T>;

/// Error type returned to the owning process.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The feature set returned by the media state source is missing part of
    /// the mandatory characteristic set ([MCS] Section 3).
    #[error("mandatory feature {0:?} is not enabled")]
    MissingMandatoryFeature(Features),
    /// The service is not initialized.
    #[error("service is not initialized")]
    NotInitialized,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;
