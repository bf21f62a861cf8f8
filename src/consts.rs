//! Media Control Service constants and wire enums ([MCS] Section 3,
//! [Assigned Numbers] Section 3.8).

use std::fmt::{self, Display, Formatter};

use bitflags::bitflags;

/// 16-bit Bluetooth SIG assigned UUID.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Uuid16(u16);

impl Uuid16 {
    /// Creates a 16-bit UUID from an assigned number.
    #[inline(always)]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        Self(v)
    }

    /// Returns the raw assigned number.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl Display for Uuid16 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

impl From<Uuid16> for u16 {
    #[inline(always)]
    fn from(u: Uuid16) -> Self {
        u.0
    }
}

/// Generic Media Control Service UUID.
pub const GENERIC_MEDIA_CONTROL_SERVICE: Uuid16 = Uuid16::new(0x1849);

/// Media Control Service UUID (per-player instance).
pub const MEDIA_CONTROL_SERVICE: Uuid16 = Uuid16::new(0x1848);

/// Client Characteristic Configuration descriptor UUID.
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid16 = Uuid16::new(0x2902);

/// Service characteristics in declaration order ([MCS] Section 3).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, enum_iterator::Sequence)]
#[non_exhaustive]
pub enum Characteristic {
    PlayerName,
    PlayerIconObjId,
    PlayerIconUrl,
    TrackChanged,
    TrackTitle,
    TrackDuration,
    TrackPosition,
    PlaybackSpeed,
    SeekingSpeed,
    TrackSegmentsObjId,
    CurrentTrackObjId,
    NextTrackObjId,
    ParentGroupObjId,
    CurrentGroupObjId,
    PlayingOrder,
    PlayingOrdersSupported,
    MediaState,
    MediaControlPoint,
    OpcodesSupported,
    SearchResultsObjId,
    SearchControlPoint,
    ContentControlId,
}

impl Characteristic {
    /// Returns the characteristic UUID.
    #[must_use]
    pub const fn uuid(self) -> Uuid16 {
        use Characteristic::*;
        Uuid16::new(match self {
            PlayerName => 0x2B93,
            PlayerIconObjId => 0x2B94,
            PlayerIconUrl => 0x2B95,
            TrackChanged => 0x2B96,
            TrackTitle => 0x2B97,
            TrackDuration => 0x2B98,
            TrackPosition => 0x2B99,
            PlaybackSpeed => 0x2B9A,
            SeekingSpeed => 0x2B9B,
            TrackSegmentsObjId => 0x2B9C,
            CurrentTrackObjId => 0x2B9D,
            NextTrackObjId => 0x2B9E,
            ParentGroupObjId => 0x2B9F,
            CurrentGroupObjId => 0x2BA0,
            PlayingOrder => 0x2BA1,
            PlayingOrdersSupported => 0x2BA2,
            MediaState => 0x2BA3,
            MediaControlPoint => 0x2BA4,
            OpcodesSupported => 0x2BA5,
            SearchResultsObjId => 0x2BA6,
            SearchControlPoint => 0x2BA7,
            ContentControlId => 0x2BBA,
        })
    }
}

bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1). Only the
    /// properties used by this service are defined.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Prop: u8 {
        /// Permits reads of the characteristic value.
        const READ = 0x02;
        /// Permits writes of the characteristic value without response.
        const WRITE_CMD = 0x04;
        /// Permits writes of the characteristic value with response.
        const WRITE = 0x08;
        /// Permits notifications of the characteristic value. If set, the
        /// Client Characteristic Configuration descriptor shall exist.
        const NOTIFY = 0x10;
    }
}

bitflags! {
    /// Client Characteristic Configuration descriptor value
    /// ([Vol 3] Part G, Section 3.3.3.3).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Cccd: u16 {
        const NOTIFY = 1 << 0;
        const INDICATE = 1 << 1;
    }
}

/// ATT error codes reported to the requesting device
/// ([Vol 3] Part F, Section 3.4.1.1). Only the codes produced by this service
/// are defined.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorCode {
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    InsufficientAuthorization = 0x08,
    AttributeNotFound = 0x0A,
    InvalidAttributeValueLength = 0x0D,
    UnlikelyError = 0x0E,
    ValueNotAllowed = 0x13,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Media control point opcode ([MCS] Section 3.20.1).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum Opcode {
    Play = 0x01,
    Pause = 0x02,
    FastRewind = 0x03,
    FastForward = 0x04,
    Stop = 0x05,
    MoveRelative = 0x10,
    PreviousSegment = 0x20,
    NextSegment = 0x21,
    FirstSegment = 0x22,
    LastSegment = 0x23,
    GotoSegment = 0x24,
    PreviousTrack = 0x30,
    NextTrack = 0x31,
    FirstTrack = 0x32,
    LastTrack = 0x33,
    GotoTrack = 0x34,
    PreviousGroup = 0x40,
    NextGroup = 0x41,
    FirstGroup = 0x42,
    LastGroup = 0x43,
    GotoGroup = 0x44,
}

impl Opcode {
    /// Returns whether the opcode carries a signed 32-bit parameter.
    #[inline]
    #[must_use]
    pub const fn has_param(self) -> bool {
        use Opcode::*;
        matches!(self, MoveRelative | GotoSegment | GotoTrack | GotoGroup)
    }

    /// Returns the opcode's bit in the supported-opcodes mask
    /// ([MCS] Section 3.21).
    #[must_use]
    pub const fn mask(self) -> OpcodeSet {
        use Opcode::*;
        match self {
            Play => OpcodeSet::PLAY,
            Pause => OpcodeSet::PAUSE,
            FastRewind => OpcodeSet::FAST_REWIND,
            FastForward => OpcodeSet::FAST_FORWARD,
            Stop => OpcodeSet::STOP,
            MoveRelative => OpcodeSet::MOVE_RELATIVE,
            PreviousSegment => OpcodeSet::PREVIOUS_SEGMENT,
            NextSegment => OpcodeSet::NEXT_SEGMENT,
            FirstSegment => OpcodeSet::FIRST_SEGMENT,
            LastSegment => OpcodeSet::LAST_SEGMENT,
            GotoSegment => OpcodeSet::GOTO_SEGMENT,
            PreviousTrack => OpcodeSet::PREVIOUS_TRACK,
            NextTrack => OpcodeSet::NEXT_TRACK,
            FirstTrack => OpcodeSet::FIRST_TRACK,
            LastTrack => OpcodeSet::LAST_TRACK,
            GotoTrack => OpcodeSet::GOTO_TRACK,
            PreviousGroup => OpcodeSet::PREVIOUS_GROUP,
            NextGroup => OpcodeSet::NEXT_GROUP,
            FirstGroup => OpcodeSet::FIRST_GROUP,
            LastGroup => OpcodeSet::LAST_GROUP,
            GotoGroup => OpcodeSet::GOTO_GROUP,
        }
    }
}

bitflags! {
    /// Media Control Point Opcodes Supported characteristic value
    /// ([MCS] Section 3.21).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct OpcodeSet: u32 {
        const PLAY = 1 << 0;
        const PAUSE = 1 << 1;
        const FAST_REWIND = 1 << 2;
        const FAST_FORWARD = 1 << 3;
        const STOP = 1 << 4;
        const MOVE_RELATIVE = 1 << 5;
        const PREVIOUS_SEGMENT = 1 << 6;
        const NEXT_SEGMENT = 1 << 7;
        const FIRST_SEGMENT = 1 << 8;
        const LAST_SEGMENT = 1 << 9;
        const GOTO_SEGMENT = 1 << 10;
        const PREVIOUS_TRACK = 1 << 11;
        const NEXT_TRACK = 1 << 12;
        const FIRST_TRACK = 1 << 13;
        const LAST_TRACK = 1 << 14;
        const GOTO_TRACK = 1 << 15;
        const PREVIOUS_GROUP = 1 << 16;
        const NEXT_GROUP = 1 << 17;
        const FIRST_GROUP = 1 << 18;
        const LAST_GROUP = 1 << 19;
        const GOTO_GROUP = 1 << 20;
    }
}

/// Media control point result code, notified back as `{opcode, result}`
/// ([MCS] Section 3.20.2).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum CmdResult {
    Success = 0x01,
    OpcodeNotSupported = 0x02,
    PlayerInactive = 0x03,
    CannotBeCompleted = 0x04,
}

/// Validated media control point request. Constructed only from a write that
/// passed length and opcode-support checks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Request {
    pub opcode: Opcode,
    pub param: Option<i32>,
}

/// Media State characteristic value ([MCS] Section 3.19).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum MediaState {
    Inactive = 0x00,
    Playing = 0x01,
    Paused = 0x02,
    Seeking = 0x03,
}

/// Playing Order characteristic value ([MCS] Section 3.15).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum PlayingOrder {
    SingleOnce = 0x01,
    SingleRepeat = 0x02,
    InOrderOnce = 0x03,
    InOrderRepeat = 0x04,
    OldestOnce = 0x05,
    OldestRepeat = 0x06,
    NewestOnce = 0x07,
    NewestRepeat = 0x08,
    ShuffleOnce = 0x09,
    ShuffleRepeat = 0x0A,
}

impl PlayingOrder {
    /// Returns the order's bit in the supported-orders mask
    /// ([MCS] Section 3.16).
    #[must_use]
    pub const fn mask(self) -> PlayingOrderSet {
        use PlayingOrder::*;
        match self {
            SingleOnce => PlayingOrderSet::SINGLE_ONCE,
            SingleRepeat => PlayingOrderSet::SINGLE_REPEAT,
            InOrderOnce => PlayingOrderSet::IN_ORDER_ONCE,
            InOrderRepeat => PlayingOrderSet::IN_ORDER_REPEAT,
            OldestOnce => PlayingOrderSet::OLDEST_ONCE,
            OldestRepeat => PlayingOrderSet::OLDEST_REPEAT,
            NewestOnce => PlayingOrderSet::NEWEST_ONCE,
            NewestRepeat => PlayingOrderSet::NEWEST_REPEAT,
            ShuffleOnce => PlayingOrderSet::SHUFFLE_ONCE,
            ShuffleRepeat => PlayingOrderSet::SHUFFLE_REPEAT,
        }
    }
}

bitflags! {
    /// Playing Orders Supported characteristic value ([MCS] Section 3.16).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct PlayingOrderSet: u16 {
        const SINGLE_ONCE = 1 << 0;
        const SINGLE_REPEAT = 1 << 1;
        const IN_ORDER_ONCE = 1 << 2;
        const IN_ORDER_REPEAT = 1 << 3;
        const OLDEST_ONCE = 1 << 4;
        const OLDEST_REPEAT = 1 << 5;
        const NEWEST_ONCE = 1 << 6;
        const NEWEST_REPEAT = 1 << 7;
        const SHUFFLE_ONCE = 1 << 8;
        const SHUFFLE_REPEAT = 1 << 9;
    }
}

/// Maximum accepted search control point write length ([MCS] Section 3.23).
pub(crate) const MAX_SEARCH_LEN: usize = 64;

/// Search control point item type ([MCS] Section 3.23.1).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub(crate) enum SearchType {
    TrackName = 0x01,
    ArtistName = 0x02,
    AlbumName = 0x03,
    GroupName = 0x04,
    EarliestYear = 0x05,
    LatestYear = 0x06,
    Genre = 0x07,
    OnlyTracks = 0x08,
    OnlyGroups = 0x09,
}

/// Decoded search control point item.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SearchItem {
    TrackName(String),
    ArtistName(String),
    AlbumName(String),
    GroupName(String),
    EarliestYear(String),
    LatestYear(String),
    Genre(String),
    OnlyTracks,
    OnlyGroups,
}

/// Search control point result code ([MCS] Section 3.23.2).
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum SearchResult {
    Success = 0x01,
    Failure = 0x02,
}
