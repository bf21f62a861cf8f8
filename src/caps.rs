//! Feature-gated capability table. Built once at service initialization from
//! the media state source's feature set; the active characteristic set never
//! changes for the lifetime of a service instance.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::transport::{CharacteristicDef, ServiceDef};
use crate::{Characteristic, Error, Prop, Result, Uuid16};

bitflags! {
    /// Service feature set fixed at construction time. One bit per
    /// characteristic, plus `*_NOTIFY` bits enabling the optional notify
    /// property of characteristics where [MCS] leaves it to the
    /// implementation.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Features: u64 {
        const PLAYER_NAME = 1 << 0;
        const PLAYER_ICON_OBJ_ID = 1 << 1;
        const PLAYER_ICON_URL = 1 << 2;
        const TRACK_CHANGED = 1 << 3;
        const TRACK_TITLE = 1 << 4;
        const TRACK_DURATION = 1 << 5;
        const TRACK_POSITION = 1 << 6;
        const PLAYBACK_SPEED = 1 << 7;
        const SEEKING_SPEED = 1 << 8;
        const TRACK_SEGMENTS_OBJ_ID = 1 << 9;
        const CURRENT_TRACK_OBJ_ID = 1 << 10;
        const NEXT_TRACK_OBJ_ID = 1 << 11;
        const PARENT_GROUP_OBJ_ID = 1 << 12;
        const CURRENT_GROUP_OBJ_ID = 1 << 13;
        const PLAYING_ORDER = 1 << 14;
        const PLAYING_ORDERS_SUPPORTED = 1 << 15;
        const MEDIA_STATE = 1 << 16;
        const MEDIA_CONTROL_POINT = 1 << 17;
        const OPCODES_SUPPORTED = 1 << 18;
        const SEARCH_RESULTS_OBJ_ID = 1 << 19;
        const SEARCH_CONTROL_POINT = 1 << 20;
        const CONTENT_CONTROL_ID = 1 << 21;

        const PLAYER_NAME_NOTIFY = 1 << 32;
        const TRACK_TITLE_NOTIFY = 1 << 33;
        const TRACK_DURATION_NOTIFY = 1 << 34;
        const TRACK_POSITION_NOTIFY = 1 << 35;
        const PLAYBACK_SPEED_NOTIFY = 1 << 36;
        const SEEKING_SPEED_NOTIFY = 1 << 37;
        const CURRENT_TRACK_OBJ_ID_NOTIFY = 1 << 38;
        const NEXT_TRACK_OBJ_ID_NOTIFY = 1 << 39;
        const PARENT_GROUP_OBJ_ID_NOTIFY = 1 << 40;
        const CURRENT_GROUP_OBJ_ID_NOTIFY = 1 << 41;
        const PLAYING_ORDER_NOTIFY = 1 << 42;
        const OPCODES_SUPPORTED_NOTIFY = 1 << 43;

        /// Characteristics that every service instance must expose
        /// ([MCS] Section 3).
        const MANDATORY = Self::PLAYER_NAME.bits()
            | Self::TRACK_TITLE.bits()
            | Self::TRACK_DURATION.bits()
            | Self::TRACK_POSITION.bits()
            | Self::MEDIA_STATE.bits()
            | Self::CONTENT_CONTROL_ID.bits();
    }
}

/// Wire format of a characteristic value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Fmt {
    /// UTF-8 string, implicit length.
    Utf8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 8-bit speed exponent.
    I8,
    /// Signed 32-bit tenths-of-a-second interval.
    Interval,
    /// 16-bit little-endian bitmask.
    Bits16,
    /// 32-bit little-endian bitmask.
    Bits32,
    /// 48-bit little-endian object identifier, or zero-length when absent.
    ObjId,
    /// Control point record, variable length.
    Record,
    /// Always zero-length (Track Changed).
    Empty,
}

impl Characteristic {
    /// Returns the feature bit that enables this characteristic.
    #[must_use]
    pub const fn feature(self) -> Features {
        use Characteristic::*;
        match self {
            PlayerName => Features::PLAYER_NAME,
            PlayerIconObjId => Features::PLAYER_ICON_OBJ_ID,
            PlayerIconUrl => Features::PLAYER_ICON_URL,
            TrackChanged => Features::TRACK_CHANGED,
            TrackTitle => Features::TRACK_TITLE,
            TrackDuration => Features::TRACK_DURATION,
            TrackPosition => Features::TRACK_POSITION,
            PlaybackSpeed => Features::PLAYBACK_SPEED,
            SeekingSpeed => Features::SEEKING_SPEED,
            TrackSegmentsObjId => Features::TRACK_SEGMENTS_OBJ_ID,
            CurrentTrackObjId => Features::CURRENT_TRACK_OBJ_ID,
            NextTrackObjId => Features::NEXT_TRACK_OBJ_ID,
            ParentGroupObjId => Features::PARENT_GROUP_OBJ_ID,
            CurrentGroupObjId => Features::CURRENT_GROUP_OBJ_ID,
            PlayingOrder => Features::PLAYING_ORDER,
            PlayingOrdersSupported => Features::PLAYING_ORDERS_SUPPORTED,
            MediaState => Features::MEDIA_STATE,
            MediaControlPoint => Features::MEDIA_CONTROL_POINT,
            OpcodesSupported => Features::OPCODES_SUPPORTED,
            SearchResultsObjId => Features::SEARCH_RESULTS_OBJ_ID,
            SearchControlPoint => Features::SEARCH_CONTROL_POINT,
            ContentControlId => Features::CONTENT_CONTROL_ID,
        }
    }

    /// Returns the feature bit gating the optional notify property, or
    /// [`None`] if the notify property is fixed by [MCS].
    #[must_use]
    const fn notify_feature(self) -> Option<Features> {
        use Characteristic::*;
        Some(match self {
            PlayerName => Features::PLAYER_NAME_NOTIFY,
            TrackTitle => Features::TRACK_TITLE_NOTIFY,
            TrackDuration => Features::TRACK_DURATION_NOTIFY,
            TrackPosition => Features::TRACK_POSITION_NOTIFY,
            PlaybackSpeed => Features::PLAYBACK_SPEED_NOTIFY,
            SeekingSpeed => Features::SEEKING_SPEED_NOTIFY,
            CurrentTrackObjId => Features::CURRENT_TRACK_OBJ_ID_NOTIFY,
            NextTrackObjId => Features::NEXT_TRACK_OBJ_ID_NOTIFY,
            ParentGroupObjId => Features::PARENT_GROUP_OBJ_ID_NOTIFY,
            CurrentGroupObjId => Features::CURRENT_GROUP_OBJ_ID_NOTIFY,
            PlayingOrder => Features::PLAYING_ORDER_NOTIFY,
            OpcodesSupported => Features::OPCODES_SUPPORTED_NOTIFY,
            _ => return None,
        })
    }

    /// Returns the access properties for the given feature set.
    #[must_use]
    pub fn props(self, feats: Features) -> Prop {
        use Characteristic::*;
        let base = match self {
            TrackChanged => Prop::NOTIFY,
            MediaState | SearchResultsObjId => Prop::READ | Prop::NOTIFY,
            MediaControlPoint | SearchControlPoint => {
                Prop::WRITE | Prop::WRITE_CMD | Prop::NOTIFY
            }
            TrackPosition | PlaybackSpeed | CurrentTrackObjId | NextTrackObjId
            | CurrentGroupObjId | PlayingOrder => Prop::READ | Prop::WRITE | Prop::WRITE_CMD,
            _ => Prop::READ,
        };
        match self.notify_feature() {
            Some(f) if feats.contains(f) => base | Prop::NOTIFY,
            _ => base,
        }
    }

    /// Returns the wire format tag.
    #[must_use]
    pub const fn fmt(self) -> Fmt {
        use Characteristic::*;
        match self {
            PlayerName | PlayerIconUrl | TrackTitle => Fmt::Utf8,
            MediaState | PlayingOrder | ContentControlId => Fmt::U8,
            PlaybackSpeed | SeekingSpeed => Fmt::I8,
            TrackDuration | TrackPosition => Fmt::Interval,
            PlayingOrdersSupported => Fmt::Bits16,
            OpcodesSupported => Fmt::Bits32,
            PlayerIconObjId | TrackSegmentsObjId | CurrentTrackObjId | NextTrackObjId
            | ParentGroupObjId | CurrentGroupObjId | SearchResultsObjId => Fmt::ObjId,
            MediaControlPoint | SearchControlPoint => Fmt::Record,
            TrackChanged => Fmt::Empty,
        }
    }
}

/// Immutable description of one active characteristic.
#[derive(Clone, Copy, Debug)]
pub struct CharacteristicSpec {
    pub chr: Characteristic,
    pub uuid: Uuid16,
    pub props: Prop,
    pub fmt: Fmt,
}

/// Ordered set of characteristics active for one service instance.
#[derive(Clone, Debug)]
pub struct CapabilityTable {
    feats: Features,
    specs: SmallVec<[CharacteristicSpec; 22]>,
}

impl CapabilityTable {
    /// Builds the capability table for the given feature set. Fails if any
    /// part of the mandatory subset is absent.
    pub fn build(feats: Features) -> Result<Self> {
        let missing = Features::MANDATORY.difference(feats);
        if !missing.is_empty() {
            return Err(Error::MissingMandatoryFeature(missing));
        }
        let specs = enum_iterator::all::<Characteristic>()
            .filter(|chr| feats.contains(chr.feature()))
            .map(|chr| CharacteristicSpec {
                chr,
                uuid: chr.uuid(),
                props: chr.props(feats),
                fmt: chr.fmt(),
            })
            .collect();
        Ok(Self { feats, specs })
    }

    /// Returns the feature set the table was built from.
    #[inline(always)]
    #[must_use]
    pub const fn features(&self) -> Features {
        self.feats
    }

    /// Returns the spec of an active characteristic or [`None`] if the
    /// characteristic does not exist in this instance.
    #[inline]
    #[must_use]
    pub fn get(&self, chr: Characteristic) -> Option<&CharacteristicSpec> {
        self.specs.iter().find(|s| s.chr == chr)
    }

    /// Returns whether the characteristic exists in this instance.
    #[inline]
    #[must_use]
    pub fn contains(&self, chr: Characteristic) -> bool {
        self.get(chr).is_some()
    }

    /// Returns the active characteristics in declaration order.
    #[inline(always)]
    pub fn iter(&self) -> impl Iterator<Item = &CharacteristicSpec> {
        self.specs.iter()
    }

    /// Returns the GATT service definition handed to the transport. Every
    /// notifiable characteristic gets a CCC descriptor.
    #[must_use]
    pub fn service_def(&self, uuid: Uuid16) -> ServiceDef {
        ServiceDef {
            uuid,
            characteristics: (self.specs.iter())
                .map(|s| CharacteristicDef {
                    chr: s.chr,
                    uuid: s.uuid,
                    props: s.props,
                    cccd: s.props.contains(Prop::NOTIFY),
                })
                .collect(),
        }
    }
}
