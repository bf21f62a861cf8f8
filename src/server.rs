//! Media control GATT service. Routes transport read/write callbacks through
//! the authorization gate and capability table, dispatches control point
//! writes, and fans out change notifications to subscribed peers.

use std::collections::HashMap;
use std::sync::Arc;

use structbuf::{Pack, StructBuf};
use tracing::{debug, warn};

use crate::caps::{CapabilityTable, Fmt};
use crate::codec::{self, ObjectId};
use crate::sub::SubscriptionRegistry;
use crate::{
    Authorization, AuthorizationProvider, Cccd, Characteristic, CmdResult, Error, ErrorCode,
    GattTransport, MediaState, MediaStateSource, ObjectIdField, Opcode, OpcodeSet, PlayingOrder,
    PlayingOrderSet, Prop, Request, RequestId, Result, SearchItem, SearchResult, SearchType,
    SyncMutex, Uuid16, MAX_SEARCH_LEN,
};

/// Media player state update. Each variant maps to exactly one
/// characteristic.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum PlayerState {
    PlayerName(String),
    PlayerIconObjId(Option<ObjectId>),
    PlayerIconUrl(String),
    /// Current track changed; carries no value.
    TrackChanged,
    TrackTitle(String),
    /// Track duration in milliseconds, [`None`] when unknown.
    TrackDuration(Option<i64>),
    /// Track position in milliseconds, [`None`] when unknown.
    TrackPosition(Option<i64>),
    PlaybackSpeed(f32),
    SeekingSpeed(f32),
    TrackSegmentsObjId(Option<ObjectId>),
    CurrentTrackObjId(Option<ObjectId>),
    NextTrackObjId(Option<ObjectId>),
    ParentGroupObjId(Option<ObjectId>),
    CurrentGroupObjId(Option<ObjectId>),
    PlayingOrder(PlayingOrder),
    PlayingOrdersSupported(PlayingOrderSet),
    MediaState(MediaState),
    OpcodesSupported(OpcodeSet),
    SearchResultsObjId(Option<ObjectId>),
    ContentControlId(u8),
}

impl PlayerState {
    /// Returns the target characteristic and encoded value.
    fn encode(&self) -> (Characteristic, Vec<u8>) {
        use Characteristic as C;
        match *self {
            Self::PlayerName(ref s) => (C::PlayerName, codec::encode_utf8(s)),
            Self::PlayerIconObjId(id) => (C::PlayerIconObjId, codec::encode_object_id(id)),
            Self::PlayerIconUrl(ref s) => (C::PlayerIconUrl, codec::encode_utf8(s)),
            Self::TrackChanged => (C::TrackChanged, Vec::new()),
            Self::TrackTitle(ref s) => (C::TrackTitle, codec::encode_utf8(s)),
            Self::TrackDuration(ms) => (C::TrackDuration, codec::encode_interval(ms).to_vec()),
            Self::TrackPosition(ms) => (C::TrackPosition, codec::encode_interval(ms).to_vec()),
            Self::PlaybackSpeed(v) => (C::PlaybackSpeed, codec::encode_speed(v).to_vec()),
            Self::SeekingSpeed(v) => (C::SeekingSpeed, codec::encode_speed(v).to_vec()),
            Self::TrackSegmentsObjId(id) => (C::TrackSegmentsObjId, codec::encode_object_id(id)),
            Self::CurrentTrackObjId(id) => (C::CurrentTrackObjId, codec::encode_object_id(id)),
            Self::NextTrackObjId(id) => (C::NextTrackObjId, codec::encode_object_id(id)),
            Self::ParentGroupObjId(id) => (C::ParentGroupObjId, codec::encode_object_id(id)),
            Self::CurrentGroupObjId(id) => (C::CurrentGroupObjId, codec::encode_object_id(id)),
            Self::PlayingOrder(v) => (C::PlayingOrder, codec::encode_u8(v.into()).to_vec()),
            Self::PlayingOrdersSupported(m) => {
                (C::PlayingOrdersSupported, m.bits().to_le_bytes().to_vec())
            }
            Self::MediaState(v) => (C::MediaState, codec::encode_u8(v.into()).to_vec()),
            Self::OpcodesSupported(m) => (C::OpcodesSupported, m.bits().to_le_bytes().to_vec()),
            Self::SearchResultsObjId(id) => (C::SearchResultsObjId, codec::encode_object_id(id)),
            Self::ContentControlId(v) => (C::ContentControlId, codec::encode_u8(v).to_vec()),
        }
    }
}

/// Media control GATT service.
///
/// All entry points must be invoked from the transport's callback dispatch
/// context, which is assumed to be serialized: one event is processed to
/// completion before the next is delivered. This is a precondition supplied
/// by the transport, not enforced here. The internal mutex only arbitrates
/// between that context and the owning process calling
/// [`publish`](Self::publish) or the result methods.
///
/// [`MediaStateSource`] callbacks run with the mutex released, so a source
/// may supply a result or republish state from inside the callback.
#[derive(Debug)]
pub struct MediaControlService<T: GattTransport, A, S> {
    transport: T,
    auth: A,
    source: S,
    srv: SyncMutex<Inner<T::Peer>>,
}

/// Deferred media source invocation produced by a validated write. Invoked
/// only after the state mutex guard is released.
#[derive(Debug)]
enum Callback {
    Position(i64),
    Speed(f32),
    ObjId(ObjectIdField, ObjectId),
    Order(PlayingOrder),
    Control(Request),
    Search(Vec<SearchItem>),
}

#[derive(Debug)]
struct Inner<P> {
    caps: Option<CapabilityTable>,
    uuid: Option<Uuid16>,
    /// Authoritative encoded value per active characteristic.
    state: HashMap<Characteristic, Vec<u8>>,
    /// Typed copies of the published masks, used for write gating.
    opcodes: OpcodeSet,
    orders: PlayingOrderSet,
    subs: SubscriptionRegistry<P>,
}

impl<T, A, S> MediaControlService<T, A, S>
where
    T: GattTransport,
    A: AuthorizationProvider<T::Peer>,
    S: MediaStateSource,
{
    /// Creates a new, uninitialized service instance.
    #[must_use]
    pub fn new(transport: T, auth: A, source: S) -> Arc<Self> {
        Arc::new(Self {
            transport,
            auth,
            source,
            srv: SyncMutex::new(Inner {
                caps: None,
                uuid: None,
                state: HashMap::new(),
                opcodes: OpcodeSet::empty(),
                orders: PlayingOrderSet::empty(),
                subs: SubscriptionRegistry::new(),
            }),
        })
    }

    /// Builds the capability table from the state source's feature set and
    /// registers the service with the transport. Fails without registering
    /// anything if the mandatory feature subset is absent.
    pub fn init(&self, uuid: Uuid16) -> Result<()> {
        let caps = CapabilityTable::build(self.source.features())?;
        self.transport.add_service(&caps.service_def(uuid))?;
        let mut srv = self.srv.lock();
        srv.reset(caps, uuid);
        debug!("Media control service {uuid} initialized");
        Ok(())
    }

    /// Removes the service from the transport and drops all server-held
    /// state. Subscription state is dropped unconditionally; the transport
    /// outcome is reported to the caller.
    pub fn destroy(&self) -> Result<()> {
        let uuid = {
            let mut srv = self.srv.lock();
            let uuid = srv.uuid.take().ok_or(Error::NotInitialized)?;
            srv.caps = None;
            srv.state.clear();
            srv.subs.clear();
            uuid
        };
        self.transport.remove_service(uuid)?;
        debug!("Media control service {uuid} destroyed");
        Ok(())
    }

    /// Registers a newly connected peer.
    pub fn peer_connected(&self, peer: &T::Peer) {
        self.srv.lock().subs.connect(peer.clone());
    }

    /// Drops all subscription state for a disconnected peer.
    pub fn peer_disconnected(&self, peer: &T::Peer) {
        self.srv.lock().subs.disconnect(peer);
    }

    /// Handles a characteristic read request.
    pub fn read(&self, peer: &T::Peer, req: RequestId, chr: Characteristic) {
        let srv = self.srv.lock();
        let r = (self.gate(peer)).and_then(|()| srv.check(chr, Prop::READ));
        match r {
            Ok(()) => self.transport.send_response(peer, req, Ok(()), srv.value(chr)),
            Err(e) => {
                warn!("Read of {chr:?} by {peer:?} failed with {e}");
                self.transport.send_response(peer, req, Err(e), &[]);
            }
        }
    }

    /// Handles a characteristic write request. A length mismatch leaves the
    /// server state unmodified and echoes the raw payload back in the error
    /// response (required for compatibility with deployed centrals).
    pub fn write(&self, peer: &T::Peer, req: RequestId, chr: Characteristic, val: &[u8]) {
        let r = {
            let mut srv = self.srv.lock();
            match (self.gate(peer)).and_then(|()| srv.check(chr, Prop::WRITE | Prop::WRITE_CMD)) {
                Ok(()) => self.dispatch_write(&mut srv, chr, val),
                Err(e) => Err(e),
            }
        };
        match r {
            Ok(cb) => {
                self.transport.send_response(peer, req, Ok(()), &[]);
                // The guard is no longer held: the source may re-enter
                // publish or the result methods from the callback.
                if let Some(cb) = cb {
                    self.invoke(cb);
                }
            }
            Err(e) => {
                warn!("Write of {chr:?} by {peer:?} failed with {e}");
                let echo = match e {
                    ErrorCode::InvalidAttributeValueLength => val,
                    _ => &[],
                };
                self.transport.send_response(peer, req, Err(e), echo);
            }
        }
    }

    /// Handles a CCC descriptor read request.
    pub fn descriptor_read(&self, peer: &T::Peer, req: RequestId, chr: Characteristic) {
        let srv = self.srv.lock();
        let r = (self.gate(peer)).and_then(|()| srv.check_cccd(chr));
        match r {
            Ok(()) => {
                let v = srv.subs.cccd(peer, chr).bits().to_le_bytes();
                self.transport.send_response(peer, req, Ok(()), &v);
            }
            Err(e) => {
                warn!("CCCD read of {chr:?} by {peer:?} failed with {e}");
                self.transport.send_response(peer, req, Err(e), &[]);
            }
        }
    }

    /// Handles a CCC descriptor write request.
    pub fn descriptor_write(&self, peer: &T::Peer, req: RequestId, chr: Characteristic, val: &[u8]) {
        let mut srv = self.srv.lock();
        let r = match (self.gate(peer)).and_then(|()| srv.check_cccd(chr)) {
            Ok(()) => Self::set_cccd(&mut srv, peer, chr, val),
            Err(e) => Err(e),
        };
        match r {
            Ok(()) => self.transport.send_response(peer, req, Ok(()), &[]),
            Err(e) => {
                warn!("CCCD write of {chr:?} by {peer:?} failed with {e}");
                let echo = match e {
                    ErrorCode::InvalidAttributeValueLength => val,
                    _ => &[],
                };
                self.transport.send_response(peer, req, Err(e), echo);
            }
        }
    }

    /// Publishes a player state update. The authoritative value is replaced
    /// unconditionally; subscribed, authorized peers are notified only when
    /// the encoded value differs from the last one each of them was sent.
    pub fn publish(&self, state: PlayerState) {
        let mut srv = self.srv.lock();
        if srv.caps.is_none() {
            warn!("Dropping {state:?}: service not initialized");
            return;
        }
        match state {
            PlayerState::OpcodesSupported(m) => srv.opcodes = m,
            PlayerState::PlayingOrdersSupported(m) => srv.orders = m,
            _ => {}
        }
        let (chr, val) = state.encode();
        self.store_and_notify(&mut srv, chr, &val);
    }

    /// Publishes the outcome of a previously forwarded control point request
    /// as an `{opcode, result}` record. Result records always notify; the
    /// change-detection rule applies only to state-valued characteristics.
    pub fn control_request_result(&self, req: Request, result: CmdResult) {
        let mut srv = self.srv.lock();
        if srv.caps.is_none() {
            warn!("Dropping result for {req:?}: service not initialized");
            return;
        }
        let mut b = StructBuf::new(2);
        b.append().u8(req.opcode).u8(result);
        self.store_and_notify(&mut srv, Characteristic::MediaControlPoint, b.as_ref());
    }

    /// Publishes the outcome of a previously forwarded search request,
    /// along with the search results object identifier when one exists.
    pub fn search_request_result(&self, result: SearchResult, obj: Option<ObjectId>) {
        let mut srv = self.srv.lock();
        if srv.caps.is_none() {
            warn!("Dropping search result {result:?}: service not initialized");
            return;
        }
        self.finish_search(&mut srv, result, obj);
    }

    /// Maps the external authorization decision to an ATT status. Checked
    /// before anything else, including length validation.
    fn gate(&self, peer: &T::Peer) -> std::result::Result<(), ErrorCode> {
        match self.auth.authorize(peer) {
            Authorization::Allowed => Ok(()),
            v => {
                debug!("Access by {peer:?} denied: {v:?}");
                Err(ErrorCode::InsufficientAuthorization)
            }
        }
    }

    /// Decodes a validated characteristic write. State values are stored and
    /// notified under the caller's guard; the returned source callback must
    /// be invoked only after the guard is released.
    fn dispatch_write(
        &self,
        srv: &mut Inner<T::Peer>,
        chr: Characteristic,
        val: &[u8],
    ) -> std::result::Result<Option<Callback>, ErrorCode> {
        use Characteristic as C;
        const LEN: ErrorCode = ErrorCode::InvalidAttributeValueLength;
        let cb = match chr {
            C::TrackPosition => Callback::Position(codec::decode_interval(val).ok_or(LEN)?),
            C::PlaybackSpeed => Callback::Speed(codec::decode_speed(val).ok_or(LEN)?),
            C::CurrentTrackObjId => Callback::ObjId(
                ObjectIdField::CurrentTrack,
                codec::decode_object_id(val).ok_or(LEN)?,
            ),
            C::NextTrackObjId => Callback::ObjId(
                ObjectIdField::NextTrack,
                codec::decode_object_id(val).ok_or(LEN)?,
            ),
            C::CurrentGroupObjId => Callback::ObjId(
                ObjectIdField::CurrentGroup,
                codec::decode_object_id(val).ok_or(LEN)?,
            ),
            C::PlayingOrder => {
                let raw = codec::decode_u8(val).ok_or(LEN)?;
                let Ok(order) = PlayingOrder::try_from(raw) else {
                    debug!("Ignoring unknown playing order {raw:#04X}");
                    return Ok(None);
                };
                if !srv.orders.contains(order.mask()) {
                    debug!("Ignoring unsupported playing order {order:?}");
                    return Ok(None);
                }
                Callback::Order(order)
            }
            C::MediaControlPoint => return self.control_point_write(srv, val),
            C::SearchControlPoint => return self.search_point_write(srv, val),
            // Unreachable through the router: props deny writes
            _ => return Err(ErrorCode::WriteNotPermitted),
        };
        self.store_and_notify(srv, chr, val);
        Ok(Some(cb))
    }

    fn invoke(&self, cb: Callback) {
        match cb {
            Callback::Position(ms) => self.source.set_track_position(ms),
            Callback::Speed(v) => self.source.set_playback_speed(v),
            Callback::ObjId(field, id) => self.source.set_object_id(field, id),
            Callback::Order(order) => self.source.set_playing_order(order),
            Callback::Control(req) => self.source.control_request(req),
            Callback::Search(query) => self.source.search_request(query),
        }
    }

    /// Media control point write ([MCS] Section 3.20). Exactly one byte for
    /// parameterless opcodes, five for opcodes carrying a signed 32-bit
    /// parameter. Unknown and currently unsupported opcodes are swallowed
    /// without a callback, an error, or a result record.
    fn control_point_write(
        &self,
        srv: &Inner<T::Peer>,
        val: &[u8],
    ) -> std::result::Result<Option<Callback>, ErrorCode> {
        if val.len() != 1 && val.len() != 5 {
            return Err(ErrorCode::InvalidAttributeValueLength);
        }
        let Ok(opcode) = Opcode::try_from(val[0]) else {
            debug!("Ignoring unknown control point opcode {:#04X}", val[0]);
            return Ok(None);
        };
        let param = match (opcode.has_param(), val.len()) {
            (false, 1) => None,
            (true, 5) => codec::decode_i32(&val[1..]),
            _ => return Err(ErrorCode::InvalidAttributeValueLength),
        };
        if !srv.opcodes.contains(opcode.mask()) {
            debug!("Ignoring unsupported opcode {opcode:?}");
            return Ok(None);
        }
        Ok(Some(Callback::Control(Request { opcode, param })))
    }

    /// Search control point write ([MCS] Section 3.23). A structurally
    /// invalid item list completes with the Failure result code rather than
    /// a transport error.
    fn search_point_write(
        &self,
        srv: &mut Inner<T::Peer>,
        val: &[u8],
    ) -> std::result::Result<Option<Callback>, ErrorCode> {
        if !(2..=MAX_SEARCH_LEN).contains(&val.len()) {
            return Err(ErrorCode::InvalidAttributeValueLength);
        }
        match parse_search(val) {
            Some(query) => Ok(Some(Callback::Search(query))),
            None => {
                debug!("Malformed search request");
                self.finish_search(srv, SearchResult::Failure, None);
                Ok(None)
            }
        }
    }

    fn finish_search(&self, srv: &mut Inner<T::Peer>, result: SearchResult, obj: Option<ObjectId>) {
        let v = codec::encode_u8(result.into());
        self.store_and_notify(srv, Characteristic::SearchControlPoint, &v);
        if let Some(id) = obj {
            let v = codec::encode_object_id(Some(id));
            self.store_and_notify(srv, Characteristic::SearchResultsObjId, &v);
        }
    }

    /// Replaces the authoritative value and notifies subscribed, authorized
    /// peers. Control point records and Track Changed bypass change
    /// detection; everything else is deduplicated per peer.
    fn store_and_notify(&self, srv: &mut Inner<T::Peer>, chr: Characteristic, val: &[u8]) {
        let Some((notifiable, force)) = (srv.caps.as_ref())
            .and_then(|c| c.get(chr))
            .map(|s| (s.props.contains(Prop::NOTIFY), matches!(s.fmt, Fmt::Record | Fmt::Empty)))
        else {
            debug!("Dropping {chr:?} update: characteristic not active");
            return;
        };
        srv.state.insert(chr, val.to_vec());
        if !notifiable {
            return;
        }
        for peer in self.transport.connected_peers() {
            if !matches!(self.auth.authorize(&peer), Authorization::Allowed) {
                continue;
            }
            let send = if force {
                srv.subs.subscribed(&peer, chr)
            } else {
                srv.subs.note(&peer, chr, val)
            };
            if send {
                self.transport.notify(&peer, chr, val);
            }
        }
    }

    fn set_cccd(
        srv: &mut Inner<T::Peer>,
        peer: &T::Peer,
        chr: Characteristic,
        val: &[u8],
    ) -> std::result::Result<(), ErrorCode> {
        let raw = codec::decode_cccd(val).ok_or(ErrorCode::InvalidAttributeValueLength)?;
        let cccd = Cccd::from_bits(raw).ok_or(ErrorCode::ValueNotAllowed)?;
        srv.subs.set_cccd(peer, chr, cccd);
        Ok(())
    }
}

impl<P: Clone + Eq + std::hash::Hash> Inner<P> {
    /// Seeds default values for every active characteristic.
    fn reset(&mut self, caps: CapabilityTable, uuid: Uuid16) {
        use Characteristic as C;
        self.state.clear();
        self.subs.clear();
        self.opcodes = OpcodeSet::empty();
        self.orders = PlayingOrderSet::empty();
        for s in caps.iter() {
            let v = match s.chr {
                C::MediaState => codec::encode_u8(MediaState::Inactive.into()).to_vec(),
                C::PlayingOrder => codec::encode_u8(PlayingOrder::InOrderOnce.into()).to_vec(),
                C::ContentControlId => codec::encode_u8(0).to_vec(),
                _ => match s.fmt {
                    Fmt::I8 => codec::encode_speed(1.0).to_vec(),
                    Fmt::Interval => codec::encode_interval(None).to_vec(),
                    Fmt::Bits16 => 0_u16.to_le_bytes().to_vec(),
                    Fmt::Bits32 => 0_u32.to_le_bytes().to_vec(),
                    _ => Vec::new(),
                },
            };
            self.state.insert(s.chr, v);
        }
        self.caps = Some(caps);
        self.uuid = Some(uuid);
    }

    /// Verifies that the characteristic exists in this instance and permits
    /// the requested access.
    fn check(&self, chr: Characteristic, want: Prop) -> std::result::Result<(), ErrorCode> {
        let caps = self.caps.as_ref().ok_or(ErrorCode::UnlikelyError)?;
        let spec = caps.get(chr).ok_or(ErrorCode::AttributeNotFound)?;
        if spec.props.intersects(want) {
            Ok(())
        } else if want.contains(Prop::READ) {
            Err(ErrorCode::ReadNotPermitted)
        } else {
            Err(ErrorCode::WriteNotPermitted)
        }
    }

    /// Verifies that the characteristic exists and carries a CCC descriptor.
    fn check_cccd(&self, chr: Characteristic) -> std::result::Result<(), ErrorCode> {
        let caps = self.caps.as_ref().ok_or(ErrorCode::UnlikelyError)?;
        match caps.get(chr) {
            Some(s) if s.props.contains(Prop::NOTIFY) => Ok(()),
            _ => Err(ErrorCode::AttributeNotFound),
        }
    }

    /// Returns the authoritative encoded value.
    fn value(&self, chr: Characteristic) -> &[u8] {
        self.state.get(&chr).map_or(&[], Vec::as_slice)
    }
}

/// Parses a search control point item list: `{len, type, param}` with `len`
/// counting the type byte. Returns [`None`] for any structural violation.
fn parse_search(mut v: &[u8]) -> Option<Vec<SearchItem>> {
    let mut items = Vec::new();
    while let Some((&n, rest)) = v.split_first() {
        let n = usize::from(n);
        if n == 0 || n > rest.len() {
            return None;
        }
        let (item, tail) = rest.split_at(n);
        let (&typ, param) = item.split_first()?;
        items.push(search_item(typ, param)?);
        v = tail;
    }
    (!items.is_empty()).then_some(items)
}

fn search_item(typ: u8, param: &[u8]) -> Option<SearchItem> {
    let typ = SearchType::try_from(typ).ok()?;
    let text = |b: &[u8]| std::str::from_utf8(b).ok().map(str::to_owned);
    Some(match typ {
        SearchType::TrackName => SearchItem::TrackName(text(param)?),
        SearchType::ArtistName => SearchItem::ArtistName(text(param)?),
        SearchType::AlbumName => SearchItem::AlbumName(text(param)?),
        SearchType::GroupName => SearchItem::GroupName(text(param)?),
        SearchType::EarliestYear => SearchItem::EarliestYear(text(param)?),
        SearchType::LatestYear => SearchItem::LatestYear(text(param)?),
        SearchType::Genre => SearchItem::Genre(text(param)?),
        SearchType::OnlyTracks if param.is_empty() => SearchItem::OnlyTracks,
        SearchType::OnlyGroups if param.is_empty() => SearchItem::OnlyGroups,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use matches::assert_matches;

    use super::*;
    use crate::{Features, ServiceDef, Status, TransportError, GENERIC_MEDIA_CONTROL_SERVICE};

    const PEER: u32 = 7;

    #[derive(Debug, Default)]
    struct Transport {
        fail: bool,
        peers: SyncMutex<Vec<u32>>,
        services: SyncMutex<Vec<ServiceDef>>,
        notified: SyncMutex<Vec<(u32, Characteristic, Vec<u8>)>>,
        responses: SyncMutex<Vec<(RequestId, Status, Vec<u8>)>>,
    }

    impl GattTransport for Arc<Transport> {
        type Peer = u32;

        fn add_service(&self, def: &ServiceDef) -> std::result::Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::AddService);
            }
            self.services.lock().push(def.clone());
            Ok(())
        }

        fn remove_service(&self, uuid: Uuid16) -> std::result::Result<(), TransportError> {
            self.services.lock().retain(|d| d.uuid != uuid);
            Ok(())
        }

        fn notify(&self, peer: &u32, chr: Characteristic, val: &[u8]) {
            self.notified.lock().push((*peer, chr, val.to_vec()));
        }

        fn send_response(&self, _peer: &u32, req: RequestId, status: Status, val: &[u8]) {
            self.responses.lock().push((req, status, val.to_vec()));
        }

        fn connected_peers(&self) -> Vec<u32> {
            self.peers.lock().clone()
        }
    }

    #[derive(Debug, Default)]
    struct Auth(SyncMutex<HashMap<u32, Authorization>>);

    impl AuthorizationProvider<u32> for Arc<Auth> {
        fn authorize(&self, peer: &u32) -> Authorization {
            (self.0.lock().get(peer).copied()).unwrap_or(Authorization::Allowed)
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    enum Call {
        ObjId(ObjectIdField, ObjectId),
        Position(i64),
        Speed(f32),
        Order(PlayingOrder),
        Control(Request),
        Search(Vec<SearchItem>),
    }

    #[derive(Debug)]
    struct Source {
        feats: Features,
        calls: SyncMutex<Vec<Call>>,
    }

    impl Source {
        fn new(feats: Features) -> Arc<Self> {
            Arc::new(Self {
                feats,
                calls: SyncMutex::new(Vec::new()),
            })
        }
    }

    impl MediaStateSource for Arc<Source> {
        fn features(&self) -> Features {
            self.feats
        }
        fn set_object_id(&self, field: ObjectIdField, id: ObjectId) {
            self.calls.lock().push(Call::ObjId(field, id));
        }
        fn set_track_position(&self, ms: i64) {
            self.calls.lock().push(Call::Position(ms));
        }
        fn set_playback_speed(&self, speed: f32) {
            self.calls.lock().push(Call::Speed(speed));
        }
        fn set_playing_order(&self, order: PlayingOrder) {
            self.calls.lock().push(Call::Order(order));
        }
        fn control_request(&self, req: Request) {
            self.calls.lock().push(Call::Control(req));
        }
        fn search_request(&self, query: Vec<SearchItem>) {
            self.calls.lock().push(Call::Search(query));
        }
    }

    type Service = MediaControlService<Arc<Transport>, Arc<Auth>, Arc<Source>>;

    struct Fix {
        sv: Arc<Service>,
        tr: Arc<Transport>,
        auth: Arc<Auth>,
        src: Arc<Source>,
    }

    fn fix(feats: Features) -> Fix {
        let tr = Arc::new(Transport::default());
        tr.peers.lock().push(PEER);
        let auth = Arc::new(Auth::default());
        let src = Source::new(feats);
        let sv = MediaControlService::new(Arc::clone(&tr), Arc::clone(&auth), Arc::clone(&src));
        sv.init(GENERIC_MEDIA_CONTROL_SERVICE).unwrap();
        sv.peer_connected(&PEER);
        Fix { sv, tr, auth, src }
    }

    fn full() -> Fix {
        fix(Features::all())
    }

    impl Fix {
        fn last_response(&self) -> (RequestId, Status, Vec<u8>) {
            self.tr.responses.lock().last().cloned().unwrap()
        }

        fn subscribe(&self, chr: Characteristic) {
            let v = Cccd::NOTIFY.bits().to_le_bytes();
            self.sv.descriptor_write(&PEER, RequestId(0), chr, &v);
            assert_eq!(self.last_response().1, Ok(()));
        }

        fn read_value(&self, chr: Characteristic) -> Vec<u8> {
            self.sv.read(&PEER, RequestId(9), chr);
            let (_, status, val) = self.last_response();
            assert_eq!(status, Ok(()));
            val
        }

        fn write_ok(&self, chr: Characteristic, val: &[u8]) {
            self.sv.write(&PEER, RequestId(8), chr, val);
            assert_eq!(self.last_response().1, Ok(()));
        }

        fn notifications_for(&self, peer: u32, chr: Characteristic) -> Vec<Vec<u8>> {
            (self.tr.notified.lock().iter())
                .filter(|&&(p, c, _)| p == peer && c == chr)
                .map(|(.., v)| v.clone())
                .collect()
        }

        fn notifications(&self, chr: Characteristic) -> Vec<Vec<u8>> {
            self.notifications_for(PEER, chr)
        }

        fn calls(&self) -> Vec<Call> {
            self.src.calls.lock().clone()
        }
    }

    #[test]
    fn init_exposes_feature_gated_characteristics() {
        let f = fix(Features::MANDATORY);
        {
            let services = f.tr.services.lock();
            assert_eq!(services[0].uuid, GENERIC_MEDIA_CONTROL_SERVICE);
            assert_eq!(services[0].characteristics.len(), 6);
        }
        // Disabled characteristics are absent, not just access-protected
        f.sv.read(&PEER, RequestId(1), Characteristic::PlaybackSpeed);
        assert_eq!(f.last_response().1, Err(ErrorCode::AttributeNotFound));
    }

    #[test]
    fn init_requires_mandatory_features() {
        let tr = Arc::new(Transport::default());
        let src = Source::new(Features::MANDATORY.difference(Features::TRACK_TITLE));
        let sv = MediaControlService::new(Arc::clone(&tr), Arc::new(Auth::default()), src);
        assert_matches!(
            sv.init(GENERIC_MEDIA_CONTROL_SERVICE),
            Err(Error::MissingMandatoryFeature(Features::TRACK_TITLE))
        );
        assert!(tr.services.lock().is_empty());
    }

    #[test]
    fn init_surfaces_transport_failure() {
        let tr = Arc::new(Transport {
            fail: true,
            ..Transport::default()
        });
        let sv = MediaControlService::new(
            Arc::clone(&tr),
            Arc::new(Auth::default()),
            Source::new(Features::all()),
        );
        assert_matches!(
            sv.init(GENERIC_MEDIA_CONTROL_SERVICE),
            Err(Error::Transport(TransportError::AddService))
        );
    }

    #[test]
    fn destroy_unregisters_and_clears() {
        let f = full();
        f.subscribe(Characteristic::TrackTitle);
        f.sv.destroy().unwrap();
        assert!(f.tr.services.lock().is_empty());
        assert_matches!(f.sv.destroy(), Err(Error::NotInitialized));
        // Updates after teardown are dropped
        f.sv.publish(PlayerState::TrackTitle("x".into()));
        assert!(f.notifications(Characteristic::TrackTitle).is_empty());
    }

    #[test]
    fn read_defaults() {
        let f = full();
        assert_eq!(f.read_value(Characteristic::PlayerName), Vec::<u8>::new());
        assert_eq!(f.read_value(Characteristic::TrackDuration), [0xFF; 4]);
        assert_eq!(f.read_value(Characteristic::TrackPosition), [0xFF; 4]);
        assert_eq!(f.read_value(Characteristic::MediaState), [0x00]);
        assert_eq!(f.read_value(Characteristic::PlayingOrder), [0x03]);
        assert_eq!(f.read_value(Characteristic::PlaybackSpeed), [0]);
        assert_eq!(f.read_value(Characteristic::CurrentTrackObjId), Vec::<u8>::new());
        assert_eq!(f.read_value(Characteristic::OpcodesSupported), [0; 4]);
        assert_eq!(f.read_value(Characteristic::ContentControlId), [0]);
    }

    #[test]
    fn unauthorized_access() {
        let f = full();
        f.auth.0.lock().insert(PEER, Authorization::Rejected);
        f.sv.read(&PEER, RequestId(1), Characteristic::PlayerName);
        let e = Err(ErrorCode::InsufficientAuthorization);
        assert_eq!(f.last_response(), (RequestId(1), e, vec![]));
        f.sv.write(&PEER, RequestId(2), Characteristic::TrackPosition, &100_i32.to_le_bytes());
        assert_eq!(f.last_response().1, e);
        f.sv.descriptor_write(&PEER, RequestId(3), Characteristic::MediaState, &[1, 0]);
        assert_eq!(f.last_response().1, e);
        assert!(f.calls().is_empty());
        // No recorded decision is the same as a rejection
        f.auth.0.lock().insert(PEER, Authorization::Unknown);
        f.sv.read(&PEER, RequestId(4), Characteristic::PlayerName);
        assert_eq!(f.last_response().1, e);
    }

    #[test]
    fn access_props() {
        let f = full();
        // Track Changed is notify-only
        f.sv.read(&PEER, RequestId(1), Characteristic::TrackChanged);
        assert_eq!(f.last_response().1, Err(ErrorCode::ReadNotPermitted));
        // Player Name is read-only
        f.sv.write(&PEER, RequestId(2), Characteristic::PlayerName, b"x");
        assert_eq!(f.last_response().1, Err(ErrorCode::WriteNotPermitted));
        // Control points are write-only
        f.sv.read(&PEER, RequestId(3), Characteristic::MediaControlPoint);
        assert_eq!(f.last_response().1, Err(ErrorCode::ReadNotPermitted));
    }

    #[test]
    fn state_writes_reach_the_player() {
        let f = full();
        f.write_ok(Characteristic::TrackPosition, &100_i32.to_le_bytes());
        f.write_ok(Characteristic::PlaybackSpeed, &[64]);
        let id = ObjectId::new(0xABCD).unwrap();
        f.write_ok(Characteristic::NextTrackObjId, &id.to_le_bytes());
        assert_eq!(
            f.calls(),
            [
                Call::Position(1000),
                Call::Speed(2.0),
                Call::ObjId(ObjectIdField::NextTrack, id),
            ]
        );
        // Valid writes become the authoritative value
        assert_eq!(f.read_value(Characteristic::NextTrackObjId), id.to_le_bytes());
    }

    #[test]
    fn length_mismatch_echoes_payload() {
        let f = full();
        let id = ObjectId::new(1).unwrap();
        f.write_ok(Characteristic::CurrentTrackObjId, &id.to_le_bytes());
        for bad in [&[0_u8; 5][..], &[0; 7]] {
            f.sv.write(&PEER, RequestId(5), Characteristic::CurrentTrackObjId, bad);
            let e = Err(ErrorCode::InvalidAttributeValueLength);
            assert_eq!(f.last_response(), (RequestId(5), e, bad.to_vec()));
        }
        // The prior value and the player are untouched
        assert_eq!(f.read_value(Characteristic::CurrentTrackObjId), id.to_le_bytes());
        assert_eq!(f.calls().len(), 1);
    }

    #[test]
    fn unsupported_opcode_is_silent() {
        let f = full();
        f.subscribe(Characteristic::MediaControlPoint);
        f.sv.publish(PlayerState::OpcodesSupported(OpcodeSet::PAUSE));
        f.write_ok(Characteristic::MediaControlPoint, &[u8::from(Opcode::Play)]);
        // Unknown opcode bytes are equally silent
        f.write_ok(Characteristic::MediaControlPoint, &[0x7F]);
        assert!(f.calls().is_empty());
        assert!(f.notifications(Characteristic::MediaControlPoint).is_empty());
    }

    #[test]
    fn control_request_round_trip() {
        let f = full();
        f.subscribe(Characteristic::MediaControlPoint);
        f.sv.publish(PlayerState::OpcodesSupported(OpcodeSet::all()));
        let mut w = vec![u8::from(Opcode::MoveRelative)];
        w.extend_from_slice(&(-2500_i32).to_le_bytes());
        f.write_ok(Characteristic::MediaControlPoint, &w);
        let req = Request {
            opcode: Opcode::MoveRelative,
            param: Some(-2500),
        };
        assert_eq!(f.calls(), [Call::Control(req)]);

        f.sv.control_request_result(req, CmdResult::Success);
        f.sv.control_request_result(req, CmdResult::Success);
        // Result records are never deduplicated
        let rec = vec![u8::from(Opcode::MoveRelative), u8::from(CmdResult::Success)];
        assert_eq!(f.notifications(Characteristic::MediaControlPoint), [rec.clone(), rec]);
    }

    #[test]
    fn control_point_length_rules() {
        let f = full();
        f.sv.publish(PlayerState::OpcodesSupported(OpcodeSet::all()));
        let e = Err(ErrorCode::InvalidAttributeValueLength);
        // Parameterless opcode with a parameter
        let w = [u8::from(Opcode::Play), 0, 0, 0, 0];
        f.sv.write(&PEER, RequestId(1), Characteristic::MediaControlPoint, &w);
        assert_eq!(f.last_response(), (RequestId(1), e, w.to_vec()));
        // Parameterized opcode without one
        let w = [u8::from(Opcode::GotoTrack)];
        f.sv.write(&PEER, RequestId(2), Characteristic::MediaControlPoint, &w);
        assert_eq!(f.last_response().1, e);
        // Lengths other than 1 and 5 fail even for unknown opcodes
        f.sv.write(&PEER, RequestId(3), Characteristic::MediaControlPoint, &[0x7F, 0]);
        assert_eq!(f.last_response().1, e);
        assert!(f.calls().is_empty());
    }

    #[test]
    fn playing_order_gating() {
        let f = full();
        f.sv.publish(PlayerState::PlayingOrdersSupported(PlayingOrderSet::IN_ORDER_REPEAT));
        f.write_ok(Characteristic::PlayingOrder, &[u8::from(PlayingOrder::ShuffleOnce)]);
        f.write_ok(Characteristic::PlayingOrder, &[0x7F]);
        assert!(f.calls().is_empty());
        assert_eq!(f.read_value(Characteristic::PlayingOrder), [0x03]);
        f.write_ok(Characteristic::PlayingOrder, &[u8::from(PlayingOrder::InOrderRepeat)]);
        assert_eq!(f.calls(), [Call::Order(PlayingOrder::InOrderRepeat)]);
        assert_eq!(f.read_value(Characteristic::PlayingOrder), [0x04]);
    }

    #[test]
    fn notification_dedup() {
        const PEER2: u32 = 8;
        let f = full();
        f.tr.peers.lock().push(PEER2);
        f.sv.peer_connected(&PEER2);
        f.subscribe(Characteristic::TrackTitle);
        f.sv.publish(PlayerState::TrackTitle("X".into()));
        f.sv.publish(PlayerState::TrackTitle("X".into()));
        assert_eq!(f.notifications(Characteristic::TrackTitle), [b"X".to_vec()]);

        // A late subscriber gets its own first copy of a value the other
        // peer has already seen
        let v = Cccd::NOTIFY.bits().to_le_bytes();
        f.sv.descriptor_write(&PEER2, RequestId(0), Characteristic::TrackTitle, &v);
        f.sv.publish(PlayerState::TrackTitle("X".into()));
        assert_eq!(f.notifications(Characteristic::TrackTitle), [b"X".to_vec()]);
        assert_eq!(f.notifications_for(PEER2, Characteristic::TrackTitle), [b"X".to_vec()]);

        f.sv.publish(PlayerState::TrackTitle("Y".into()));
        assert_eq!(
            f.notifications(Characteristic::TrackTitle),
            [b"X".to_vec(), b"Y".to_vec()]
        );
        assert_eq!(
            f.notifications_for(PEER2, Characteristic::TrackTitle),
            [b"X".to_vec(), b"Y".to_vec()]
        );

        // Unsubscribed characteristics update silently
        f.sv.publish(PlayerState::MediaState(MediaState::Playing));
        assert!(f.notifications(Characteristic::MediaState).is_empty());
        assert_eq!(f.read_value(Characteristic::MediaState), [0x01]);
    }

    #[test]
    fn track_changed_always_notifies() {
        let f = full();
        f.subscribe(Characteristic::TrackChanged);
        f.sv.publish(PlayerState::TrackChanged);
        f.sv.publish(PlayerState::TrackChanged);
        assert_eq!(f.notifications(Characteristic::TrackChanged).len(), 2);
    }

    #[test]
    fn durations_cross_the_wire_in_tenths() {
        let f = full();
        f.sv.publish(PlayerState::TrackDuration(Some(1000)));
        assert_eq!(f.read_value(Characteristic::TrackDuration), 100_i32.to_le_bytes());
        f.sv.publish(PlayerState::TrackDuration(None));
        assert_eq!(f.read_value(Characteristic::TrackDuration), [0xFF; 4]);
    }

    #[test]
    fn search_round_trip() {
        let f = full();
        f.subscribe(Characteristic::SearchControlPoint);
        f.subscribe(Characteristic::SearchResultsObjId);
        let mut w = vec![5, u8::from(SearchType::Genre)];
        w.extend_from_slice(b"Rock");
        w.extend_from_slice(&[1, u8::from(SearchType::OnlyTracks)]);
        f.write_ok(Characteristic::SearchControlPoint, &w);
        let query = vec![SearchItem::Genre("Rock".into()), SearchItem::OnlyTracks];
        assert_eq!(f.calls(), [Call::Search(query)]);

        let id = ObjectId::new(0x42).unwrap();
        f.sv.search_request_result(SearchResult::Success, Some(id));
        assert_eq!(f.notifications(Characteristic::SearchControlPoint), [vec![0x01]]);
        assert_eq!(
            f.notifications(Characteristic::SearchResultsObjId),
            [id.to_le_bytes().to_vec()]
        );
        assert_eq!(f.read_value(Characteristic::SearchResultsObjId), id.to_le_bytes());
    }

    #[test]
    fn malformed_search_fails_without_callback() {
        let f = full();
        f.subscribe(Characteristic::SearchControlPoint);
        // Item length overruns the payload
        f.write_ok(Characteristic::SearchControlPoint, &[9, 0x01, b'a']);
        // Parameter on a parameterless item type
        f.write_ok(Characteristic::SearchControlPoint, &[2, 0x08, 0]);
        // Unknown item type
        f.write_ok(Characteristic::SearchControlPoint, &[2, 0x7F, 0]);
        assert!(f.calls().is_empty());
        assert_eq!(
            f.notifications(Characteristic::SearchControlPoint),
            vec![vec![0x02]; 3]
        );
    }

    #[test]
    fn search_length_limits() {
        let f = full();
        let e = Err(ErrorCode::InvalidAttributeValueLength);
        f.sv.write(&PEER, RequestId(1), Characteristic::SearchControlPoint, &[1]);
        assert_eq!(f.last_response().1, e);
        let long = vec![0x01; 65];
        f.sv.write(&PEER, RequestId(2), Characteristic::SearchControlPoint, &long);
        assert_eq!(f.last_response(), (RequestId(2), e, long));
        // A 64-byte write is the accepted maximum
        let mut max = vec![63, 0x01];
        max.extend_from_slice(&[b'a'; 62]);
        f.write_ok(Characteristic::SearchControlPoint, &max);
        assert_eq!(f.calls().len(), 1);
    }

    #[test]
    fn cccd_round_trip() {
        let f = full();
        f.sv.descriptor_read(&PEER, RequestId(1), Characteristic::MediaState);
        assert_eq!(f.last_response(), (RequestId(1), Ok(()), vec![0, 0]));
        f.subscribe(Characteristic::MediaState);
        f.sv.descriptor_read(&PEER, RequestId(2), Characteristic::MediaState);
        assert_eq!(f.last_response(), (RequestId(2), Ok(()), vec![1, 0]));
        // One byte is a length violation, echoed back
        f.sv.descriptor_write(&PEER, RequestId(3), Characteristic::MediaState, &[1]);
        let e = Err(ErrorCode::InvalidAttributeValueLength);
        assert_eq!(f.last_response(), (RequestId(3), e, vec![1]));
        // Reserved bits are rejected
        f.sv.descriptor_write(&PEER, RequestId(4), Characteristic::MediaState, &[4, 0]);
        assert_eq!(f.last_response().1, Err(ErrorCode::ValueNotAllowed));
        // No descriptor without the notify property
        f.sv.descriptor_read(&PEER, RequestId(5), Characteristic::ContentControlId);
        assert_eq!(f.last_response().1, Err(ErrorCode::AttributeNotFound));
    }

    #[test]
    fn disconnect_drops_subscriptions() {
        let f = full();
        f.subscribe(Characteristic::TrackTitle);
        f.sv.peer_disconnected(&PEER);
        f.sv.peer_connected(&PEER);
        f.sv.publish(PlayerState::TrackTitle("X".into()));
        assert!(f.notifications(Characteristic::TrackTitle).is_empty());
    }

    /// Player that answers every request from inside the callback itself.
    #[derive(Debug, Default)]
    struct InlineSource {
        sv: SyncMutex<Option<Arc<MediaControlService<Arc<Transport>, Arc<Auth>, Arc<InlineSource>>>>>,
    }

    impl InlineSource {
        fn service(
            &self,
        ) -> Arc<MediaControlService<Arc<Transport>, Arc<Auth>, Arc<InlineSource>>> {
            Arc::clone(self.sv.lock().as_ref().unwrap())
        }
    }

    impl MediaStateSource for Arc<InlineSource> {
        fn features(&self) -> Features {
            Features::all()
        }
        fn set_object_id(&self, _field: ObjectIdField, _id: ObjectId) {}
        fn set_track_position(&self, ms: i64) {
            self.service().publish(PlayerState::TrackPosition(Some(ms)));
        }
        fn set_playback_speed(&self, _speed: f32) {}
        fn set_playing_order(&self, _order: PlayingOrder) {}
        fn control_request(&self, req: Request) {
            self.service().control_request_result(req, CmdResult::Success);
        }
        fn search_request(&self, _query: Vec<SearchItem>) {
            self.service().search_request_result(SearchResult::Success, None);
        }
    }

    #[test]
    fn callback_may_answer_inline() {
        let tr = Arc::new(Transport::default());
        tr.peers.lock().push(PEER);
        let auth = Arc::new(Auth::default());
        let src = Arc::new(InlineSource::default());
        let sv = MediaControlService::new(Arc::clone(&tr), auth, Arc::clone(&src));
        *src.sv.lock() = Some(Arc::clone(&sv));
        sv.init(GENERIC_MEDIA_CONTROL_SERVICE).unwrap();
        sv.peer_connected(&PEER);
        let v = Cccd::NOTIFY.bits().to_le_bytes();
        sv.descriptor_write(&PEER, RequestId(0), Characteristic::MediaControlPoint, &v);
        sv.descriptor_write(&PEER, RequestId(0), Characteristic::SearchControlPoint, &v);
        sv.publish(PlayerState::OpcodesSupported(OpcodeSet::all()));

        // The result record is produced from within the control callback
        sv.write(&PEER, RequestId(1), Characteristic::MediaControlPoint, &[u8::from(Opcode::Play)]);
        assert_eq!(tr.responses.lock().last().unwrap().1, Ok(()));
        let rec = vec![u8::from(Opcode::Play), u8::from(CmdResult::Success)];
        let mcp: Vec<Vec<u8>> = (tr.notified.lock().iter())
            .filter(|&&(_, c, _)| c == Characteristic::MediaControlPoint)
            .map(|(.., v)| v.clone())
            .collect();
        assert_eq!(mcp, [rec]);

        // Republishing the position from its own set callback completes too
        sv.write(&PEER, RequestId(2), Characteristic::TrackPosition, &100_i32.to_le_bytes());
        assert_eq!(tr.responses.lock().last().unwrap().1, Ok(()));

        sv.write(&PEER, RequestId(3), Characteristic::SearchControlPoint, &[1, 0x08]);
        assert_eq!(tr.responses.lock().last().unwrap().1, Ok(()));
        let scp: Vec<Vec<u8>> = (tr.notified.lock().iter())
            .filter(|&&(_, c, _)| c == Characteristic::SearchControlPoint)
            .map(|(.., v)| v.clone())
            .collect();
        assert_eq!(scp, [vec![0x01]]);
    }

    #[test]
    fn notifications_require_authorization() {
        let f = full();
        f.subscribe(Characteristic::TrackTitle);
        f.auth.0.lock().insert(PEER, Authorization::Rejected);
        f.sv.publish(PlayerState::TrackTitle("X".into()));
        assert!(f.notifications(Characteristic::TrackTitle).is_empty());
    }
}
