//! Event bridge: engine callbacks in, ordered application events out.
//!
//! Registration with the engine is lazy and reference-counted: the callback
//! for a kind is installed when the first subscriber attaches and removed
//! when the last detaches. Payloads are copied out of engine-owned buffers at
//! the boundary; delivery happens on the iteration task through a single
//! configurable invoker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crate::engine::{Engine, EngineCallback, FileControl, RawEvent, UserStatus};
use crate::identity::PublicKey;

/// Every distinct notification the bridge can surface. `Connected` and
/// `Disconnected` are synthesized by the iteration loop and have no
/// engine-side registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FriendRequest,
    FriendMessage,
    FriendAction,
    NameChange,
    StatusMessageChange,
    UserStatusChange,
    TypingChange,
    FriendConnectionStatus,
    FileSendRequest,
    FileControl,
    FileData,
    ReadReceipt,
    AvatarInfo,
    AvatarData,
    GroupInvite,
    GroupMessage,
    GroupAction,
    GroupTopicChange,
    GroupPeerJoined,
    GroupPeerLeft,
    GroupPeerlistUpdate,
    LossyPacket,
    LosslessPacket,
    Connected,
    Disconnected,
}

impl EventKind {
    /// Whether this kind has a callback slot in the engine.
    fn engine_backed(self) -> bool {
        !matches!(self, EventKind::Connected | EventKind::Disconnected)
    }
}

/// An application-facing event. Owns every buffer; nothing here aliases
/// engine memory.
#[derive(Debug, Clone)]
pub enum Event {
    FriendRequest { public_key: PublicKey, message: String },
    FriendMessage { friend: u32, message: String },
    FriendAction { friend: u32, action: String },
    NameChange { friend: u32, name: String },
    StatusMessageChange { friend: u32, message: String },
    UserStatusChange { friend: u32, status: UserStatus },
    TypingChange { friend: u32, typing: bool },
    FriendConnectionStatus { friend: u32, online: bool },
    FileSendRequest {
        friend: u32,
        file: u32,
        size: u64,
        filename: String,
    },
    FileControl {
        friend: u32,
        file: u32,
        inbound: bool,
        control: FileControl,
        data: Vec<u8>,
    },
    FileData { friend: u32, file: u32, data: Vec<u8> },
    ReadReceipt { friend: u32, receipt: u32 },
    AvatarInfo { friend: u32, format: u8, hash: Vec<u8> },
    AvatarData {
        friend: u32,
        format: u8,
        hash: Vec<u8>,
        data: Vec<u8>,
    },
    GroupInvite { friend: u32, invite_key: Vec<u8> },
    GroupMessage { group: u32, peer: u32, message: String },
    GroupAction { group: u32, peer: u32, action: String },
    GroupTopicChange { group: u32, peer: u32, topic: String },
    GroupPeerJoined { group: u32, peer: u32 },
    GroupPeerLeft { group: u32, peer: u32 },
    GroupPeerlistUpdate { group: u32 },
    LossyPacket { friend: u32, data: Vec<u8> },
    LosslessPacket { friend: u32, data: Vec<u8> },
    Connected,
    Disconnected,
}

/// Decode engine text: UTF-8 up to the first NUL, lossy beyond that.
pub(crate) fn text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::FriendRequest { .. } => EventKind::FriendRequest,
            Event::FriendMessage { .. } => EventKind::FriendMessage,
            Event::FriendAction { .. } => EventKind::FriendAction,
            Event::NameChange { .. } => EventKind::NameChange,
            Event::StatusMessageChange { .. } => EventKind::StatusMessageChange,
            Event::UserStatusChange { .. } => EventKind::UserStatusChange,
            Event::TypingChange { .. } => EventKind::TypingChange,
            Event::FriendConnectionStatus { .. } => EventKind::FriendConnectionStatus,
            Event::FileSendRequest { .. } => EventKind::FileSendRequest,
            Event::FileControl { .. } => EventKind::FileControl,
            Event::FileData { .. } => EventKind::FileData,
            Event::ReadReceipt { .. } => EventKind::ReadReceipt,
            Event::AvatarInfo { .. } => EventKind::AvatarInfo,
            Event::AvatarData { .. } => EventKind::AvatarData,
            Event::GroupInvite { .. } => EventKind::GroupInvite,
            Event::GroupMessage { .. } => EventKind::GroupMessage,
            Event::GroupAction { .. } => EventKind::GroupAction,
            Event::GroupTopicChange { .. } => EventKind::GroupTopicChange,
            Event::GroupPeerJoined { .. } => EventKind::GroupPeerJoined,
            Event::GroupPeerLeft { .. } => EventKind::GroupPeerLeft,
            Event::GroupPeerlistUpdate { .. } => EventKind::GroupPeerlistUpdate,
            Event::LossyPacket { .. } => EventKind::LossyPacket,
            Event::LosslessPacket { .. } => EventKind::LosslessPacket,
            Event::Connected => EventKind::Connected,
            Event::Disconnected => EventKind::Disconnected,
        }
    }

    /// Copy an engine notification into an owned event. This is the one place
    /// engine-owned buffers are touched.
    fn from_raw(raw: RawEvent<'_>) -> Event {
        match raw {
            RawEvent::FriendRequest { public_key, message } => Event::FriendRequest {
                public_key: PublicKey::from_bytes(*public_key),
                message: text(message),
            },
            RawEvent::FriendMessage { friend, message } => Event::FriendMessage {
                friend,
                message: text(message),
            },
            RawEvent::FriendAction { friend, action } => Event::FriendAction {
                friend,
                action: text(action),
            },
            RawEvent::NameChange { friend, name } => Event::NameChange {
                friend,
                name: text(name),
            },
            RawEvent::StatusMessageChange { friend, message } => Event::StatusMessageChange {
                friend,
                message: text(message),
            },
            RawEvent::UserStatusChange { friend, status } => {
                Event::UserStatusChange { friend, status }
            }
            RawEvent::TypingChange { friend, typing } => Event::TypingChange { friend, typing },
            RawEvent::FriendConnectionStatus { friend, online } => {
                Event::FriendConnectionStatus { friend, online }
            }
            RawEvent::FileSendRequest {
                friend,
                file,
                size,
                filename,
            } => Event::FileSendRequest {
                friend,
                file,
                size,
                filename: text(filename),
            },
            RawEvent::FileControl {
                friend,
                file,
                inbound,
                control,
                data,
            } => Event::FileControl {
                friend,
                file,
                inbound,
                control,
                data: data.to_vec(),
            },
            RawEvent::FileData { friend, file, data } => Event::FileData {
                friend,
                file,
                data: data.to_vec(),
            },
            RawEvent::ReadReceipt { friend, receipt } => Event::ReadReceipt { friend, receipt },
            RawEvent::AvatarInfo {
                friend,
                format,
                hash,
            } => Event::AvatarInfo {
                friend,
                format,
                hash: hash.to_vec(),
            },
            RawEvent::AvatarData {
                friend,
                format,
                hash,
                data,
            } => Event::AvatarData {
                friend,
                format,
                hash: hash.to_vec(),
                data: data.to_vec(),
            },
            RawEvent::GroupInvite { friend, invite_key } => Event::GroupInvite {
                friend,
                invite_key: invite_key.to_vec(),
            },
            RawEvent::GroupMessage {
                group,
                peer,
                message,
            } => Event::GroupMessage {
                group,
                peer,
                message: text(message),
            },
            RawEvent::GroupAction { group, peer, action } => Event::GroupAction {
                group,
                peer,
                action: text(action),
            },
            RawEvent::GroupTopicChange { group, peer, topic } => Event::GroupTopicChange {
                group,
                peer,
                topic: text(topic),
            },
            RawEvent::GroupPeerJoined { group, peer } => Event::GroupPeerJoined { group, peer },
            RawEvent::GroupPeerLeft { group, peer } => Event::GroupPeerLeft { group, peer },
            RawEvent::GroupPeerlistUpdate { group } => Event::GroupPeerlistUpdate { group },
            RawEvent::LossyPacket { friend, data } => Event::LossyPacket {
                friend,
                data: data.to_vec(),
            },
            RawEvent::LosslessPacket { friend, data } => Event::LosslessPacket {
                friend,
                data: data.to_vec(),
            },
        }
    }
}

/// Application event handler.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Delivery strategy. Receives the ready-to-run dispatch closure; the default
/// invoker calls it directly on the iteration task. Overriding (e.g. to hop
/// onto a UI thread) must preserve per-invoker ordering.
pub type Invoker = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    target: Target,
    id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Kind(EventKind),
    Lossy(u8),
    Lossless(u8),
}

/// Subscriber tables, packet-byte tables, boundary queue, and the invoker.
/// Mutated only under the instance's single-writer lock.
pub(crate) struct EventBridge {
    queue: Arc<Mutex<VecDeque<Event>>>,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
    lossy_handlers: HashMap<u8, Vec<(u64, Handler)>>,
    lossless_handlers: HashMap<u8, Vec<(u64, Handler)>>,
    invoker: Invoker,
    next_id: u64,
}

fn lock_queue(queue: &Arc<Mutex<VecDeque<Event>>>) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop one handler from a packet-byte table; true when that byte's list is
/// now empty.
fn prune(table: &mut HashMap<u8, Vec<(u64, Handler)>>, byte: u8, id: u64) -> bool {
    match table.get_mut(&byte) {
        Some(entries) => {
            entries.retain(|(entry_id, _)| *entry_id != id);
            entries.is_empty()
        }
        None => false,
    }
}

impl EventBridge {
    pub(crate) fn new() -> Self {
        EventBridge {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            handlers: HashMap::new(),
            lossy_handlers: HashMap::new(),
            lossless_handlers: HashMap::new(),
            invoker: Arc::new(|dispatch| dispatch()),
            next_id: 0,
        }
    }

    pub(crate) fn set_invoker(&mut self, invoker: Invoker) {
        self.invoker = invoker;
    }

    pub(crate) fn invoker(&self) -> Invoker {
        Arc::clone(&self.invoker)
    }

    /// The callback installed into an engine slot: copy out, enqueue.
    fn boundary_callback(&self) -> EngineCallback {
        let queue = Arc::clone(&self.queue);
        Box::new(move |raw: RawEvent<'_>| {
            lock_queue(&queue).push_back(Event::from_raw(raw));
        })
    }

    /// Queue a loop-synthesized event (connectivity edges).
    pub(crate) fn push(&self, event: Event) {
        lock_queue(&self.queue).push_back(event);
    }

    pub(crate) fn pop(&self) -> Option<Event> {
        lock_queue(&self.queue).pop_front()
    }

    pub(crate) fn subscribe(
        &mut self,
        engine: &mut dyn Engine,
        kind: EventKind,
        handler: Handler,
    ) -> Subscription {
        let empty = self
            .handlers
            .get(&kind)
            .map_or(true, |entries| entries.is_empty());
        if empty && kind.engine_backed() {
            engine.set_callback(kind, Some(self.boundary_callback()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.handlers
            .entry(kind)
            .or_default()
            .push((id, handler));
        Subscription {
            target: Target::Kind(kind),
            id,
        }
    }

    pub(crate) fn subscribe_lossy(
        &mut self,
        engine: &mut dyn Engine,
        first_byte: u8,
        handler: Handler,
    ) -> Subscription {
        if self.lossy_count() == 0 {
            engine.set_callback(EventKind::LossyPacket, Some(self.boundary_callback()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.lossy_handlers
            .entry(first_byte)
            .or_default()
            .push((id, handler));
        Subscription {
            target: Target::Lossy(first_byte),
            id,
        }
    }

    pub(crate) fn subscribe_lossless(
        &mut self,
        engine: &mut dyn Engine,
        first_byte: u8,
        handler: Handler,
    ) -> Subscription {
        if self.lossless_count() == 0 {
            engine.set_callback(EventKind::LosslessPacket, Some(self.boundary_callback()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.lossless_handlers
            .entry(first_byte)
            .or_default()
            .push((id, handler));
        Subscription {
            target: Target::Lossless(first_byte),
            id,
        }
    }

    fn lossy_count(&self) -> usize {
        self.lossy_handlers.values().map(Vec::len).sum()
    }

    fn lossless_count(&self) -> usize {
        self.lossless_handlers.values().map(Vec::len).sum()
    }

    pub(crate) fn unsubscribe(&mut self, engine: &mut dyn Engine, sub: Subscription) {
        match sub.target {
            Target::Kind(kind) => {
                if let Some(entries) = self.handlers.get_mut(&kind) {
                    entries.retain(|(id, _)| *id != sub.id);
                    if entries.is_empty() && kind.engine_backed() {
                        engine.set_callback(kind, None);
                    }
                }
            }
            Target::Lossy(byte) => {
                let now_empty = prune(&mut self.lossy_handlers, byte, sub.id);
                if now_empty {
                    self.lossy_handlers.remove(&byte);
                }
                if self.lossy_count() == 0 {
                    engine.set_callback(EventKind::LossyPacket, None);
                }
            }
            Target::Lossless(byte) => {
                let now_empty = prune(&mut self.lossless_handlers, byte, sub.id);
                if now_empty {
                    self.lossless_handlers.remove(&byte);
                }
                if self.lossless_count() == 0 {
                    engine.set_callback(EventKind::LosslessPacket, None);
                }
            }
        }
    }

    /// Handlers an event should reach. Custom packets route by leading byte
    /// only; everything else by kind.
    pub(crate) fn handlers_for(&self, event: &Event) -> Vec<Handler> {
        let entries = match event {
            Event::LossyPacket { data, .. } => data
                .first()
                .and_then(|b| self.lossy_handlers.get(b)),
            Event::LosslessPacket { data, .. } => data
                .first()
                .and_then(|b| self.lossless_handlers.get(b)),
            other => self.handlers.get(&other.kind()),
        };
        entries
            .map(|v| v.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Drop every subscription and queued event. Late engine callbacks can
    /// still enqueue, but nothing will ever dispatch again.
    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
        self.lossy_handlers.clear();
        self.lossless_handlers.clear();
        lock_queue(&self.queue).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_stops_at_nul() {
        assert_eq!(text(b"hello\0junk"), "hello");
        assert_eq!(text(b"plain"), "plain");
        assert_eq!(text(b""), "");
    }

    #[test]
    fn from_raw_copies_buffers() {
        let payload = vec![200u8, 1, 2, 3];
        let event = Event::from_raw(RawEvent::LossyPacket {
            friend: 7,
            data: &payload,
        });
        drop(payload);
        match event {
            Event::LossyPacket { friend, data } => {
                assert_eq!(friend, 7);
                assert_eq!(data, vec![200, 1, 2, 3]);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn kind_matches_raw_kind() {
        let key = [0u8; 32];
        let raw = RawEvent::FriendRequest {
            public_key: &key,
            message: b"hi",
        };
        let kind = raw.kind();
        assert_eq!(Event::from_raw(raw).kind(), kind);
    }
}
