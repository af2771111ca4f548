//! In-memory engine: self state, friends, groups, and saves without any
//! networking. Backs the test suite and the bundled daemon. Inbound events
//! are queued through a handle and delivered on the next iteration step,
//! through the registered callbacks, exactly like the real boundary.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::engine::{
    Engine, EngineCallback, EngineError, FileControl, RawEvent, UserStatus,
};
use crate::events::EventKind;
use crate::identity::{Address, PublicKey, ADDRESS_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};
use crate::savedata::ENCRYPTED_MAGIC;

const NONCE_SIZE: usize = 12;
const FILE_CHUNK_SIZE: usize = 1371;

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FriendState {
    #[serde(with = "bytes_32")]
    public_key: [u8; PUBLIC_KEY_SIZE],
    name: Vec<u8>,
    status_message: Vec<u8>,
    user_status: UserStatus,
    online: bool,
    typing: bool,
}

impl FriendState {
    fn new(public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        FriendState {
            public_key,
            name: Vec::new(),
            status_message: Vec::new(),
            user_status: UserStatus::None,
            online: false,
            typing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupState {
    name: Vec<u8>,
    topic: Vec<u8>,
    invite_key: Vec<u8>,
    peers: BTreeMap<u32, Vec<u8>>,
    next_peer: u32,
}

/// Full serialized state; what a save envelope contains.
#[derive(Clone, Serialize, Deserialize)]
struct State {
    #[serde(with = "bytes_32")]
    secret_key: [u8; SECRET_KEY_SIZE],
    #[serde(with = "bytes_32")]
    public_key: [u8; PUBLIC_KEY_SIZE],
    nospam: u32,
    name: Vec<u8>,
    status_message: Vec<u8>,
    user_status: UserStatus,
    friends: BTreeMap<u32, FriendState>,
    groups: BTreeMap<u32, GroupState>,
    next_friend: u32,
    next_group: u32,
}

impl State {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        let mut nospam_bytes = [0u8; 4];
        OsRng.fill_bytes(&mut nospam_bytes);
        State {
            secret_key: secret.to_bytes(),
            public_key: public.to_bytes(),
            nospam: u32::from_le_bytes(nospam_bytes),
            name: Vec::new(),
            status_message: Vec::new(),
            user_status: UserStatus::None,
            friends: BTreeMap::new(),
            groups: BTreeMap::new(),
            next_friend: 0,
            next_group: 0,
        }
    }
}

/// An inbound notification waiting for the next iteration step.
struct Pending {
    kind: EventKind,
    deliver: Box<dyn FnOnce(&mut EngineCallback) + Send>,
}

struct LoopbackInner {
    state: State,
    connected: bool,
    interval: Duration,
    iterations: u64,
    callbacks: HashMap<EventKind, EngineCallback>,
    pending: VecDeque<Pending>,
    files: BTreeMap<u32, u32>,
    next_file: u32,
    next_receipt: u32,
    sent_messages: Vec<(u32, Vec<u8>)>,
    sent_lossy: Vec<(u32, Vec<u8>)>,
    sent_lossless: Vec<(u32, Vec<u8>)>,
    registrations: HashMap<EventKind, u32>,
    removals: HashMap<EventKind, u32>,
}

fn lock(shared: &Arc<Mutex<LoopbackInner>>) -> MutexGuard<'_, LoopbackInner> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Derive the save encryption key from a passphrase.
fn derive_save_key(passphrase: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"toku-save-v1");
    hasher.update(passphrase);
    hasher.finalize().into()
}

/// The engine half: moved into an `Instance` at creation.
pub struct LoopbackEngine {
    shared: Arc<Mutex<LoopbackInner>>,
}

/// The driver half: kept by tests and the daemon to steer connectivity,
/// inject inbound events, and inspect what the engine was asked to do.
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<Mutex<LoopbackInner>>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        LoopbackEngine {
            shared: Arc::new(Mutex::new(LoopbackInner {
                state: State::generate(),
                connected: false,
                interval: Duration::from_millis(50),
                iterations: 0,
                callbacks: HashMap::new(),
                pending: VecDeque::new(),
                files: BTreeMap::new(),
                next_file: 0,
                next_receipt: 0,
                sent_messages: Vec::new(),
                sent_lossy: Vec::new(),
                sent_lossless: Vec::new(),
                registrations: HashMap::new(),
                removals: HashMap::new(),
            })),
        }
    }

    /// A driver handle sharing this engine's state.
    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackInner> {
        lock(&self.shared)
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackInner {
    fn friend(&self, friend: u32) -> Result<&FriendState, EngineError> {
        self.state
            .friends
            .get(&friend)
            .ok_or(EngineError::FriendNotFound)
    }

    fn group(&self, group: u32) -> Result<&GroupState, EngineError> {
        self.state
            .groups
            .get(&group)
            .ok_or(EngineError::GroupNotFound)
    }

    fn group_mut(&mut self, group: u32) -> Result<&mut GroupState, EngineError> {
        self.state
            .groups
            .get_mut(&group)
            .ok_or(EngineError::GroupNotFound)
    }

    fn insert_friend(&mut self, public_key: [u8; PUBLIC_KEY_SIZE]) -> u32 {
        let number = self.state.next_friend;
        self.state.next_friend += 1;
        self.state.friends.insert(number, FriendState::new(public_key));
        number
    }

    fn new_group(&mut self, name: Vec<u8>) -> u32 {
        let number = self.state.next_group;
        self.state.next_group += 1;
        let mut peers = BTreeMap::new();
        peers.insert(0, self.state.name.clone());
        let mut invite_key = vec![0u8; 32];
        OsRng.fill_bytes(&mut invite_key);
        self.state.groups.insert(
            number,
            GroupState {
                name,
                topic: Vec::new(),
                invite_key,
                peers,
                next_peer: 1,
            },
        );
        number
    }
}

impl Engine for LoopbackEngine {
    fn iterate(&mut self) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner.iterations += 1;
        while let Some(pending) = inner.pending.pop_front() {
            // No callback registered for the kind: the notification is lost,
            // exactly like an unregistered native callback.
            if let Some(callback) = inner.callbacks.get_mut(&pending.kind) {
                (pending.deliver)(callback);
            }
        }
        Ok(())
    }

    fn iteration_interval(&self) -> Duration {
        self.lock().interval
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn address(&self) -> [u8; ADDRESS_SIZE] {
        let inner = self.lock();
        *Address::new(
            PublicKey::from_bytes(inner.state.public_key),
            inner.state.nospam,
        )
        .as_bytes()
    }

    fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.lock().state.public_key
    }

    fn secret_key(&self) -> [u8; SECRET_KEY_SIZE] {
        self.lock().state.secret_key
    }

    fn name(&self) -> Vec<u8> {
        self.lock().state.name.clone()
    }

    fn set_name(&mut self, name: &[u8]) -> Result<(), EngineError> {
        self.lock().state.name = name.to_vec();
        Ok(())
    }

    fn status_message(&self) -> Vec<u8> {
        self.lock().state.status_message.clone()
    }

    fn set_status_message(&mut self, message: &[u8]) -> Result<(), EngineError> {
        self.lock().state.status_message = message.to_vec();
        Ok(())
    }

    fn user_status(&self) -> UserStatus {
        self.lock().state.user_status
    }

    fn set_user_status(&mut self, status: UserStatus) {
        self.lock().state.user_status = status;
    }

    fn nospam(&self) -> u32 {
        self.lock().state.nospam
    }

    fn set_nospam(&mut self, nospam: u32) {
        self.lock().state.nospam = nospam;
    }

    fn save(&self) -> Result<Vec<u8>, EngineError> {
        let inner = self.lock();
        bincode::serialize(&inner.state).map_err(|e| EngineError::Failure(e.to_string()))
    }

    fn save_encrypted(&self, passphrase: &[u8]) -> Result<Vec<u8>, EngineError> {
        let plain = self.save()?;
        let key = derive_save_key(passphrase);
        let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| EngineError::Encryption)?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
            &nonce_bytes,
        );
        let sealed = cipher
            .encrypt(nonce, plain.as_slice())
            .map_err(|_| EngineError::Encryption)?;
        let mut out = Vec::with_capacity(ENCRYPTED_MAGIC.len() + NONCE_SIZE + sealed.len());
        out.extend_from_slice(&ENCRYPTED_MAGIC);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn load(&mut self, data: &[u8]) -> Result<(), EngineError> {
        if data.starts_with(&ENCRYPTED_MAGIC) {
            return Err(EngineError::Incompatible);
        }
        let state: State =
            bincode::deserialize(data).map_err(|_| EngineError::Incompatible)?;
        self.lock().state = state;
        Ok(())
    }

    fn load_encrypted(&mut self, data: &[u8], passphrase: &[u8]) -> Result<(), EngineError> {
        let rest = data
            .strip_prefix(&ENCRYPTED_MAGIC[..])
            .ok_or(EngineError::Decryption)?;
        if rest.len() <= NONCE_SIZE {
            return Err(EngineError::Decryption);
        }
        let (nonce_bytes, sealed) = rest.split_at(NONCE_SIZE);
        let key = derive_save_key(passphrase);
        let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| EngineError::Decryption)?;
        let nonce =
            chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
                nonce_bytes,
            );
        let plain = cipher
            .decrypt(nonce, sealed)
            .map_err(|_| EngineError::Decryption)?;
        let state: State =
            bincode::deserialize(&plain).map_err(|_| EngineError::Decryption)?;
        self.lock().state = state;
        Ok(())
    }

    fn add_friend(
        &mut self,
        address: &[u8; ADDRESS_SIZE],
        message: &[u8],
    ) -> Result<u32, EngineError> {
        let mut inner = self.lock();
        let address = Address::from_bytes(address)
            .map_err(|_| EngineError::AddFriendRejected("invalid address"))?;
        let public_key = *address.public_key().as_bytes();
        if message.is_empty() {
            return Err(EngineError::AddFriendRejected("no message"));
        }
        if public_key == inner.state.public_key {
            return Err(EngineError::AddFriendRejected("own address"));
        }
        if inner
            .state
            .friends
            .values()
            .any(|f| f.public_key == public_key)
        {
            return Err(EngineError::AddFriendRejected("request already sent"));
        }
        Ok(inner.insert_friend(public_key))
    }

    fn add_friend_no_request(
        &mut self,
        public_key: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<u32, EngineError> {
        let mut inner = self.lock();
        if inner
            .state
            .friends
            .values()
            .any(|f| f.public_key == *public_key)
        {
            return Err(EngineError::AddFriendRejected("request already sent"));
        }
        Ok(inner.insert_friend(*public_key))
    }

    fn delete_friend(&mut self, friend: u32) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner
            .state
            .friends
            .remove(&friend)
            .map(|_| ())
            .ok_or(EngineError::FriendNotFound)
    }

    fn friend_list(&self) -> Vec<u32> {
        self.lock().state.friends.keys().copied().collect()
    }

    fn friend_exists(&self, friend: u32) -> bool {
        self.lock().state.friends.contains_key(&friend)
    }

    fn friend_by_public_key(
        &self,
        public_key: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<u32, EngineError> {
        self.lock()
            .state
            .friends
            .iter()
            .find(|(_, f)| f.public_key == *public_key)
            .map(|(&number, _)| number)
            .ok_or(EngineError::FriendNotFound)
    }

    fn friend_public_key(&self, friend: u32) -> Result<[u8; PUBLIC_KEY_SIZE], EngineError> {
        Ok(self.lock().friend(friend)?.public_key)
    }

    fn friend_name(&self, friend: u32) -> Result<Vec<u8>, EngineError> {
        Ok(self.lock().friend(friend)?.name.clone())
    }

    fn friend_status_message(&self, friend: u32) -> Result<Vec<u8>, EngineError> {
        Ok(self.lock().friend(friend)?.status_message.clone())
    }

    fn friend_user_status(&self, friend: u32) -> Result<UserStatus, EngineError> {
        Ok(self.lock().friend(friend)?.user_status)
    }

    fn friend_is_online(&self, friend: u32) -> Result<bool, EngineError> {
        Ok(self.lock().friend(friend)?.online)
    }

    fn friend_is_typing(&self, friend: u32) -> Result<bool, EngineError> {
        Ok(self.lock().friend(friend)?.typing)
    }

    fn set_typing(&mut self, friend: u32, _typing: bool) -> Result<(), EngineError> {
        self.lock().friend(friend)?;
        Ok(())
    }

    fn send_message(&mut self, friend: u32, message: &[u8]) -> Result<u32, EngineError> {
        let mut inner = self.lock();
        inner.friend(friend)?;
        inner.sent_messages.push((friend, message.to_vec()));
        let receipt = inner.next_receipt;
        inner.next_receipt += 1;
        Ok(receipt)
    }

    fn send_action(&mut self, friend: u32, action: &[u8]) -> Result<u32, EngineError> {
        self.send_message(friend, action)
    }

    fn file_send_request(
        &mut self,
        friend: u32,
        _size: u64,
        _filename: &[u8],
    ) -> Result<u32, EngineError> {
        let mut inner = self.lock();
        inner.friend(friend)?;
        let file = inner.next_file;
        inner.next_file += 1;
        inner.files.insert(file, friend);
        Ok(file)
    }

    fn file_control(
        &mut self,
        friend: u32,
        file: u32,
        _inbound: bool,
        control: FileControl,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock();
        match inner.files.get(&file) {
            Some(&owner) if owner == friend => {
                if control == FileControl::Cancel {
                    inner.files.remove(&file);
                }
                Ok(())
            }
            _ => Err(EngineError::FileNotFound),
        }
    }

    fn file_send_data(&mut self, friend: u32, file: u32, _data: &[u8]) -> Result<(), EngineError> {
        let inner = self.lock();
        match inner.files.get(&file) {
            Some(&owner) if owner == friend => Ok(()),
            _ => Err(EngineError::FileNotFound),
        }
    }

    fn file_chunk_size(&self, friend: u32) -> Result<usize, EngineError> {
        self.lock().friend(friend)?;
        Ok(FILE_CHUNK_SIZE)
    }

    fn group_new(&mut self, name: &[u8]) -> Result<u32, EngineError> {
        Ok(self.lock().new_group(name.to_vec()))
    }

    fn group_delete(&mut self, group: u32, _part_message: &[u8]) -> Result<(), EngineError> {
        self.lock()
            .state
            .groups
            .remove(&group)
            .map(|_| ())
            .ok_or(EngineError::GroupNotFound)
    }

    fn group_invite_friend(&mut self, group: u32, friend: u32) -> Result<(), EngineError> {
        let inner = self.lock();
        inner.group(group)?;
        inner.friend(friend)?;
        Ok(())
    }

    fn group_join(&mut self, _invite_key: &[u8]) -> Result<u32, EngineError> {
        Ok(self.lock().new_group(Vec::new()))
    }

    fn group_invite_key(&self, group: u32) -> Result<Vec<u8>, EngineError> {
        Ok(self.lock().group(group)?.invite_key.clone())
    }

    fn group_message_send(&mut self, group: u32, _message: &[u8]) -> Result<(), EngineError> {
        self.lock().group(group)?;
        Ok(())
    }

    fn group_action_send(&mut self, group: u32, _action: &[u8]) -> Result<(), EngineError> {
        self.lock().group(group)?;
        Ok(())
    }

    fn group_set_topic(&mut self, group: u32, topic: &[u8]) -> Result<(), EngineError> {
        self.lock().group_mut(group)?.topic = topic.to_vec();
        Ok(())
    }

    fn group_topic(&self, group: u32) -> Result<Vec<u8>, EngineError> {
        Ok(self.lock().group(group)?.topic.clone())
    }

    fn group_name(&self, group: u32) -> Result<Vec<u8>, EngineError> {
        Ok(self.lock().group(group)?.name.clone())
    }

    fn group_peer_list(&self, group: u32) -> Result<Vec<u32>, EngineError> {
        Ok(self.lock().group(group)?.peers.keys().copied().collect())
    }

    fn group_peer_name(&self, group: u32, peer: u32) -> Result<Vec<u8>, EngineError> {
        self.lock()
            .group(group)?
            .peers
            .get(&peer)
            .cloned()
            .ok_or(EngineError::FriendNotFound)
    }

    fn group_peer_count(&self, group: u32) -> Result<u32, EngineError> {
        Ok(self.lock().group(group)?.peers.len() as u32)
    }

    fn send_lossy_packet(&mut self, friend: u32, data: &[u8]) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner.friend(friend)?;
        inner.sent_lossy.push((friend, data.to_vec()));
        Ok(())
    }

    fn send_lossless_packet(&mut self, friend: u32, data: &[u8]) -> Result<(), EngineError> {
        let mut inner = self.lock();
        inner.friend(friend)?;
        inner.sent_lossless.push((friend, data.to_vec()));
        Ok(())
    }

    fn set_callback(&mut self, kind: EventKind, callback: Option<EngineCallback>) {
        let mut inner = self.lock();
        match callback {
            Some(callback) => {
                *inner.registrations.entry(kind).or_insert(0) += 1;
                inner.callbacks.insert(kind, callback);
            }
            None => {
                if inner.callbacks.remove(&kind).is_some() {
                    *inner.removals.entry(kind).or_insert(0) += 1;
                }
            }
        }
    }
}

impl LoopbackHandle {
    fn lock(&self) -> MutexGuard<'_, LoopbackInner> {
        lock(&self.shared)
    }

    fn push<F>(&self, kind: EventKind, deliver: F)
    where
        F: FnOnce(&mut EngineCallback) + Send + 'static,
    {
        self.lock().pending.push_back(Pending {
            kind,
            deliver: Box::new(deliver),
        });
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub fn set_interval(&self, interval: Duration) {
        self.lock().interval = interval;
    }

    pub fn iterations(&self) -> u64 {
        self.lock().iterations
    }

    pub fn sent_messages(&self) -> Vec<(u32, Vec<u8>)> {
        self.lock().sent_messages.clone()
    }

    pub fn sent_lossy(&self) -> Vec<(u32, Vec<u8>)> {
        self.lock().sent_lossy.clone()
    }

    pub fn sent_lossless(&self) -> Vec<(u32, Vec<u8>)> {
        self.lock().sent_lossless.clone()
    }

    pub fn callback_registrations(&self, kind: EventKind) -> u32 {
        self.lock().registrations.get(&kind).copied().unwrap_or(0)
    }

    pub fn callback_removals(&self, kind: EventKind) -> u32 {
        self.lock().removals.get(&kind).copied().unwrap_or(0)
    }

    pub fn push_friend_request(&self, public_key: [u8; PUBLIC_KEY_SIZE], message: &[u8]) {
        let message = message.to_vec();
        self.push(EventKind::FriendRequest, move |cb| {
            cb(RawEvent::FriendRequest {
                public_key: &public_key,
                message: &message,
            })
        });
    }

    pub fn push_friend_message(&self, friend: u32, message: &[u8]) {
        let message = message.to_vec();
        self.push(EventKind::FriendMessage, move |cb| {
            cb(RawEvent::FriendMessage {
                friend,
                message: &message,
            })
        });
    }

    pub fn push_name_change(&self, friend: u32, name: &[u8]) {
        let name = name.to_vec();
        self.push(EventKind::NameChange, move |cb| {
            cb(RawEvent::NameChange {
                friend,
                name: &name,
            })
        });
    }

    pub fn push_typing_change(&self, friend: u32, typing: bool) {
        self.push(EventKind::TypingChange, move |cb| {
            cb(RawEvent::TypingChange { friend, typing })
        });
    }

    pub fn push_read_receipt(&self, friend: u32, receipt: u32) {
        self.push(EventKind::ReadReceipt, move |cb| {
            cb(RawEvent::ReadReceipt { friend, receipt })
        });
    }

    pub fn push_group_message(&self, group: u32, peer: u32, message: &[u8]) {
        let message = message.to_vec();
        self.push(EventKind::GroupMessage, move |cb| {
            cb(RawEvent::GroupMessage {
                group,
                peer,
                message: &message,
            })
        });
    }

    pub fn push_file_send_request(&self, friend: u32, file: u32, size: u64, filename: &[u8]) {
        let filename = filename.to_vec();
        self.push(EventKind::FileSendRequest, move |cb| {
            cb(RawEvent::FileSendRequest {
                friend,
                file,
                size,
                filename: &filename,
            })
        });
    }

    pub fn push_lossy_packet(&self, friend: u32, data: &[u8]) {
        let data = data.to_vec();
        self.push(EventKind::LossyPacket, move |cb| {
            cb(RawEvent::LossyPacket {
                friend,
                data: &data,
            })
        });
    }

    pub fn push_lossless_packet(&self, friend: u32, data: &[u8]) {
        let data = data.to_vec();
        self.push(EventKind::LosslessPacket, move |cb| {
            cb(RawEvent::LosslessPacket {
                friend,
                data: &data,
            })
        });
    }
}
