//! Contract with the external protocol engine: outbound calls, inbound
//! callbacks. Everything network- and crypto-shaped lives behind this trait.

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::EventKind;
use crate::identity::{ADDRESS_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};

/// Longest display name in bytes.
pub const MAX_NAME_LENGTH: usize = 128;
/// Longest status message in bytes.
pub const MAX_STATUS_MESSAGE_LENGTH: usize = 1007;
/// Longest filename accepted for an outbound file transfer, in bytes.
pub const MAX_FILENAME_LENGTH: usize = 255;
/// Longest group topic in bytes.
pub const MAX_GROUP_TOPIC_LENGTH: usize = 256;
/// Largest custom packet, first byte included.
pub const MAX_CUSTOM_PACKET_SIZE: usize = 1373;
/// Reserved first-byte range for lossy custom packets.
pub const LOSSY_FIRST_BYTE: RangeInclusive<u8> = 200..=254;
/// Reserved first-byte range for lossless custom packets.
pub const LOSSLESS_FIRST_BYTE: RangeInclusive<u8> = 160..=191;

/// Self or friend user status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UserStatus {
    #[default]
    None,
    Away,
    Busy,
}

/// File transfer control codes, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControl {
    Accept,
    Pause,
    Cancel,
    Finished,
    ResumeBroken,
}

/// Engine-side failure, signaled via return value and never retried here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("no friend with that number")]
    FriendNotFound,
    #[error("no group with that number")]
    GroupNotFound,
    #[error("no file transfer with that number")]
    FileNotFound,
    #[error("friend request rejected: {0}")]
    AddFriendRejected(&'static str),
    #[error("encrypted save failed")]
    Encryption,
    #[error("wrong passphrase or corrupted save data")]
    Decryption,
    #[error("save data is not compatible with this engine")]
    Incompatible,
    #[error("engine failure: {0}")]
    Failure(String),
}

/// A notification as the engine delivers it: numeric identifiers plus buffers
/// the engine owns. Borrowed data is only valid for the duration of the
/// callback; the bridge copies everything out before handing it to the
/// application.
#[derive(Debug)]
pub enum RawEvent<'a> {
    FriendRequest {
        public_key: &'a [u8; PUBLIC_KEY_SIZE],
        message: &'a [u8],
    },
    FriendMessage { friend: u32, message: &'a [u8] },
    FriendAction { friend: u32, action: &'a [u8] },
    NameChange { friend: u32, name: &'a [u8] },
    StatusMessageChange { friend: u32, message: &'a [u8] },
    UserStatusChange { friend: u32, status: UserStatus },
    TypingChange { friend: u32, typing: bool },
    FriendConnectionStatus { friend: u32, online: bool },
    FileSendRequest {
        friend: u32,
        file: u32,
        size: u64,
        filename: &'a [u8],
    },
    FileControl {
        friend: u32,
        file: u32,
        inbound: bool,
        control: FileControl,
        data: &'a [u8],
    },
    FileData { friend: u32, file: u32, data: &'a [u8] },
    ReadReceipt { friend: u32, receipt: u32 },
    AvatarInfo { friend: u32, format: u8, hash: &'a [u8] },
    AvatarData {
        friend: u32,
        format: u8,
        hash: &'a [u8],
        data: &'a [u8],
    },
    GroupInvite { friend: u32, invite_key: &'a [u8] },
    GroupMessage { group: u32, peer: u32, message: &'a [u8] },
    GroupAction { group: u32, peer: u32, action: &'a [u8] },
    GroupTopicChange { group: u32, peer: u32, topic: &'a [u8] },
    GroupPeerJoined { group: u32, peer: u32 },
    GroupPeerLeft { group: u32, peer: u32 },
    GroupPeerlistUpdate { group: u32 },
    LossyPacket { friend: u32, data: &'a [u8] },
    LosslessPacket { friend: u32, data: &'a [u8] },
}

/// Callback slot installed into the engine, one per event kind.
pub type EngineCallback = Box<dyn FnMut(RawEvent<'_>) + Send>;

/// The external protocol engine. One exclusively-owned handle per instance;
/// all calls are serialized by the caller (the engine is not assumed safe for
/// concurrent invocation). No call carries a timeout: a hung engine call
/// blocks the iteration loop.
pub trait Engine: Send {
    /// Run one processing step. Failures are surfaced to the caller, which
    /// logs and keeps iterating; the engine owns its own recovery.
    fn iterate(&mut self) -> Result<(), EngineError>;
    /// Recommended delay until the next step.
    fn iteration_interval(&self) -> Duration;
    fn is_connected(&self) -> bool;

    fn address(&self) -> [u8; ADDRESS_SIZE];
    fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE];
    fn secret_key(&self) -> [u8; SECRET_KEY_SIZE];
    fn name(&self) -> Vec<u8>;
    fn set_name(&mut self, name: &[u8]) -> Result<(), EngineError>;
    fn status_message(&self) -> Vec<u8>;
    fn set_status_message(&mut self, message: &[u8]) -> Result<(), EngineError>;
    fn user_status(&self) -> UserStatus;
    fn set_user_status(&mut self, status: UserStatus);
    fn nospam(&self) -> u32;
    fn set_nospam(&mut self, nospam: u32);

    fn save(&self) -> Result<Vec<u8>, EngineError>;
    fn save_encrypted(&self, passphrase: &[u8]) -> Result<Vec<u8>, EngineError>;
    fn load(&mut self, data: &[u8]) -> Result<(), EngineError>;
    fn load_encrypted(&mut self, data: &[u8], passphrase: &[u8]) -> Result<(), EngineError>;

    fn add_friend(
        &mut self,
        address: &[u8; ADDRESS_SIZE],
        message: &[u8],
    ) -> Result<u32, EngineError>;
    fn add_friend_no_request(
        &mut self,
        public_key: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<u32, EngineError>;
    fn delete_friend(&mut self, friend: u32) -> Result<(), EngineError>;
    fn friend_list(&self) -> Vec<u32>;
    fn friend_exists(&self, friend: u32) -> bool;
    fn friend_by_public_key(
        &self,
        public_key: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<u32, EngineError>;
    fn friend_public_key(&self, friend: u32) -> Result<[u8; PUBLIC_KEY_SIZE], EngineError>;
    fn friend_name(&self, friend: u32) -> Result<Vec<u8>, EngineError>;
    fn friend_status_message(&self, friend: u32) -> Result<Vec<u8>, EngineError>;
    fn friend_user_status(&self, friend: u32) -> Result<UserStatus, EngineError>;
    fn friend_is_online(&self, friend: u32) -> Result<bool, EngineError>;
    fn friend_is_typing(&self, friend: u32) -> Result<bool, EngineError>;
    fn set_typing(&mut self, friend: u32, typing: bool) -> Result<(), EngineError>;
    /// Returns the read-receipt id for the message.
    fn send_message(&mut self, friend: u32, message: &[u8]) -> Result<u32, EngineError>;
    fn send_action(&mut self, friend: u32, action: &[u8]) -> Result<u32, EngineError>;

    fn file_send_request(
        &mut self,
        friend: u32,
        size: u64,
        filename: &[u8],
    ) -> Result<u32, EngineError>;
    fn file_control(
        &mut self,
        friend: u32,
        file: u32,
        inbound: bool,
        control: FileControl,
    ) -> Result<(), EngineError>;
    fn file_send_data(&mut self, friend: u32, file: u32, data: &[u8]) -> Result<(), EngineError>;
    /// Recommended chunk size for `file_send_data` to this friend.
    fn file_chunk_size(&self, friend: u32) -> Result<usize, EngineError>;

    fn group_new(&mut self, name: &[u8]) -> Result<u32, EngineError>;
    fn group_delete(&mut self, group: u32, part_message: &[u8]) -> Result<(), EngineError>;
    fn group_invite_friend(&mut self, group: u32, friend: u32) -> Result<(), EngineError>;
    fn group_join(&mut self, invite_key: &[u8]) -> Result<u32, EngineError>;
    /// Key others can use to join this group out of band.
    fn group_invite_key(&self, group: u32) -> Result<Vec<u8>, EngineError>;
    fn group_message_send(&mut self, group: u32, message: &[u8]) -> Result<(), EngineError>;
    fn group_action_send(&mut self, group: u32, action: &[u8]) -> Result<(), EngineError>;
    fn group_set_topic(&mut self, group: u32, topic: &[u8]) -> Result<(), EngineError>;
    fn group_topic(&self, group: u32) -> Result<Vec<u8>, EngineError>;
    fn group_name(&self, group: u32) -> Result<Vec<u8>, EngineError>;
    fn group_peer_list(&self, group: u32) -> Result<Vec<u32>, EngineError>;
    fn group_peer_name(&self, group: u32, peer: u32) -> Result<Vec<u8>, EngineError>;
    fn group_peer_count(&self, group: u32) -> Result<u32, EngineError>;

    fn send_lossy_packet(&mut self, friend: u32, data: &[u8]) -> Result<(), EngineError>;
    fn send_lossless_packet(&mut self, friend: u32, data: &[u8]) -> Result<(), EngineError>;

    /// Install or remove the callback for one event kind. `None` removes.
    fn set_callback(&mut self, kind: EventKind, callback: Option<EngineCallback>);
}

impl RawEvent<'_> {
    /// The registration slot this notification belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            RawEvent::FriendRequest { .. } => EventKind::FriendRequest,
            RawEvent::FriendMessage { .. } => EventKind::FriendMessage,
            RawEvent::FriendAction { .. } => EventKind::FriendAction,
            RawEvent::NameChange { .. } => EventKind::NameChange,
            RawEvent::StatusMessageChange { .. } => EventKind::StatusMessageChange,
            RawEvent::UserStatusChange { .. } => EventKind::UserStatusChange,
            RawEvent::TypingChange { .. } => EventKind::TypingChange,
            RawEvent::FriendConnectionStatus { .. } => EventKind::FriendConnectionStatus,
            RawEvent::FileSendRequest { .. } => EventKind::FileSendRequest,
            RawEvent::FileControl { .. } => EventKind::FileControl,
            RawEvent::FileData { .. } => EventKind::FileData,
            RawEvent::ReadReceipt { .. } => EventKind::ReadReceipt,
            RawEvent::AvatarInfo { .. } => EventKind::AvatarInfo,
            RawEvent::AvatarData { .. } => EventKind::AvatarData,
            RawEvent::GroupInvite { .. } => EventKind::GroupInvite,
            RawEvent::GroupMessage { .. } => EventKind::GroupMessage,
            RawEvent::GroupAction { .. } => EventKind::GroupAction,
            RawEvent::GroupTopicChange { .. } => EventKind::GroupTopicChange,
            RawEvent::GroupPeerJoined { .. } => EventKind::GroupPeerJoined,
            RawEvent::GroupPeerLeft { .. } => EventKind::GroupPeerLeft,
            RawEvent::GroupPeerlistUpdate { .. } => EventKind::GroupPeerlistUpdate,
            RawEvent::LossyPacket { .. } => EventKind::LossyPacket,
            RawEvent::LosslessPacket { .. } => EventKind::LosslessPacket,
        }
    }
}
