//! Instance lifecycle: owns the engine handle, drives the iteration loop,
//! and fronts the pass-through operation surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::{
    Engine, EngineError, FileControl, UserStatus, LOSSLESS_FIRST_BYTE, LOSSY_FIRST_BYTE,
    MAX_CUSTOM_PACKET_SIZE, MAX_FILENAME_LENGTH, MAX_GROUP_TOPIC_LENGTH,
};
use crate::events::{text, Event, EventBridge, EventKind, Handler, Invoker, Subscription};
use crate::identity::{Address, KeyPair, PublicKey, SecretKey};
use crate::savedata::SaveData;

/// Error from an instance operation. Validation variants are raised before
/// any engine call; `Engine` wraps a typed engine rejection.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("instance has been disposed")]
    Disposed,
    #[error("iteration loop is already running")]
    LoopAlreadyRunning,
    #[error("empty custom packet")]
    PacketEmpty,
    #[error("packet first byte {0} is outside the reserved range for this channel")]
    PacketOutOfRange(u8),
    #[error("packet larger than {} bytes", MAX_CUSTOM_PACKET_SIZE)]
    PacketTooLarge,
    #[error("filename longer than {} bytes", MAX_FILENAME_LENGTH)]
    FilenameTooLong,
    #[error("group topic longer than {} bytes", MAX_GROUP_TOPIC_LENGTH)]
    TopicTooLong,
    #[error("custom packet events are subscribed per leading byte")]
    PacketKindSubscription,
    #[error("save data is encrypted and needs a passphrase to restore")]
    SaveDataEncrypted,
    #[error("could not create engine instance: {0}")]
    Creation(EngineError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Proxy used by the engine for outbound connections.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// Engine construction options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Options {
    #[serde(default = "default_true")]
    pub ipv6_enabled: bool,
    #[serde(default = "default_true")]
    pub udp_enabled: bool,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for Options {
    fn default() -> Self {
        Options {
            ipv6_enabled: true,
            udp_enabled: true,
            proxy: None,
        }
    }
}

/// Cooperative cancellation for the iteration loop: flag checked at the top
/// of each pass, notify to cut a suspension short. Worst-case shutdown
/// latency is one delay interval.
struct LoopCancel {
    flag: AtomicBool,
    notify: Notify,
}

impl LoopCancel {
    fn new() -> Self {
        LoopCancel {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Everything behind the single-writer lock: the engine handle (until
/// disposal takes it), the bridge tables, and the loop flags.
struct Inner {
    engine: Option<Box<dyn Engine>>,
    bridge: EventBridge,
    running: bool,
    connected: bool,
}

impl Inner {
    fn engine(&mut self) -> Result<&mut (dyn Engine + 'static), InstanceError> {
        match self.engine.as_mut() {
            Some(engine) => Ok(engine.as_mut()),
            None => Err(InstanceError::Disposed),
        }
    }
}

/// One messenger instance around one exclusively-owned engine handle.
///
/// States: created, running (loop active), stopped, disposed (terminal).
/// Every operation checks disposal first; all engine calls are serialized
/// through one mutex, including the loop's.
pub struct Instance {
    inner: Arc<Mutex<Inner>>,
    cancel: Arc<LoopCancel>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    options: Options,
}

fn lock(inner: &Arc<Mutex<Inner>>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Instance {
    /// Allocate the engine through `factory` and wrap it. A supplied
    /// plaintext envelope is applied as part of construction; any failure is
    /// fatal and no instance is returned.
    pub fn create<F>(
        options: Options,
        savedata: Option<&SaveData>,
        factory: F,
    ) -> Result<Self, InstanceError>
    where
        F: FnOnce(&Options) -> Result<Box<dyn Engine>, EngineError>,
    {
        let mut engine = factory(&options).map_err(InstanceError::Creation)?;
        if let Some(data) = savedata {
            if data.is_encrypted() {
                return Err(InstanceError::SaveDataEncrypted);
            }
            engine
                .load(data.as_bytes())
                .map_err(InstanceError::Creation)?;
        }
        Ok(Instance {
            inner: Arc::new(Mutex::new(Inner {
                engine: Some(engine),
                bridge: EventBridge::new(),
                running: false,
                connected: false,
            })),
            cancel: Arc::new(LoopCancel::new()),
            loop_task: Mutex::new(None),
            options,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    fn take_loop_task(&self) -> Option<JoinHandle<()>> {
        self.loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    // ---- lifecycle ----

    /// Start the background iteration loop. No-op when already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), InstanceError> {
        {
            let mut inner = self.lock();
            inner.engine()?;
            if inner.running {
                return Ok(());
            }
            inner.running = true;
        }
        self.cancel.reset();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.inner),
            Arc::clone(&self.cancel),
        ));
        *self
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!("iteration loop started");
        Ok(())
    }

    /// Signal the loop to stop and wait for it to acknowledge. No-op when
    /// not running.
    pub async fn stop(&self) -> Result<(), InstanceError> {
        {
            let mut inner = self.lock();
            inner.engine()?;
            if !inner.running {
                return Ok(());
            }
        }
        self.cancel.trigger();
        if let Some(handle) = self.take_loop_task() {
            let _ = handle.await;
        }
        debug!("iteration loop stopped");
        Ok(())
    }

    /// Run one iteration step on the caller's task and return the
    /// engine-recommended delay until the next one. Mutually exclusive with
    /// the background loop.
    pub fn iterate_once(&self) -> Result<Duration, InstanceError> {
        let interval = {
            let mut inner = self.lock();
            if inner.engine.is_none() {
                return Err(InstanceError::Disposed);
            }
            if inner.running {
                return Err(InstanceError::LoopAlreadyRunning);
            }
            step(&mut inner).ok_or(InstanceError::Disposed)?
        };
        dispatch_pending(&self.inner);
        Ok(interval)
    }

    /// Tear the instance down: cancel the loop, drop every subscription so
    /// nothing is delivered late, and release the engine handle exactly
    /// once. Safe to call repeatedly; later calls are no-ops.
    pub async fn dispose(&self) {
        {
            let inner = self.lock();
            if inner.engine.is_none() {
                return;
            }
        }
        self.cancel.trigger();
        if let Some(handle) = self.take_loop_task() {
            let _ = handle.await;
        }
        let mut inner = self.lock();
        inner.bridge.clear();
        inner.running = false;
        // Dropping the box releases the handle; `take` makes it exactly once.
        drop(inner.engine.take());
        debug!("instance disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().engine.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    // ---- events ----

    /// Attach a handler for an event kind. The engine-side callback is
    /// installed when the first handler for a kind attaches. Custom packet
    /// kinds are subscribed per leading byte instead.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Result<Subscription, InstanceError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if matches!(kind, EventKind::LossyPacket | EventKind::LosslessPacket) {
            return Err(InstanceError::PacketKindSubscription);
        }
        let mut inner = self.lock();
        let inner = &mut *inner;
        let engine = match inner.engine.as_mut() {
            Some(engine) => engine.as_mut(),
            None => return Err(InstanceError::Disposed),
        };
        let handler: Handler = Arc::new(handler);
        Ok(inner.bridge.subscribe(engine, kind, handler))
    }

    /// Attach a handler for inbound lossy packets with the given first byte.
    pub fn on_lossy_packet<F>(
        &self,
        first_byte: u8,
        handler: F,
    ) -> Result<Subscription, InstanceError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if !LOSSY_FIRST_BYTE.contains(&first_byte) {
            return Err(InstanceError::PacketOutOfRange(first_byte));
        }
        let mut inner = self.lock();
        let inner = &mut *inner;
        let engine = match inner.engine.as_mut() {
            Some(engine) => engine.as_mut(),
            None => return Err(InstanceError::Disposed),
        };
        let handler: Handler = Arc::new(handler);
        Ok(inner.bridge.subscribe_lossy(engine, first_byte, handler))
    }

    /// Attach a handler for inbound lossless packets with the given first
    /// byte.
    pub fn on_lossless_packet<F>(
        &self,
        first_byte: u8,
        handler: F,
    ) -> Result<Subscription, InstanceError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if !LOSSLESS_FIRST_BYTE.contains(&first_byte) {
            return Err(InstanceError::PacketOutOfRange(first_byte));
        }
        let mut inner = self.lock();
        let inner = &mut *inner;
        let engine = match inner.engine.as_mut() {
            Some(engine) => engine.as_mut(),
            None => return Err(InstanceError::Disposed),
        };
        let handler: Handler = Arc::new(handler);
        Ok(inner.bridge.subscribe_lossless(engine, first_byte, handler))
    }

    /// Detach a handler. When the last handler for a kind detaches, the
    /// engine-side callback is removed.
    pub fn unsubscribe(&self, sub: Subscription) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let engine = match inner.engine.as_mut() {
            Some(engine) => engine.as_mut(),
            None => return Err(InstanceError::Disposed),
        };
        inner.bridge.unsubscribe(engine, sub);
        Ok(())
    }

    /// Replace the delivery strategy for subsequent events.
    pub fn set_invoker(&self, invoker: Invoker) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        if inner.engine.is_none() {
            return Err(InstanceError::Disposed);
        }
        inner.bridge.set_invoker(invoker);
        Ok(())
    }

    // ---- self state ----

    pub fn address(&self) -> Result<Address, InstanceError> {
        let mut inner = self.lock();
        let bytes = inner.engine()?.address();
        Address::from_bytes(&bytes)
            .map_err(|_| EngineError::Failure("engine returned an invalid address".into()).into())
    }

    pub fn keys(&self) -> Result<KeyPair, InstanceError> {
        let mut inner = self.lock();
        let engine = inner.engine()?;
        Ok(KeyPair {
            public: PublicKey::from_bytes(engine.public_key()),
            secret: SecretKey::from_bytes(engine.secret_key()),
        })
    }

    pub fn is_connected(&self) -> Result<bool, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.is_connected())
    }

    pub fn name(&self) -> Result<String, InstanceError> {
        let mut inner = self.lock();
        Ok(text(&inner.engine()?.name()))
    }

    pub fn set_name(&self, name: &str) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.set_name(name.as_bytes())?)
    }

    pub fn status_message(&self) -> Result<String, InstanceError> {
        let mut inner = self.lock();
        Ok(text(&inner.engine()?.status_message()))
    }

    pub fn set_status_message(&self, message: &str) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.set_status_message(message.as_bytes())?)
    }

    pub fn status(&self) -> Result<UserStatus, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.user_status())
    }

    pub fn set_status(&self, status: UserStatus) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        inner.engine()?.set_user_status(status);
        Ok(())
    }

    pub fn nospam(&self) -> Result<u32, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.nospam())
    }

    pub fn set_nospam(&self, nospam: u32) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        inner.engine()?.set_nospam(nospam);
        Ok(())
    }

    // ---- save data ----

    /// Snapshot the full instance state into a plaintext envelope.
    pub fn snapshot(&self) -> Result<SaveData, InstanceError> {
        let mut inner = self.lock();
        Ok(SaveData::from_bytes(inner.engine()?.save()?))
    }

    /// Snapshot into a passphrase-encrypted envelope. An empty passphrase is
    /// legal (weak, but not rejected here).
    pub fn snapshot_encrypted(&self, passphrase: &str) -> Result<SaveData, InstanceError> {
        let mut inner = self.lock();
        Ok(SaveData::from_bytes(
            inner.engine()?.save_encrypted(passphrase.as_bytes())?,
        ))
    }

    /// Apply a plaintext envelope, fully replacing in-memory state. Returns
    /// `Ok(false)` without touching anything when the envelope is encrypted
    /// or the engine rejects it as incompatible.
    pub fn restore(&self, data: &SaveData) -> Result<bool, InstanceError> {
        let mut inner = self.lock();
        let engine = inner.engine()?;
        if data.is_encrypted() {
            return Ok(false);
        }
        match engine.load(data.as_bytes()) {
            Ok(()) => Ok(true),
            Err(EngineError::Incompatible) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Decrypt and apply an encrypted envelope. A plaintext envelope falls
    /// back to the plaintext path (permissive, not an error). A wrong
    /// passphrase or corrupted data surfaces as `EngineError::Decryption`.
    pub fn restore_encrypted(
        &self,
        data: &SaveData,
        passphrase: &str,
    ) -> Result<bool, InstanceError> {
        let mut inner = self.lock();
        let engine = inner.engine()?;
        if !data.is_encrypted() {
            return match engine.load(data.as_bytes()) {
                Ok(()) => Ok(true),
                Err(EngineError::Incompatible) => Ok(false),
                Err(err) => Err(err.into()),
            };
        }
        engine.load_encrypted(data.as_bytes(), passphrase.as_bytes())?;
        Ok(true)
    }

    // ---- friends ----

    /// Send a friend request to an address. Returns the new friend number.
    pub fn add_friend(&self, address: &Address, message: &str) -> Result<u32, InstanceError> {
        let mut inner = self.lock();
        Ok(inner
            .engine()?
            .add_friend(address.as_bytes(), message.as_bytes())?)
    }

    /// Add a friend from a bare public key, without sending a request.
    pub fn add_friend_no_request(&self, public_key: &PublicKey) -> Result<u32, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.add_friend_no_request(public_key.as_bytes())?)
    }

    pub fn delete_friend(&self, friend: u32) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.delete_friend(friend)?)
    }

    pub fn friend_list(&self) -> Result<Vec<u32>, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.friend_list())
    }

    pub fn friend_exists(&self, friend: u32) -> Result<bool, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.friend_exists(friend))
    }

    /// Look up the friend number for a known public key.
    pub fn friend_by_public_key(&self, public_key: &PublicKey) -> Result<u32, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.friend_by_public_key(public_key.as_bytes())?)
    }

    pub fn friend_public_key(&self, friend: u32) -> Result<PublicKey, InstanceError> {
        let mut inner = self.lock();
        Ok(PublicKey::from_bytes(
            inner.engine()?.friend_public_key(friend)?,
        ))
    }

    pub fn friend_name(&self, friend: u32) -> Result<String, InstanceError> {
        let mut inner = self.lock();
        Ok(text(&inner.engine()?.friend_name(friend)?))
    }

    pub fn friend_status_message(&self, friend: u32) -> Result<String, InstanceError> {
        let mut inner = self.lock();
        Ok(text(&inner.engine()?.friend_status_message(friend)?))
    }

    pub fn friend_status(&self, friend: u32) -> Result<UserStatus, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.friend_user_status(friend)?)
    }

    pub fn friend_is_online(&self, friend: u32) -> Result<bool, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.friend_is_online(friend)?)
    }

    pub fn friend_is_typing(&self, friend: u32) -> Result<bool, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.friend_is_typing(friend)?)
    }

    pub fn set_typing(&self, friend: u32, typing: bool) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.set_typing(friend, typing)?)
    }

    /// Send a text message. Returns the read-receipt id.
    pub fn send_message(&self, friend: u32, message: &str) -> Result<u32, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.send_message(friend, message.as_bytes())?)
    }

    /// Send an action ("/me") message. Returns the read-receipt id.
    pub fn send_action(&self, friend: u32, action: &str) -> Result<u32, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.send_action(friend, action.as_bytes())?)
    }

    // ---- file transfers ----

    /// Offer a file to a friend. The filename is validated locally before the
    /// engine sees it.
    pub fn send_file_request(
        &self,
        friend: u32,
        size: u64,
        filename: &str,
    ) -> Result<u32, InstanceError> {
        if filename.len() > MAX_FILENAME_LENGTH {
            return Err(InstanceError::FilenameTooLong);
        }
        let mut inner = self.lock();
        Ok(inner
            .engine()?
            .file_send_request(friend, size, filename.as_bytes())?)
    }

    pub fn file_control(
        &self,
        friend: u32,
        file: u32,
        inbound: bool,
        control: FileControl,
    ) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.file_control(friend, file, inbound, control)?)
    }

    pub fn send_file_data(&self, friend: u32, file: u32, data: &[u8]) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.file_send_data(friend, file, data)?)
    }

    pub fn file_chunk_size(&self, friend: u32) -> Result<usize, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.file_chunk_size(friend)?)
    }

    // ---- groups ----

    /// Create a group chat. Returns the group number.
    pub fn create_group(&self, name: &str) -> Result<u32, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.group_new(name.as_bytes())?)
    }

    pub fn leave_group(&self, group: u32, part_message: &str) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.group_delete(group, part_message.as_bytes())?)
    }

    pub fn invite_to_group(&self, group: u32, friend: u32) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.group_invite_friend(group, friend)?)
    }

    /// Join a group from an invite key. Returns the group number.
    pub fn join_group(&self, invite_key: &[u8]) -> Result<u32, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.group_join(invite_key)?)
    }

    /// Key that lets another peer join this group out of band.
    pub fn group_invite_key(&self, group: u32) -> Result<Vec<u8>, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.group_invite_key(group)?)
    }

    pub fn send_group_message(&self, group: u32, message: &str) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.group_message_send(group, message.as_bytes())?)
    }

    pub fn send_group_action(&self, group: u32, action: &str) -> Result<(), InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.group_action_send(group, action.as_bytes())?)
    }

    /// Set the group topic. Validated locally against the byte cap first.
    pub fn set_group_topic(&self, group: u32, topic: &str) -> Result<(), InstanceError> {
        if topic.len() > MAX_GROUP_TOPIC_LENGTH {
            return Err(InstanceError::TopicTooLong);
        }
        let mut inner = self.lock();
        Ok(inner.engine()?.group_set_topic(group, topic.as_bytes())?)
    }

    pub fn group_topic(&self, group: u32) -> Result<String, InstanceError> {
        let mut inner = self.lock();
        Ok(text(&inner.engine()?.group_topic(group)?))
    }

    pub fn group_name(&self, group: u32) -> Result<String, InstanceError> {
        let mut inner = self.lock();
        Ok(text(&inner.engine()?.group_name(group)?))
    }

    pub fn group_peer_count(&self, group: u32) -> Result<u32, InstanceError> {
        let mut inner = self.lock();
        Ok(inner.engine()?.group_peer_count(group)?)
    }

    pub fn group_peer_name(&self, group: u32, peer: u32) -> Result<String, InstanceError> {
        let mut inner = self.lock();
        Ok(text(&inner.engine()?.group_peer_name(group, peer)?))
    }

    /// Names of every member currently in the group.
    pub fn group_peer_names(&self, group: u32) -> Result<Vec<String>, InstanceError> {
        let mut inner = self.lock();
        let engine = inner.engine()?;
        let peers = engine.group_peer_list(group)?;
        let mut names = Vec::with_capacity(peers.len());
        for peer in peers {
            names.push(text(&engine.group_peer_name(group, peer)?));
        }
        Ok(names)
    }

    // ---- custom packets ----

    /// Send a lossy packet. The first byte must be inside the reserved lossy
    /// range; violations never reach the engine.
    pub fn send_lossy_packet(&self, friend: u32, data: &[u8]) -> Result<(), InstanceError> {
        validate_packet(data, LOSSY_FIRST_BYTE)?;
        let mut inner = self.lock();
        Ok(inner.engine()?.send_lossy_packet(friend, data)?)
    }

    /// Send a lossless packet. The first byte must be inside the reserved
    /// lossless range; violations never reach the engine.
    pub fn send_lossless_packet(&self, friend: u32, data: &[u8]) -> Result<(), InstanceError> {
        validate_packet(data, LOSSLESS_FIRST_BYTE)?;
        let mut inner = self.lock();
        Ok(inner.engine()?.send_lossless_packet(friend, data)?)
    }
}

fn validate_packet(
    data: &[u8],
    range: std::ops::RangeInclusive<u8>,
) -> Result<(), InstanceError> {
    let first = *data.first().ok_or(InstanceError::PacketEmpty)?;
    if data.len() > MAX_CUSTOM_PACKET_SIZE {
        return Err(InstanceError::PacketTooLarge);
    }
    if !range.contains(&first) {
        return Err(InstanceError::PacketOutOfRange(first));
    }
    Ok(())
}

impl Drop for Instance {
    fn drop(&mut self) {
        // Let a detached loop task wind down; it holds the only other
        // references to the engine.
        self.cancel.trigger();
    }
}

/// One pass of the iteration body: engine step, connectivity edge detection,
/// interval query. Returns `None` when the instance was disposed under the
/// loop.
fn step(inner: &mut Inner) -> Option<Duration> {
    let connected_before = inner.connected;
    let engine = inner.engine.as_mut()?;
    if let Err(err) = engine.iterate() {
        warn!(error = %err, "engine iteration step failed");
    }
    let interval = engine.iteration_interval();
    let connected_now = engine.is_connected();
    if connected_now != connected_before {
        inner.connected = connected_now;
        inner.bridge.push(if connected_now {
            Event::Connected
        } else {
            Event::Disconnected
        });
    }
    Some(interval)
}

/// Drain the boundary queue in order, invoking matching handlers outside the
/// instance lock so they may call back into the instance.
fn dispatch_pending(inner: &Arc<Mutex<Inner>>) {
    loop {
        let (event, handlers, invoker) = {
            let guard = lock(inner);
            match guard.bridge.pop() {
                Some(event) => {
                    let handlers = guard.bridge.handlers_for(&event);
                    (event, handlers, guard.bridge.invoker())
                }
                None => break,
            }
        };
        if handlers.is_empty() {
            continue;
        }
        invoker(Box::new(move || {
            for handler in &handlers {
                handler(&event);
            }
        }));
    }
}

async fn run_loop(inner: Arc<Mutex<Inner>>, cancel: Arc<LoopCancel>) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let interval = match step(&mut lock(&inner)) {
            Some(interval) => interval,
            None => break,
        };
        dispatch_pending(&inner);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    lock(&inner).running = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackEngine;
    use std::sync::atomic::AtomicUsize;

    fn new_instance() -> (Instance, crate::loopback::LoopbackHandle) {
        let engine = LoopbackEngine::new();
        let handle = engine.handle();
        let instance = Instance::create(Options::default(), None, move |_| {
            Ok(Box::new(engine) as Box<dyn Engine>)
        })
        .unwrap();
        (instance, handle)
    }

    #[test]
    fn self_state_roundtrip() {
        let (instance, _) = new_instance();
        instance.set_name("Test name").unwrap();
        assert_eq!(instance.name().unwrap(), "Test name");
        instance.set_status_message("Test status message").unwrap();
        assert_eq!(instance.status_message().unwrap(), "Test status message");
        instance.set_status(UserStatus::Away).unwrap();
        assert_eq!(instance.status().unwrap(), UserStatus::Away);
    }

    #[test]
    fn nospam_changes_address_not_key() {
        let (instance, _) = new_instance();
        let before = instance.address().unwrap();
        instance.set_nospam(0x0BAD_F00D).unwrap();
        assert_eq!(instance.nospam().unwrap(), 0x0BAD_F00D);
        let after = instance.address().unwrap();
        assert_ne!(before, after);
        assert_eq!(before.public_key(), after.public_key());
        assert!(Address::is_valid(after.as_bytes()));
    }

    #[test]
    fn snapshot_restore_into_fresh_instance() {
        let (first, _) = new_instance();
        first.set_name("Test").unwrap();
        first.set_status_message("Hey").unwrap();
        let data = first.snapshot().unwrap();
        assert!(!data.is_encrypted());

        let (second, _) = new_instance();
        assert!(second.restore(&data).unwrap());
        assert_eq!(second.name().unwrap(), "Test");
        assert_eq!(second.status_message().unwrap(), "Hey");
        assert_eq!(second.address().unwrap(), first.address().unwrap());
    }

    #[test]
    fn create_with_savedata_applies_it() {
        let (first, _) = new_instance();
        first.set_name("Test").unwrap();
        let data = first.snapshot().unwrap();

        let engine = LoopbackEngine::new();
        let second = Instance::create(Options::default(), Some(&data), move |_| {
            Ok(Box::new(engine) as Box<dyn Engine>)
        })
        .unwrap();
        assert_eq!(second.name().unwrap(), "Test");
    }

    #[test]
    fn create_rejects_encrypted_savedata() {
        let (first, _) = new_instance();
        let data = first.snapshot_encrypted("hunter2").unwrap();

        let engine = LoopbackEngine::new();
        let result = Instance::create(Options::default(), Some(&data), move |_| {
            Ok(Box::new(engine) as Box<dyn Engine>)
        });
        assert!(matches!(result, Err(InstanceError::SaveDataEncrypted)));
    }

    #[test]
    fn encrypted_snapshot_roundtrip() {
        let (first, _) = new_instance();
        first.set_name("Test").unwrap();
        let data = first.snapshot_encrypted("hunter2").unwrap();
        assert!(data.is_encrypted());

        let (second, _) = new_instance();
        assert!(second.restore_encrypted(&data, "hunter2").unwrap());
        assert_eq!(second.name().unwrap(), "Test");
        assert_eq!(second.address().unwrap(), first.address().unwrap());
    }

    #[test]
    fn wrong_passphrase_fails_typed() {
        let (first, _) = new_instance();
        let data = first.snapshot_encrypted("hunter2").unwrap();

        let (second, _) = new_instance();
        let result = second.restore_encrypted(&data, "hunter3");
        assert!(matches!(
            result,
            Err(InstanceError::Engine(EngineError::Decryption))
        ));
    }

    #[test]
    fn restore_rejects_encrypted_envelope_without_mutation() {
        let (first, _) = new_instance();
        first.set_name("Keep me").unwrap();
        let encrypted = first.snapshot_encrypted("hunter2").unwrap();

        assert!(!first.restore(&encrypted).unwrap());
        assert_eq!(first.name().unwrap(), "Keep me");
    }

    #[test]
    fn restore_encrypted_falls_back_to_plaintext() {
        let (first, _) = new_instance();
        first.set_name("Test").unwrap();
        let plain = first.snapshot().unwrap();

        let (second, _) = new_instance();
        assert!(second.restore_encrypted(&plain, "ignored").unwrap());
        assert_eq!(second.name().unwrap(), "Test");
    }

    #[test]
    fn lossy_packet_preconditions() {
        let (instance, handle) = new_instance();
        let friend = instance
            .add_friend_no_request(&instance.keys().unwrap().public)
            .unwrap();

        let err = instance
            .send_lossy_packet(friend, &[199, 1, 2])
            .unwrap_err();
        assert!(matches!(err, InstanceError::PacketOutOfRange(199)));
        assert_eq!(handle.sent_lossy().len(), 0);

        instance.send_lossy_packet(friend, &[200, 1, 2]).unwrap();
        assert_eq!(handle.sent_lossy().len(), 1);

        let err = instance.send_lossy_packet(friend, &[]).unwrap_err();
        assert!(matches!(err, InstanceError::PacketEmpty));
        let err = instance
            .send_lossy_packet(friend, &vec![200u8; MAX_CUSTOM_PACKET_SIZE + 1])
            .unwrap_err();
        assert!(matches!(err, InstanceError::PacketTooLarge));
    }

    #[test]
    fn lossless_packet_preconditions() {
        let (instance, handle) = new_instance();
        let friend = instance
            .add_friend_no_request(&instance.keys().unwrap().public)
            .unwrap();

        for bad in [159u8, 192, 200] {
            let err = instance
                .send_lossless_packet(friend, &[bad, 0])
                .unwrap_err();
            assert!(matches!(err, InstanceError::PacketOutOfRange(b) if b == bad));
        }
        assert_eq!(handle.sent_lossless().len(), 0);

        instance.send_lossless_packet(friend, &[160, 0]).unwrap();
        instance.send_lossless_packet(friend, &[191, 0]).unwrap();
        assert_eq!(handle.sent_lossless().len(), 2);
    }

    #[test]
    fn filename_and_topic_caps() {
        let (instance, _) = new_instance();
        let friend = instance
            .add_friend_no_request(&instance.keys().unwrap().public)
            .unwrap();

        let long_name = "x".repeat(MAX_FILENAME_LENGTH + 1);
        assert!(matches!(
            instance.send_file_request(friend, 10, &long_name),
            Err(InstanceError::FilenameTooLong)
        ));
        instance
            .send_file_request(friend, 10, "notes.txt")
            .unwrap();

        let group = instance.create_group("room").unwrap();
        let long_topic = "y".repeat(MAX_GROUP_TOPIC_LENGTH + 1);
        assert!(matches!(
            instance.set_group_topic(group, &long_topic),
            Err(InstanceError::TopicTooLong)
        ));
        instance.set_group_topic(group, "hello").unwrap();
        assert_eq!(instance.group_topic(group).unwrap(), "hello");
    }

    #[test]
    fn subscription_reference_counting() {
        let (instance, handle) = new_instance();

        let a = instance
            .subscribe(EventKind::FriendMessage, |_| {})
            .unwrap();
        let b = instance
            .subscribe(EventKind::FriendMessage, |_| {})
            .unwrap();
        assert_eq!(handle.callback_registrations(EventKind::FriendMessage), 1);

        instance.unsubscribe(a).unwrap();
        assert_eq!(handle.callback_removals(EventKind::FriendMessage), 0);
        instance.unsubscribe(b).unwrap();
        assert_eq!(handle.callback_removals(EventKind::FriendMessage), 1);
    }

    #[test]
    fn packet_kind_subscription_rejected() {
        let (instance, _) = new_instance();
        assert!(matches!(
            instance.subscribe(EventKind::LossyPacket, |_| {}),
            Err(InstanceError::PacketKindSubscription)
        ));
        assert!(matches!(
            instance.on_lossy_packet(199, |_| {}),
            Err(InstanceError::PacketOutOfRange(199))
        ));
        assert!(matches!(
            instance.on_lossless_packet(192, |_| {}),
            Err(InstanceError::PacketOutOfRange(192))
        ));
    }

    #[test]
    fn events_flow_through_iterate_once() {
        let (instance, handle) = new_instance();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        instance
            .subscribe(EventKind::FriendMessage, move |event| {
                if let Event::FriendMessage { friend, message } = event {
                    sink.lock().unwrap().push((*friend, message.clone()));
                }
            })
            .unwrap();

        handle.push_friend_message(3, b"first");
        handle.push_friend_message(3, b"second");
        instance.iterate_once().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![(3, "first".to_string()), (3, "second".to_string())]
        );
    }

    #[test]
    fn packets_route_by_leading_byte() {
        let (instance, handle) = new_instance();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        instance
            .on_lossy_packet(200, move |event| {
                if let Event::LossyPacket { data, .. } = event {
                    sink.lock().unwrap().push(data.clone());
                }
            })
            .unwrap();

        handle.push_lossy_packet(0, &[200, 42]);
        handle.push_lossy_packet(0, &[201, 43]);
        instance.iterate_once().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![vec![200, 42]]);
    }

    #[test]
    fn invoker_override_is_used() {
        let (instance, handle) = new_instance();
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invoked);
        instance
            .set_invoker(Arc::new(move |dispatch| {
                counter.fetch_add(1, Ordering::SeqCst);
                dispatch();
            }))
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        instance
            .subscribe(EventKind::FriendMessage, move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        handle.push_friend_message(1, b"hi");
        instance.iterate_once().unwrap();

        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_stop_idempotent_and_exclusive() {
        let (instance, handle) = new_instance();
        handle.set_interval(Duration::from_millis(1));

        instance.start().unwrap();
        instance.start().unwrap();
        assert!(instance.is_running());
        assert!(matches!(
            instance.iterate_once(),
            Err(InstanceError::LoopAlreadyRunning)
        ));

        instance.stop().await.unwrap();
        instance.stop().await.unwrap();
        assert!(!instance.is_running());
        instance.iterate_once().unwrap();
        instance.dispose().await;
    }

    #[tokio::test]
    async fn loop_iterates_and_raises_connectivity_edges() {
        let (instance, handle) = new_instance();
        handle.set_interval(Duration::from_millis(1));

        let edges = Arc::new(Mutex::new(Vec::new()));
        let up = Arc::clone(&edges);
        instance
            .subscribe(EventKind::Connected, move |_| {
                up.lock().unwrap().push(true);
            })
            .unwrap();
        let down = Arc::clone(&edges);
        instance
            .subscribe(EventKind::Disconnected, move |_| {
                down.lock().unwrap().push(false);
            })
            .unwrap();

        instance.start().unwrap();
        handle.set_connected(true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.set_connected(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        instance.stop().await.unwrap();

        assert!(handle.iterations() > 1);
        assert_eq!(*edges.lock().unwrap(), vec![true, false]);
        instance.dispose().await;
    }

    #[tokio::test]
    async fn dispose_is_terminal_and_idempotent() {
        let (instance, _) = new_instance();
        instance.start().unwrap();
        instance.dispose().await;

        assert!(instance.is_disposed());
        assert!(matches!(instance.name(), Err(InstanceError::Disposed)));
        assert!(matches!(
            instance.set_name("x"),
            Err(InstanceError::Disposed)
        ));
        assert!(matches!(instance.address(), Err(InstanceError::Disposed)));
        assert!(matches!(instance.snapshot(), Err(InstanceError::Disposed)));
        assert!(matches!(
            instance.iterate_once(),
            Err(InstanceError::Disposed)
        ));
        assert!(matches!(instance.start(), Err(InstanceError::Disposed)));
        assert!(matches!(
            instance.subscribe(EventKind::FriendMessage, |_| {}),
            Err(InstanceError::Disposed)
        ));

        // Second dispose is a no-op, not an error.
        instance.dispose().await;
        assert!(instance.is_disposed());
    }

    #[tokio::test]
    async fn dispose_clears_subscriptions_before_release() {
        let (instance, handle) = new_instance();
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        instance
            .subscribe(EventKind::FriendMessage, move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        handle.push_friend_message(0, b"never delivered");
        instance.dispose().await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn engine_creation_failure_is_fatal() {
        let result = Instance::create(Options::default(), None, |_| {
            Err(EngineError::Failure("allocation failed".into()))
        });
        assert!(matches!(result, Err(InstanceError::Creation(_))));
    }

    #[test]
    fn friend_management_passthrough() {
        let (instance, _) = new_instance();
        let (other, _) = new_instance();
        other.set_name("Friendly").unwrap();

        let friend = instance
            .add_friend(&other.address().unwrap(), "hello there")
            .unwrap();
        let other_key = other.address().unwrap().public_key();
        assert_eq!(instance.friend_list().unwrap(), vec![friend]);
        assert!(instance.friend_exists(friend).unwrap());
        assert_eq!(instance.friend_public_key(friend).unwrap(), other_key);
        assert_eq!(instance.friend_by_public_key(&other_key).unwrap(), friend);

        instance.delete_friend(friend).unwrap();
        assert!(instance.friend_list().unwrap().is_empty());
        assert!(!instance.friend_exists(friend).unwrap());
        assert!(matches!(
            instance.friend_name(friend),
            Err(InstanceError::Engine(EngineError::FriendNotFound))
        ));
        assert!(matches!(
            instance.friend_by_public_key(&other_key),
            Err(InstanceError::Engine(EngineError::FriendNotFound))
        ));
    }

    #[test]
    fn group_invite_key_roundtrip() {
        let (instance, _) = new_instance();
        let group = instance.create_group("room").unwrap();
        let key = instance.group_invite_key(group).unwrap();
        assert!(!key.is_empty());

        let (joiner, _) = new_instance();
        let joined = joiner.join_group(&key).unwrap();
        assert_eq!(joiner.group_peer_count(joined).unwrap(), 1);
    }
}
