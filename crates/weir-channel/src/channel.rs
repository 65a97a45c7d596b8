// The channel engine: accepts messages from the topic, hands them to
// consumers, and accounts for acks, requeues, and timeouts.
//
// Lock order is exit lock, then the consumer registry, then at most one
// tracker lock. Tracker locks are siblings; no path holds both.
use crate::backlog::Backlog;
use crate::consumer::Consumer;
use crate::latency::LatencyEstimator;
use crate::message::{MIN_ENCODED_LEN, Message, now_nanos};
use crate::tracker::Tracker;
use crate::{ChannelError, Result};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use weir_common::ids::{ClientId, MessageId};
use weir_common::{ChannelOptions, EPHEMERAL_SUFFIX, Health};
use weir_storage::{BackendQueue, EphemeralBackend, FileBackend};

/// Invoked at most once when an ephemeral channel loses its last consumer.
pub type DeleteCallback = Arc<dyn Fn() + Send + Sync>;

/// Announces channel lifecycle transitions (creation, deletion) to the
/// discovery layer. Internals are the enclosing daemon's business.
pub trait Notifier: Send + Sync {
    fn notify(&self, topic_name: &str, channel_name: &str);
}

/// Collaborators the channel reaches out to. Everything is optional; the
/// defaults give a self-contained channel.
#[derive(Clone)]
pub struct ChannelContext {
    pub health: Arc<Health>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub delete_callback: Option<DeleteCallback>,
}

impl Default for ChannelContext {
    fn default() -> Self {
        Self {
            health: Arc::new(Health::new()),
            notifier: None,
            delete_callback: None,
        }
    }
}

/// One consumption stream of a topic.
///
/// Every published message lands in the in-memory backlog or spills to the
/// durable backend; delivery moves it into the in-flight tracker until the
/// owning consumer finishes, requeues, or times out.
///
/// ```
/// use bytes::Bytes;
/// use std::time::Duration;
/// use weir_channel::{Channel, ChannelContext, Message};
/// use weir_common::ChannelOptions;
/// use weir_common::ids::{ClientId, IdFactory};
///
/// let channel = Channel::new(
///     "orders",
///     "mailer#ephemeral",
///     ChannelOptions::default(),
///     ChannelContext::default(),
/// )
/// .expect("channel");
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let factory = IdFactory::new();
///     let msg = Message::new(factory.next_id(), Bytes::from_static(b"hello"));
///     channel.put_message(msg).await.expect("put");
///     let msg = channel.next_message().await.expect("next").expect("queued");
///     channel
///         .start_in_flight_timeout(msg, ClientId::new(1), Duration::from_secs(30))
///         .expect("in flight");
/// });
/// ```
pub struct Channel {
    message_count: AtomicU64,
    requeue_count: AtomicU64,
    timeout_count: AtomicU64,

    topic_name: String,
    name: String,
    ephemeral: bool,
    opts: ChannelOptions,

    backend: Box<dyn BackendQueue>,
    backlog: Option<Backlog>,

    exiting: AtomicBool,
    exit_lock: RwLock<()>,

    // Registry of connected consumers; doubles as the channel's main lock.
    clients: RwLock<HashMap<ClientId, Arc<dyn Consumer>>>,
    paused: AtomicBool,

    delete_callback: Option<DeleteCallback>,
    delete_latch: AtomicBool,

    in_flight: Tracker,
    deferred: Tracker,

    e2e_latency: Option<LatencyEstimator>,
    health: Arc<Health>,
    notifier: Option<Arc<dyn Notifier>>,
}

fn tracker_capacity(mem_queue_size: usize) -> usize {
    (mem_queue_size / 10).max(1)
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

fn backend_name(topic_name: &str, channel_name: &str) -> String {
    // Backend names include the topic so channels stay unique on disk.
    format!("{topic_name}:{channel_name}")
}

impl Channel {
    pub fn new(
        topic_name: impl Into<String>,
        channel_name: impl Into<String>,
        opts: ChannelOptions,
        ctx: ChannelContext,
    ) -> Result<Self> {
        let topic_name = topic_name.into();
        let name = channel_name.into();
        let ephemeral = name.ends_with(EPHEMERAL_SUFFIX);

        let backend: Box<dyn BackendQueue> = if ephemeral {
            Box::new(EphemeralBackend::new())
        } else {
            Box::new(FileBackend::new(
                backend_name(&topic_name, &name),
                &opts.data_path,
                MIN_ENCODED_LEN,
                opts.max_msg_size + MIN_ENCODED_LEN,
            )?)
        };

        // No backlog when size is 0 on a durable channel, for strict FIFO.
        let backlog =
            (opts.mem_queue_size > 0 || ephemeral).then(|| Backlog::new(opts.mem_queue_size));
        let capacity = tracker_capacity(opts.mem_queue_size);
        let e2e_latency =
            (opts.e2e_latency_window > 0).then(|| LatencyEstimator::new(opts.e2e_latency_window));

        let channel = Self {
            message_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            topic_name,
            name,
            ephemeral,
            opts,
            backend,
            backlog,
            exiting: AtomicBool::new(false),
            exit_lock: RwLock::new(()),
            clients: RwLock::new(HashMap::new()),
            paused: AtomicBool::new(false),
            delete_callback: ctx.delete_callback,
            delete_latch: AtomicBool::new(false),
            in_flight: Tracker::new(capacity),
            deferred: Tracker::new(capacity),
            e2e_latency,
            health: ctx.health,
            notifier: ctx.notifier,
        };

        if !channel.ephemeral
            && let Some(notifier) = &channel.notifier
        {
            notifier.notify(&channel.topic_name, &channel.name);
        }

        Ok(channel)
    }

    /// Replaces the durable backend, for callers that bring their own queue.
    pub fn with_backend(mut self, backend: Box<dyn BackendQueue>) -> Self {
        self.backend = backend;
        self
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn requeue_count(&self) -> u64 {
        self.requeue_count.load(Ordering::Relaxed)
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeout_count.load(Ordering::Relaxed)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Consumable depth: backlog plus backend. In-flight and deferred
    /// messages are not counted.
    pub fn depth(&self) -> i64 {
        let backlog_len = self.backlog.as_ref().map_or(0, |b| b.len() as i64);
        backlog_len + self.backend.depth()
    }

    /// End-to-end processing latency at percentile `p`, when the estimator
    /// is configured.
    pub fn e2e_latency_percentile(&self, p: f64) -> Option<u64> {
        self.e2e_latency.as_ref()?.percentile(p)
    }

    /// Accepts one message from the topic.
    pub async fn put_message(&self, msg: Message) -> Result<()> {
        let _exit = self.exit_lock.read().await;
        if self.exiting() {
            return Err(ChannelError::Exiting);
        }
        self.put(msg).await?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("channel_messages_total").increment(1);
        Ok(())
    }

    /// Accepts one message scheduled for future release into the backlog.
    pub fn put_message_deferred(&self, msg: Message, timeout: Duration) -> Result<()> {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("channel_messages_total").increment(1);
        self.start_deferred_timeout(msg, timeout)
    }

    async fn put(&self, msg: Message) -> Result<()> {
        let msg = match &self.backlog {
            Some(backlog) => match backlog.try_push(msg) {
                Ok(()) => return Ok(()),
                Err(msg) => msg,
            },
            None => msg,
        };

        let result = self.write_to_backend(&msg).await;
        match &result {
            Ok(()) => self.health.set_ok(),
            Err(err) => {
                self.health.set_error(err.to_string());
                tracing::error!(
                    topic = %self.topic_name,
                    channel = %self.name,
                    error = %err,
                    "failed to write message to backend"
                );
            }
        }
        result.map_err(ChannelError::from)
    }

    async fn write_to_backend(&self, msg: &Message) -> weir_storage::Result<()> {
        let mut buf = BytesMut::with_capacity(msg.encoded_len());
        msg.encode(&mut buf);
        self.backend.put(buf.freeze()).await
    }

    /// Hands the oldest consumable message to the session layer: memory
    /// first, then the backend read stream. Ordering across a spill
    /// boundary is not preserved; configure `mem_queue_size == 0` when
    /// strict FIFO matters.
    pub async fn next_message(&self) -> Result<Option<Message>> {
        if let Some(backlog) = &self.backlog
            && let Some(msg) = backlog.pop()
        {
            return Ok(Some(msg));
        }
        match self.backend.read_next().await? {
            Some(data) => Ok(Some(Message::decode(data)?)),
            None => Ok(None),
        }
    }

    /// Marks `msg` as delivered to `client_id` and starts its ack deadline.
    pub fn start_in_flight_timeout(
        &self,
        mut msg: Message,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<()> {
        let now = now_nanos();
        msg.owner = Some(client_id);
        msg.delivery_ts = now;
        self.in_flight.push(msg, now + duration_nanos(timeout))
    }

    /// Schedules `msg` for release into the backlog after `timeout`.
    pub fn start_deferred_timeout(&self, msg: Message, timeout: Duration) -> Result<()> {
        self.deferred.push(msg, now_nanos() + duration_nanos(timeout))
    }

    /// Extends an in-flight message's deadline. The new deadline is capped
    /// at `delivery_ts + max_msg_timeout` so a client cannot hold a message
    /// forever.
    pub fn touch_message(
        &self,
        client_id: ClientId,
        id: MessageId,
        new_timeout: Duration,
    ) -> Result<()> {
        let tracked = self.in_flight.pop(id, Some(client_id), true)?;

        let mut deadline = now_nanos() + duration_nanos(new_timeout);
        let cap = tracked.msg.delivery_ts + duration_nanos(self.opts.max_msg_timeout);
        if deadline >= cap {
            deadline = cap;
        }
        self.in_flight.update_deadline(&tracked, deadline);
        Ok(())
    }

    /// Successfully discards an in-flight message.
    pub fn finish_message(&self, client_id: ClientId, id: MessageId) -> Result<()> {
        let tracked = self.in_flight.pop(id, Some(client_id), false)?;
        self.in_flight.remove_from_heap(&tracked);
        if let Some(estimator) = &self.e2e_latency {
            estimator.insert(tracked.msg.timestamp);
        }
        Ok(())
    }

    /// Returns an in-flight message to the consumable stream: immediately
    /// when `timeout` is zero, otherwise as a deferred requeue after the
    /// given delay. Neither path counts as a new message.
    pub async fn requeue_message(
        &self,
        client_id: ClientId,
        id: MessageId,
        timeout: Duration,
    ) -> Result<()> {
        let tracked = self.in_flight.pop(id, Some(client_id), false)?;
        self.in_flight.remove_from_heap(&tracked);
        self.requeue_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("channel_requeues_total").increment(1);

        let mut msg = tracked.msg.clone();
        msg.owner = None;

        if timeout.is_zero() {
            let _exit = self.exit_lock.read().await;
            if self.exiting() {
                return Err(ChannelError::Exiting);
            }
            return self.put(msg).await;
        }
        self.start_deferred_timeout(msg, timeout)
    }

    /// Registers a consumer. Idempotent for an already-registered id.
    pub async fn add_client(&self, client_id: ClientId, client: Arc<dyn Consumer>) -> Result<()> {
        let _exit = self.exit_lock.read().await;
        if self.exiting() {
            return Err(ChannelError::Exiting);
        }

        {
            let clients = self.clients.read().await;
            if clients.contains_key(&client_id) {
                return Ok(());
            }
            let max = self.opts.max_channel_consumers;
            if max != 0 && clients.len() >= max {
                return Err(ChannelError::TooManyConsumers {
                    topic: self.topic_name.clone(),
                    channel: self.name.clone(),
                    max,
                });
            }
        }

        self.clients.write().await.insert(client_id, client);
        Ok(())
    }

    /// Deregisters a consumer. When the last consumer of an ephemeral
    /// channel leaves, the delete callback fires asynchronously, off this
    /// call's lock.
    pub async fn remove_client(&self, client_id: ClientId) {
        let _exit = self.exit_lock.read().await;
        if self.exiting() {
            return;
        }

        {
            let clients = self.clients.read().await;
            if !clients.contains_key(&client_id) {
                return;
            }
        }

        let remaining = {
            let mut clients = self.clients.write().await;
            clients.remove(&client_id);
            clients.len()
        };

        if remaining == 0 && self.ephemeral {
            self.schedule_delete();
        }
    }

    fn schedule_delete(&self) {
        if let Some(callback) = &self.delete_callback
            && self
                .delete_latch
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let callback = Arc::clone(callback);
            tokio::spawn(async move { callback() });
        }
    }

    pub async fn pause(&self) {
        self.set_paused(true).await;
    }

    pub async fn unpause(&self) {
        self.set_paused(false).await;
    }

    async fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
        let clients = self.clients.read().await;
        for client in clients.values() {
            if paused {
                client.pause();
            } else {
                client.unpause();
            }
        }
    }

    /// Discards every queued, in-flight, and deferred message, and asks
    /// consumers to do the same with their own buffers.
    pub async fn empty(&self) -> Result<()> {
        let clients = self.clients.write().await;

        let capacity = tracker_capacity(self.opts.mem_queue_size);
        self.in_flight.reinit(capacity);
        self.deferred.reinit(capacity);
        for client in clients.values() {
            client.empty();
        }
        if let Some(backlog) = &self.backlog {
            backlog.drain();
        }
        self.backend.empty().await.map_err(ChannelError::from)
    }

    /// Empties the channel, deletes the backend files, and deregisters.
    pub async fn delete(&self) -> Result<()> {
        self.exit(true).await
    }

    /// Cleanly closes the channel, flushing pending messages to the
    /// backend so they survive restart.
    pub async fn close(&self) -> Result<()> {
        self.exit(false).await
    }

    async fn exit(&self, deleted: bool) -> Result<()> {
        let _exit = self.exit_lock.write().await;

        if self
            .exiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChannelError::Exiting);
        }

        if deleted {
            tracing::info!(topic = %self.topic_name, channel = %self.name, "deleting");
            // An explicit delete deregisters from discovery, unlike the
            // process-exit close path.
            if !self.ephemeral
                && let Some(notifier) = &self.notifier
            {
                notifier.notify(&self.topic_name, &self.name);
            }
        } else {
            tracing::info!(topic = %self.topic_name, channel = %self.name, "closing");
        }

        {
            let clients = self.clients.read().await;
            for client in clients.values() {
                client.close();
            }
        }

        if deleted {
            self.empty().await?;
            return self.backend.delete().await.map_err(ChannelError::from);
        }

        self.flush().await;
        self.backend.close().await.map_err(ChannelError::from)
    }

    /// Spills everything still in memory to the backend. In-flight and
    /// deferred messages lose their scheduled redelivery timing and
    /// reappear as fresh backlog on the next boot.
    async fn flush(&self) {
        let backlog_len = self.backlog.as_ref().map_or(0, Backlog::len);
        let in_flight_len = self.in_flight.len();
        let deferred_len = self.deferred.len();
        if backlog_len > 0 || in_flight_len > 0 || deferred_len > 0 {
            tracing::info!(
                topic = %self.topic_name,
                channel = %self.name,
                backlog = backlog_len,
                in_flight = in_flight_len,
                deferred = deferred_len,
                "flushing pending messages to backend"
            );
        }

        if let Some(backlog) = &self.backlog {
            while let Some(msg) = backlog.pop() {
                self.flush_one(&msg).await;
            }
        }
        for msg in self.in_flight.messages() {
            self.flush_one(&msg).await;
        }
        for msg in self.deferred.messages() {
            self.flush_one(&msg).await;
        }
    }

    async fn flush_one(&self, msg: &Message) {
        if let Err(err) = self.write_to_backend(msg).await {
            tracing::error!(
                topic = %self.topic_name,
                channel = %self.name,
                error = %err,
                "failed to flush message to backend"
            );
        }
    }

    /// Releases every deferred message whose scheduled time has passed `t`
    /// back into the consumable stream. Returns whether any was released.
    pub async fn process_deferred_queue(&self, t: i64) -> bool {
        let _exit = self.exit_lock.read().await;
        if self.exiting() {
            return false;
        }

        let mut dirty = false;
        while let Some(tracked) = self.deferred.peek_due(t) {
            dirty = true;
            let mut msg = tracked.msg.clone();
            msg.owner = None;
            if let Err(err) = self.put(msg).await {
                tracing::error!(
                    topic = %self.topic_name,
                    channel = %self.name,
                    error = %err,
                    "failed to release deferred message"
                );
            }
        }
        dirty
    }

    /// Requeues every in-flight message whose deadline has passed `t`,
    /// notifying the owning consumer. Returns whether any timed out.
    pub async fn process_in_flight_queue(&self, t: i64) -> bool {
        let _exit = self.exit_lock.read().await;
        if self.exiting() {
            return false;
        }

        let mut dirty = false;
        while let Some(tracked) = self.in_flight.peek_due(t) {
            dirty = true;
            self.timeout_count.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("channel_timeouts_total").increment(1);

            let client = match tracked.msg.owner {
                Some(owner) => self.clients.read().await.get(&owner).cloned(),
                None => None,
            };
            if let Some(client) = client {
                client.timed_out_message();
            }

            let mut msg = tracked.msg.clone();
            msg.owner = None;
            if let Err(err) = self.put(msg).await {
                tracing::error!(
                    topic = %self.topic_name,
                    channel = %self.name,
                    error = %err,
                    "failed to requeue timed out message"
                );
            }
        }
        dirty
    }
}
