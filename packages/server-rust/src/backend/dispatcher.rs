//! The backend: subscription dispatch and the messaging primitives.
//!
//! A single dispatch task owns the [`SubscriptionRegistry`] and the inbound
//! delivery stream. Registrations reach it as [`RegistryCommand`]s, each
//! acknowledged over a oneshot, so static setup and dynamic registration
//! from handlers take the same path. Deliveries are routed either to the
//! [`Correlator`] (responses) or to a spawned task per matching subscription.

use std::sync::{Arc, Weak};

use anyhow::Context as _;
use parking_lot::Mutex;
use switchboard_core::codes::{HANDLER_ERROR, NO_SUBSCRIBER, OK};
use switchboard_core::{parse_request, parse_response, CallerId, Envelope, Reply, TopicSpace, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{BackendConfig, RequestOptions, SubscriptionOptions};
use super::context::Outbox;
use super::correlator::{Correlator, ResponseCallback};
use super::error::RegistrationError;
use super::exclusive::ExclusivityCoordinator;
use super::handler::{Handler, HandlerKind, Subscription, SubscriptionId};
use super::health;
use super::lifecycle::{LifecycleController, LifecycleState};
use super::registry::{NewSubscription, SubscriptionRegistry};
use super::responder::{Call, Responder};
use crate::isolation;
use crate::pipeline::{Combinator, Pipeline, Step};
use crate::traits::{Delivery, LockStore, Transport};

/// Group used for reply handlers registered without one.
pub const DEFAULT_REPLY_GROUP: &str = "_default";

// ---------------------------------------------------------------------------
// Registry commands
// ---------------------------------------------------------------------------

/// Requests handled by the dispatch task, the registry's only writer.
enum RegistryCommand {
    Add {
        subscription: NewSubscription,
        ack: oneshot::Sender<Result<SubscriptionId, RegistrationError>>,
    },
    Remove {
        topic: String,
        id: Option<SubscriptionId>,
        ack: oneshot::Sender<()>,
    },
    Topics {
        ack: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct BackendInner {
    config: BackendConfig,
    topics: TopicSpace,
    error_topic: Option<String>,
    transport: Arc<dyn Transport>,
    correlator: Correlator,
    exclusivity: ExclusivityCoordinator,
    commands: mpsc::Sender<RegistryCommand>,
    lifecycle: LifecycleController,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a connected backend. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

impl Backend {
    /// Takes over `transport`'s delivery stream and starts dispatching.
    ///
    /// # Errors
    ///
    /// Fails if the transport's delivery stream was already taken, or if the
    /// health check cannot be registered.
    pub async fn connect(
        config: BackendConfig,
        transport: Arc<dyn Transport>,
        lock_store: Arc<dyn LockStore>,
    ) -> anyhow::Result<Self> {
        let deliveries = transport
            .take_deliveries()
            .context("transport delivery stream already taken")?;
        let topics = config.topic_space();

        let correlator = {
            let transport = Arc::clone(&transport);
            let topics = topics.clone();
            Correlator::with_settle_hook(Arc::new(move |id: &CallerId| {
                let transport = Arc::clone(&transport);
                let topic = topics.response(id.as_str());
                tokio::spawn(async move {
                    if let Err(err) = transport.unsubscribe(&topic).await {
                        debug!(%topic, error = %err, "failed to drop response subscription");
                    }
                });
            }))
        };

        let (commands, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let inner = Arc::new(BackendInner {
            error_topic: config.error_topic(),
            exclusivity: ExclusivityCoordinator::new(lock_store, config.lock_ttl),
            topics,
            transport: Arc::clone(&transport),
            correlator,
            commands,
            lifecycle: LifecycleController::new(),
            dispatch_task: Mutex::new(None),
            config,
        });

        let task = tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            transport,
            command_rx,
            deliveries,
            inner.lifecycle.shutdown_receiver(),
        ));
        *inner.dispatch_task.lock() = Some(task);
        inner.lifecycle.set_running();

        let backend = Self { inner };
        if backend.inner.config.health_check {
            health::register(&backend).await?;
        }
        info!(
            namespace = backend.inner.topics.namespace(),
            ident = %backend.inner.config.ident,
            "backend connected"
        );
        Ok(backend)
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn topic_space(&self) -> &TopicSpace {
        &self.inner.topics
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    /// Requests still awaiting a response or timeout.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    // -- messaging ----------------------------------------------------------

    /// Publishes `data` on a raw topic with a fresh sender, uncorrelated.
    ///
    /// # Errors
    ///
    /// Encoding or transport failures.
    pub async fn publish(&self, data: Value, topic: &str) -> anyhow::Result<()> {
        self.publish_envelope(topic, data, None).await
    }

    pub(crate) async fn publish_envelope(&self, topic: &str, data: Value, code: Option<u16>) -> anyhow::Result<()> {
        self.publish_as(topic, data, code, &CallerId::generate()).await
    }

    async fn publish_as(&self, topic: &str, data: Value, code: Option<u16>, sender: &CallerId) -> anyhow::Result<()> {
        let payload = Envelope::new(data, code, sender).encode()?;
        self.inner.transport.publish(topic, payload).await
    }

    /// Publishes a response envelope to `<ns>.response.<sender>`.
    ///
    /// # Errors
    ///
    /// Encoding or transport failures.
    pub async fn send_response(&self, sender: &str, data: Value, code: u16) -> anyhow::Result<()> {
        let topic = self.inner.topics.response(sender);
        self.publish_as(&topic, data, Some(code), &CallerId::from(sender)).await
    }

    /// Requests `<ns>.request.<topic>` and waits for the outcome.
    ///
    /// Failures arrive as status codes: 404 without a subscriber (when
    /// confirmed), 499 on sender timeout, 500/504 from the handler side.
    pub async fn request(&self, data: Value, topic: &str, options: RequestOptions) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.request_with(
            data,
            topic,
            options,
            Box::new(move |reply| {
                let _ = tx.send(reply);
            }),
        )
        .await;
        rx.await.unwrap_or_else(|_| Reply::empty(HANDLER_ERROR))
    }

    /// Callback form of [`request`](Self::request).
    pub async fn request_with(
        &self,
        data: Value,
        topic: &str,
        options: RequestOptions,
        callback: ResponseCallback,
    ) -> CallerId {
        let destination = self.inner.topics.request(topic);
        self.request_raw(data, &destination, options, callback).await
    }

    /// Correlated request to a raw destination topic.
    ///
    /// `callback` runs exactly once, on the dispatch task or a timer task,
    /// and must not block.
    pub async fn request_raw(
        &self,
        data: Value,
        destination: &str,
        options: RequestOptions,
        callback: ResponseCallback,
    ) -> CallerId {
        if self.inner.lifecycle.state() == LifecycleState::Stopped {
            error!(%destination, "request on a stopped backend");
            callback(Reply::new(Value::String("backend is stopped".to_string()), HANDLER_ERROR));
            return CallerId::generate();
        }

        let confirm = options
            .confirm_subscriber
            .unwrap_or(self.inner.config.confirm_subscriber);
        if confirm {
            match self.inner.transport.subscriber_count(destination).await {
                Ok(0) => {
                    info!(%destination, "no subscriber; request not sent");
                    callback(Reply::empty(NO_SUBSCRIBER));
                    return CallerId::generate();
                }
                Ok(_) => {}
                Err(err) => warn!(%destination, error = %err, "subscriber check failed; sending anyway"),
            }
        }

        let timeout = options.timeout.unwrap_or(self.inner.config.default_timeout);
        let correlator = &self.inner.correlator;
        let id = correlator.issue(callback, timeout);

        let response_topic = self.inner.topics.response(id.as_str());
        if let Err(err) = self.inner.transport.subscribe(&response_topic).await {
            error!(%destination, sender = %id, error = %err, "failed to subscribe to response topic");
            correlator.resolve(&id, Value::String(format!("{err:#}")), HANDLER_ERROR);
            return id;
        }
        if !correlator.is_pending(&id) {
            // Settled while subscribing; the settle hook may have run first.
            let _ = self.inner.transport.unsubscribe(&response_topic).await;
            return id;
        }

        if let Err(err) = self.publish_as(destination, data, None, &id).await {
            error!(%destination, sender = %id, error = %err, "failed to publish request");
            correlator.resolve(&id, Value::String(format!("{err:#}")), HANDLER_ERROR);
        }
        id
    }

    /// Signals slot handlers on `<ns>.slot.<topic>`.
    ///
    /// # Errors
    ///
    /// Encoding or transport failures.
    pub async fn signal(&self, data: Value, topic: &str) -> anyhow::Result<()> {
        let destination = self.inner.topics.slot(topic);
        self.publish_envelope(&destination, data, None).await
    }

    /// Signals cannot be correlated: `callback` is logged and dropped, and
    /// the signal is still sent.
    ///
    /// # Errors
    ///
    /// As for [`signal`](Self::signal).
    pub async fn signal_with_callback(
        &self,
        data: Value,
        topic: &str,
        callback: ResponseCallback,
    ) -> anyhow::Result<()> {
        error!(%topic, "signal cannot have a callback; ignoring it");
        drop(callback);
        self.signal(data, topic).await
    }

    /// Sends a request and a signal on the same logical topic.
    ///
    /// # Errors
    ///
    /// Failures of the signal half; the request half reports through
    /// `callback`.
    pub async fn broadcast(
        &self,
        data: Value,
        topic: &str,
        options: RequestOptions,
        callback: ResponseCallback,
    ) -> anyhow::Result<CallerId> {
        let id = self.request_with(data.clone(), topic, options, callback).await;
        self.signal(data, topic).await?;
        Ok(id)
    }

    // -- registration -------------------------------------------------------

    /// Registers a reply handler on `<ns>.request.<topic>`.
    ///
    /// Reply handlers are always exclusive; without a group the
    /// [`DEFAULT_REPLY_GROUP`] is used.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateExclusiveHandler`] if the topic already
    /// has a reply handler in the same group, plus the errors of
    /// [`add_listener`](Self::add_listener).
    pub async fn reply_to(
        &self,
        topic: &str,
        options: SubscriptionOptions,
        handler: impl Handler,
    ) -> Result<SubscriptionId, RegistrationError> {
        let group = match options.exclusive_group {
            Some(group) if !group.is_empty() => group,
            _ => {
                warn!(%topic, group = DEFAULT_REPLY_GROUP, "reply handler registered without an exclusive group");
                DEFAULT_REPLY_GROUP.to_string()
            }
        };
        let options = SubscriptionOptions {
            exclusive_group: Some(group),
            exclusive: true,
            ..options
        };
        let destination = self.inner.topics.request(topic);
        self.add_listener(&destination, options, HandlerKind::Reply, handler).await
    }

    /// Registers a slot handler on `<ns>.slot.<topic>`.
    ///
    /// # Errors
    ///
    /// As for [`add_listener`](Self::add_listener).
    pub async fn slot(
        &self,
        topic: &str,
        options: SubscriptionOptions,
        handler: impl Handler,
    ) -> Result<SubscriptionId, RegistrationError> {
        let destination = self.inner.topics.slot(topic);
        self.add_listener(&destination, options, HandlerKind::Slot, handler).await
    }

    /// Registers a handler on a raw topic or wildcard pattern.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::InvalidTopic`] for an empty or multi-wildcard topic
    /// - [`RegistrationError::MissingExclusiveGroup`] / [`RegistrationError::DuplicateExclusiveHandler`]
    /// - [`RegistrationError::Transport`] if the transport refused the subscription
    /// - [`RegistrationError::BackendStopped`] after [`stop`](Self::stop)
    pub async fn add_listener(
        &self,
        topic: &str,
        options: SubscriptionOptions,
        kind: HandlerKind,
        handler: impl Handler,
    ) -> Result<SubscriptionId, RegistrationError> {
        let subscription = NewSubscription {
            topic: topic.to_string(),
            kind,
            handler: Arc::new(handler),
            exclusive: options.exclusive,
            exclusive_group: options.exclusive_group,
            execution_timeout: options
                .timeout
                .unwrap_or(self.inner.config.default_execution_timeout),
            isolate: options.isolate,
        };
        if !self.inner.lifecycle.is_accepting() {
            return Err(RegistrationError::BackendStopped);
        }
        let (ack, rx) = oneshot::channel();
        self.send_command(RegistryCommand::Add { subscription, ack })
            .await
            .map_err(|()| RegistrationError::BackendStopped)?;
        rx.await.map_err(|_| RegistrationError::BackendStopped)?
    }

    /// Removes one handler (`Some(id)`) or all handlers on a raw topic.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::BackendStopped`] if the dispatch task is gone.
    pub async fn remove_listener(&self, topic: &str, id: Option<SubscriptionId>) -> Result<(), RegistrationError> {
        let (ack, rx) = oneshot::channel();
        self.send_command(RegistryCommand::Remove {
            topic: topic.to_string(),
            id,
            ack,
        })
        .await
        .map_err(|()| RegistrationError::BackendStopped)?;
        rx.await.map_err(|_| RegistrationError::BackendStopped)
    }

    /// [`remove_listener`](Self::remove_listener) on `<ns>.request.<topic>`.
    ///
    /// # Errors
    ///
    /// As for `remove_listener`.
    pub async fn remove_reply(&self, topic: &str, id: Option<SubscriptionId>) -> Result<(), RegistrationError> {
        self.remove_listener(&self.inner.topics.request(topic), id).await
    }

    /// [`remove_listener`](Self::remove_listener) on `<ns>.slot.<topic>`.
    ///
    /// # Errors
    ///
    /// As for `remove_listener`.
    pub async fn remove_slot(&self, topic: &str, id: Option<SubscriptionId>) -> Result<(), RegistrationError> {
        self.remove_listener(&self.inner.topics.slot(topic), id).await
    }

    /// Topics with at least one handler, sorted. Empty once stopped.
    pub async fn active_topics(&self) -> Vec<String> {
        let (ack, rx) = oneshot::channel();
        if self.send_command(RegistryCommand::Topics { ack }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn send_command(&self, command: RegistryCommand) -> Result<(), ()> {
        self.inner.commands.send(command).await.map_err(|_| ())
    }

    // -- pipelines ----------------------------------------------------------

    /// Sequential pipe: each step's output feeds the next.
    #[must_use]
    pub fn compose(&self, steps: Vec<Step>) -> Pipeline {
        Pipeline::new(self.clone(), Combinator::Compose, steps)
    }

    /// Short-circuit chain: steps run on fresh input until one fails.
    #[must_use]
    pub fn andand(&self, steps: Vec<Step>) -> Pipeline {
        Pipeline::new(self.clone(), Combinator::AndAnd, steps)
    }

    /// Best-effort batch; with `record`, every step's result is returned.
    #[must_use]
    pub fn batch(&self, steps: Vec<Step>, record: bool) -> Pipeline {
        Pipeline::new(self.clone(), Combinator::Batch { record }, steps)
    }

    /// Concurrent fan-out over the same input.
    #[must_use]
    pub fn parallel(&self, steps: Vec<Step>) -> Pipeline {
        Pipeline::new(self.clone(), Combinator::Parallel, steps)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Stops dispatching, drops every subscription, waits for in-flight
    /// handlers up to `drain_timeout`, then closes the transport.
    ///
    /// Idempotent. Calling it from inside a handler waits out the full drain
    /// timeout, since that handler is itself in flight.
    ///
    /// # Errors
    ///
    /// Transport close failures.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let lifecycle = &self.inner.lifecycle;
        if !lifecycle.begin_drain() {
            return Ok(());
        }
        info!(in_flight = lifecycle.in_flight_count(), "backend draining");

        if !lifecycle.wait_for_drain(self.inner.config.drain_timeout).await {
            warn!(
                in_flight = lifecycle.in_flight_count(),
                "drain timeout elapsed with handlers still running"
            );
        }

        let (ack, done) = oneshot::channel();
        if self.send_command(RegistryCommand::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
        let task = self.inner.dispatch_task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!(error = %err, "dispatch task failed");
            }
        }

        self.inner.transport.close().await?;
        lifecycle.set_stopped();
        info!("backend stopped");
        Ok(())
    }

    // -- routing ------------------------------------------------------------

    fn route(&self, registry: &SubscriptionRegistry, delivery: Delivery, draining: bool) {
        if let Some(sender) = self.inner.topics.response_sender(&delivery.subscription) {
            let response = parse_response(&delivery.payload);
            self.inner.correlator.resolve(
                &CallerId::from(sender),
                response.data,
                response.code.unwrap_or(OK),
            );
            return;
        }

        if draining {
            debug!(topic = %delivery.topic, "backend draining; delivery dropped");
            return;
        }

        let subscriptions = registry.get(&delivery.subscription);
        if subscriptions.is_empty() {
            debug!(topic = %delivery.topic, subscription = %delivery.subscription, "no handler for delivery");
            return;
        }

        let request = parse_request(&delivery.payload);
        for subscription in subscriptions {
            let call = Call {
                topic: delivery.topic.clone(),
                body: request.data.clone(),
                sender: request.sender.clone(),
                kind: subscription.kind,
            };
            let guard = self.inner.lifecycle.in_flight_guard();
            let backend = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                backend.invoke(subscription, call).await;
            });
        }
    }

    async fn invoke(&self, subscription: Arc<Subscription>, call: Call) {
        if let Some(group) = &subscription.exclusive_group {
            let Some(sender) = call.sender.as_deref() else {
                warn!(topic = %call.topic, %group, "exclusive delivery without a sender; skipped");
                return;
            };
            if !self.inner.exclusivity.try_acquire(sender, group).await {
                return;
            }
        }

        metrics::counter!("switchboard_handler_executions_total", "kind" => subscription.kind.as_str())
            .increment(1);
        debug!(topic = %call.topic, sender = ?call.sender, kind = subscription.kind.as_str(), "executing handler");

        if subscription.isolate {
            isolation::run_isolated(self, &subscription, call).await;
        } else {
            let responder = Responder::new(
                call,
                Outbox::Direct(self.clone()),
                self.inner.error_topic.clone(),
                false,
            );
            responder
                .execute(Arc::clone(&subscription.handler), subscription.execution_timeout)
                .await;
        }
    }

    pub(crate) fn error_topic(&self) -> Option<&str> {
        self.inner.error_topic.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Dispatch task
// ---------------------------------------------------------------------------

async fn dispatch_loop(
    backend: Weak<BackendInner>,
    transport: Arc<dyn Transport>,
    mut commands: mpsc::Receiver<RegistryCommand>,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut registry = SubscriptionRegistry::new();
    let mut draining = false;

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(RegistryCommand::Shutdown { ack }) => {
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => handle_command(&mut registry, transport.as_ref(), command, draining).await,
                    None => break,
                }
            }
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else {
                    warn!("transport delivery stream closed");
                    break;
                };
                let Some(inner) = backend.upgrade() else {
                    break;
                };
                Backend { inner }.route(&registry, delivery, draining);
            }
            _ = shutdown.changed(), if !draining => {
                draining = true;
                unsubscribe_all(&mut registry, transport.as_ref()).await;
            }
        }
    }

    unsubscribe_all(&mut registry, transport.as_ref()).await;
    debug!("dispatch loop stopped");
}

async fn handle_command(
    registry: &mut SubscriptionRegistry,
    transport: &dyn Transport,
    command: RegistryCommand,
    draining: bool,
) {
    match command {
        RegistryCommand::Add { subscription, ack } => {
            let result = if draining {
                Err(RegistrationError::BackendStopped)
            } else {
                add_subscription(registry, transport, subscription).await
            };
            let _ = ack.send(result);
        }
        RegistryCommand::Remove { topic, id, ack } => {
            if registry.remove(&topic, id) {
                if let Err(err) = transport.unsubscribe(&topic).await {
                    warn!(%topic, error = %err, "transport unsubscribe failed");
                }
                debug!(%topic, "topic unsubscribed");
            }
            let _ = ack.send(());
        }
        RegistryCommand::Topics { ack } => {
            let _ = ack.send(registry.topics());
        }
        RegistryCommand::Shutdown { ack } => {
            let _ = ack.send(());
        }
    }
}

async fn add_subscription(
    registry: &mut SubscriptionRegistry,
    transport: &dyn Transport,
    subscription: NewSubscription,
) -> Result<SubscriptionId, RegistrationError> {
    let added = registry.add(subscription)?;
    let subscription = added.subscription;

    if added.first_on_topic {
        if let Err(source) = transport.subscribe(&subscription.topic).await {
            registry.remove(&subscription.topic, Some(subscription.id));
            return Err(RegistrationError::Transport {
                topic: subscription.topic.clone(),
                source,
            });
        }
    }

    debug!(
        topic = %subscription.topic,
        id = subscription.id.0,
        kind = subscription.kind.as_str(),
        group = ?subscription.exclusive_group,
        isolate = subscription.isolate,
        "subscription added"
    );
    Ok(subscription.id)
}

async fn unsubscribe_all(registry: &mut SubscriptionRegistry, transport: &dyn Transport) {
    for topic in registry.drain() {
        if let Err(err) = transport.unsubscribe(&topic).await {
            warn!(%topic, error = %err, "transport unsubscribe failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
