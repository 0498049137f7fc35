use std::time::Duration;

use switchboard_core::TopicSpace;

/// Default sender-side wait budget for a request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Default execution budget for a handler.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Default namespace prefix for every topic.
pub const DEFAULT_NAMESPACE: &str = "switchboard";

/// Where error-class responses are broadcast, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ErrorBroadcast {
    #[default]
    Disabled,
    /// Publish on `<ns>.error`.
    DefaultChannel,
    /// Publish on the given topic verbatim.
    Topic(String),
}

/// Backend-level configuration consumed by [`Backend::connect`](super::Backend::connect).
///
/// `host`, `port` and `db` are carried for transport drivers; the runtime
/// itself never reads them.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Prefix for every topic produced or consumed.
    pub namespace: String,
    pub host: String,
    pub port: u16,
    pub db: u32,
    /// Sender-side timeout applied when a request gives none.
    pub default_timeout: Duration,
    /// Execution timeout applied when a subscription gives none.
    pub default_execution_timeout: Duration,
    /// Check for at least one subscriber before publishing a request.
    pub confirm_subscriber: bool,
    /// Register a reply handler on `<ns>.health.<ident>`.
    pub health_check: bool,
    pub broadcast_errors: ErrorBroadcast,
    /// TTL of exclusive-group locks. Expiry is the only release.
    pub lock_ttl: Duration,
    /// Capacity of the registry command channel.
    pub command_capacity: usize,
    /// Maximum time `stop()` waits for in-flight handlers.
    pub drain_timeout: Duration,
    /// Process identity used for the health topic.
    pub ident: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            default_timeout: DEFAULT_TIMEOUT,
            default_execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            confirm_subscriber: false,
            health_check: false,
            broadcast_errors: ErrorBroadcast::Disabled,
            lock_ttl: Duration::from_secs(600),
            command_capacity: 256,
            drain_timeout: Duration::from_secs(30),
            ident: default_ident(),
        }
    }
}

impl BackendConfig {
    #[must_use]
    pub fn topic_space(&self) -> TopicSpace {
        TopicSpace::new(self.namespace.clone())
    }

    /// Resolves the error broadcast topic, or `None` when disabled.
    #[must_use]
    pub fn error_topic(&self) -> Option<String> {
        match &self.broadcast_errors {
            ErrorBroadcast::Disabled => None,
            ErrorBroadcast::DefaultChannel => Some(self.topic_space().error()),
            ErrorBroadcast::Topic(topic) => Some(topic.clone()),
        }
    }
}

/// `<host>-pid-<pid>-uuid-<uuid>`, unique per process start.
#[must_use]
pub fn default_ident() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!(
        "{host}-pid-{}-uuid-{}",
        std::process::id(),
        uuid::Uuid::new_v4()
    )
}

/// Per-request options. Unset fields fall back to the backend config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub confirm_subscriber: Option<bool>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_confirm_subscriber(mut self, confirm: bool) -> Self {
        self.confirm_subscriber = Some(confirm);
        self
    }
}

/// Per-subscription options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Execution timeout; the backend default applies when unset.
    pub timeout: Option<Duration>,
    /// Competing-consumer group name.
    pub exclusive_group: Option<String>,
    /// Request exclusivity for a slot. Reply handlers are always exclusive.
    pub exclusive: bool,
    /// Run the handler in an isolated worker.
    pub isolate: bool,
}

impl SubscriptionOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.exclusive_group = Some(group.into());
        self
    }

    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    #[must_use]
    pub fn isolated(mut self) -> Self {
        self.isolate = true;
        self
    }
}
