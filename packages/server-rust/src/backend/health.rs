//! Health-check responder on `<ns>.health.<ident>`.
//!
//! A monitor requests the topic and treats a reply within the execution
//! timeout as healthy. The reply lists the backend's active subscriptions.

use std::time::Duration;

use switchboard_core::Value;

use super::config::SubscriptionOptions;
use super::context::HandlerContext;
use super::dispatcher::Backend;
use super::error::RegistrationError;
use super::handler::{HandlerKind, SubscriptionId};

/// Execution timeout of the health handler.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Exclusive group of the health handler.
pub const HEALTH_GROUP: &str = "health";

/// Registers the health handler. Health checks always run in-process.
pub(crate) async fn register(backend: &Backend) -> Result<SubscriptionId, RegistrationError> {
    let topic = backend.topic_space().health(&backend.config().ident);
    let options = SubscriptionOptions::default()
        .with_timeout(HEALTH_TIMEOUT)
        .with_group(HEALTH_GROUP)
        .exclusive();

    backend
        .add_listener(&topic, options, HandlerKind::Reply, |ctx: HandlerContext| async move {
            let topics = match ctx.backend() {
                Some(backend) => backend.active_topics().await,
                None => Vec::new(),
            };
            ctx.respond(Value::from(topics), 200);
            Ok(())
        })
        .await
}
