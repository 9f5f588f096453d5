use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A request to notify one or more users via whatever transport the
/// deployment wires up. The production SMTP transport is out of scope;
/// this is the contract the lifecycle engine produces and a dispatcher
/// consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub template: String,
    pub recipients: Vec<Uuid>,
    pub context: serde_json::Value,
}

impl NotificationRequest {
    pub fn new(template: impl Into<String>, recipients: Vec<Uuid>, context: serde_json::Value) -> Self {
        Self {
            template: template.into(),
            recipients,
            context,
        }
    }
}

/// Boundary the engine dispatches notifications through. Production
/// transports (SMTP, push, in-app) implement this outside the crate; the
/// crate ships only a logging implementation for local/dev use and tests.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, request: NotificationRequest);
}

/// Fire-and-forget dispatcher that logs the request via `tracing`. Errors
/// in downstream transports are the caller's concern; this implementation
/// cannot fail.
pub struct LoggingNotificationDispatcher;

impl NotificationDispatcher for LoggingNotificationDispatcher {
    fn dispatch(&self, request: NotificationRequest) {
        tracing::info!(
            template = %request.template,
            recipients = ?request.recipients,
            context = %request.context,
            "notification dispatched"
        );
    }
}

/// Spawn a fire-and-forget dispatch on the async runtime so the caller
/// (typically inside a DB transaction) never blocks on notification
/// delivery and a failure there never rolls back the engine operation.
pub fn dispatch_async(dispatcher: std::sync::Arc<dyn NotificationDispatcher>, request: NotificationRequest) {
    tokio::spawn(async move {
        dispatcher.dispatch(request);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_dispatcher_does_not_panic() {
        let dispatcher = LoggingNotificationDispatcher;
        let request = NotificationRequest::new(
            "task_assigned",
            vec![Uuid::new_v4()],
            serde_json::json!({ "document_number": "SOP-2026-0001" }),
        );
        dispatcher.dispatch(request);
    }

    #[tokio::test]
    async fn test_dispatch_async_runs() {
        let dispatcher: std::sync::Arc<dyn NotificationDispatcher> =
            std::sync::Arc::new(LoggingNotificationDispatcher);
        let request = NotificationRequest::new("task_assigned", vec![Uuid::new_v4()], serde_json::json!({}));
        dispatch_async(dispatcher, request);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
