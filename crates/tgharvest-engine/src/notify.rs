use async_trait::async_trait;

/// Best-effort out-of-band operator messages (quarantine events).
///
/// Implementations must swallow every delivery failure; a broken notifier
/// can never fail a tick.
#[async_trait]
pub trait Notify: Send + Sync {
    /// Message to the single configured operator.
    async fn notify_operator(&self, text: &str);

    /// Broadcast to all opted-in staff recipients.
    async fn notify_staff(&self, text: &str);
}

/// Notifier used when no bot token is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notify for NoopNotifier {
    async fn notify_operator(&self, _text: &str) {}
    async fn notify_staff(&self, _text: &str) {}
}
