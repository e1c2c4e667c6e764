//! Notification boundary — fire-and-forget dispatch.
//!
//! Delivery is an external concern; the engine only names the events. Every
//! method is infallible from the engine's point of view: a notifier that
//! fails to deliver logs the failure itself and never fails the calling
//! operation.

use async_trait::async_trait;
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Ask the recipient to log on and unlock a fully funded project.
    async fn recipient_unlock_request(&self, project_index: u64, email: &str);
    /// Tell operators a funded project's recipient record is missing.
    async fn recipient_not_found(&self, project_index: u64, recipient_index: u64);

    // ── Escalation ladder, mild to severe ────────────────
    async fn gentle_payback_reminder(&self, project_index: u64, email: &str);
    async fn stern_payback_reminder(&self, project_index: u64, email: &str);
    async fn stern_payback_reminder_investor(&self, project_index: u64, email: &str);
    async fn stern_payback_reminder_guarantor(&self, project_index: u64, email: &str);
    async fn disconnection_notice_investor(&self, project_index: u64, email: &str);
    async fn disconnection_notice_guarantor(&self, project_index: u64, email: &str);

    /// Observability sink for background-task conditions that would
    /// otherwise die silently (unlock timeout, pipeline failure, monitor
    /// exit).
    async fn operator_alert(&self, project_index: u64, message: &str);
}

/// Notifier that writes every event to the log. Stands in until the email
/// dispatcher is wired up, and is what `engined` runs with.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn recipient_unlock_request(&self, project_index: u64, email: &str) {
        info!(project = project_index, email, "notify: project funded, requesting unlock");
    }

    async fn recipient_not_found(&self, project_index: u64, recipient_index: u64) {
        warn!(
            project = project_index,
            recipient = recipient_index,
            "notify: recipient record missing for funded project"
        );
    }

    async fn gentle_payback_reminder(&self, project_index: u64, email: &str) {
        info!(project = project_index, email, "notify: gentle payback reminder");
    }

    async fn stern_payback_reminder(&self, project_index: u64, email: &str) {
        warn!(project = project_index, email, "notify: stern payback reminder");
    }

    async fn stern_payback_reminder_investor(&self, project_index: u64, email: &str) {
        warn!(project = project_index, email, "notify: stern payback reminder (investor)");
    }

    async fn stern_payback_reminder_guarantor(&self, project_index: u64, email: &str) {
        warn!(project = project_index, email, "notify: stern payback reminder (guarantor)");
    }

    async fn disconnection_notice_investor(&self, project_index: u64, email: &str) {
        warn!(project = project_index, email, "notify: disconnection notice (investor)");
    }

    async fn disconnection_notice_guarantor(&self, project_index: u64, email: &str) {
        warn!(project = project_index, email, "notify: disconnection notice (guarantor)");
    }

    async fn operator_alert(&self, project_index: u64, message: &str) {
        warn!(project = project_index, message, "operator alert");
    }
}
