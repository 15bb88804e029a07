//! Notification subsystem for merge outcomes.
//!
//! The orchestration code only sees [`NotificationSink`], a synchronous
//! fire-and-forget hook. In the daemon the sink is a [`NotificationQueue`]
//! whose receiving end is drained by [`run_dispatcher`], which hands each
//! event to the [`Notifier`] facade. The facade dispatches to every
//! configured channel (Slack webhook, SMTP email) and logs failures without
//! aborting.

pub mod email;
pub mod slack;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;
use crate::errors::NotificationError;
use crate::models::ChangeRequest;

/// Something worth telling people about a change request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeEvent {
    /// Merge job handed to the worker pool.
    MergeScheduled { actor: String },
    /// Merge parked until CI finishes.
    MergeDeferred { actor: String, sha: String },
    MergeCompleted { merge_commit_sha: String },
    MergeFailed { reason: String },
    MergeCancelled { reason: String },
    ConflictsResolved { commit_sha: String, actor: String },
    /// Closed by the stale-lock sweep.
    LockExpired,
}

impl MergeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MergeScheduled { .. } => "merge_scheduled",
            Self::MergeDeferred { .. } => "merge_deferred",
            Self::MergeCompleted { .. } => "merge_completed",
            Self::MergeFailed { .. } => "merge_failed",
            Self::MergeCancelled { .. } => "merge_cancelled",
            Self::ConflictsResolved { .. } => "conflicts_resolved",
            Self::LockExpired => "lock_expired",
        }
    }

    fn summary(&self) -> String {
        match self {
            Self::MergeScheduled { actor } => format!("merge started by {}", actor),
            Self::MergeDeferred { actor, sha } => format!(
                "{} set it to merge when CI succeeds for {}",
                actor,
                short_sha(sha)
            ),
            Self::MergeCompleted { merge_commit_sha } => {
                format!("merged as {}", short_sha(merge_commit_sha))
            }
            Self::MergeFailed { reason } => format!("merge failed: {}", reason),
            Self::MergeCancelled { reason } => format!("merge cancelled: {}", reason),
            Self::ConflictsResolved { commit_sha, actor } => format!(
                "{} resolved conflicts in {}",
                actor,
                short_sha(commit_sha)
            ),
            Self::LockExpired => "merge lock expired, change request closed".to_string(),
        }
    }
}

/// A [`MergeEvent`] together with the change request it concerns.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event: MergeEvent,
    pub change_request: ChangeRequest,
}

/// Fire-and-forget notification hook.
///
/// Implementations must not block and must never fail the caller.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: MergeEvent, change_request: &ChangeRequest);
}

/// Sink that forwards notifications onto a channel.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for NotificationQueue {
    fn notify(&self, event: MergeEvent, change_request: &ChangeRequest) {
        debug!(event = event.name(), change_request = %change_request.reference(), "queueing notification");
        let notification = Notification {
            event,
            change_request: change_request.clone(),
        };
        if self.tx.send(notification).is_err() {
            warn!("notification dispatcher has stopped, dropping notification");
        }
    }
}

/// Deliver queued notifications until every sender is gone.
pub async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<Notification>, notifier: Notifier) {
    info!(configured = notifier.is_configured(), "notification dispatcher started");
    while let Some(notification) = rx.recv().await {
        if let Err(e) = notifier.send(&notification).await {
            warn!(error = %e, event = notification.event.name(), "notification delivery failed");
        }
    }
    info!("notification dispatcher stopped");
}

/// Unified notifier that dispatches to all configured channels.
pub struct Notifier {
    slack: Option<slack::SlackNotifier>,
    email: Option<email::EmailNotifier>,
}

impl Notifier {
    /// Create a new notifier from the notification configuration.
    pub fn new(config: &NotificationConfig) -> Self {
        let slack = config.slack_webhook_url.as_ref().map(|url| {
            info!("Slack notifications enabled");
            slack::SlackNotifier::new(url.clone())
        });

        let email = match (&config.email_smtp, &config.email_from) {
            (Some(smtp), Some(from)) if !config.email_recipients.is_empty() => {
                info!("email notifications enabled");
                Some(email::EmailNotifier::new(
                    smtp.clone(),
                    from.clone(),
                    config.email_recipients.clone(),
                ))
            }
            _ => None,
        };

        Self { slack, email }
    }

    /// Send one notification to every configured channel.
    ///
    /// Fails only when every configured channel failed.
    pub async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        if !self.is_configured() {
            return Ok(());
        }
        info!(
            event = notification.event.name(),
            change_request = %notification.change_request.reference(),
            "sending notification"
        );

        let mut errors = Vec::new();

        if let Some(ref slack) = self.slack {
            let message = format_slack(notification);
            if let Err(e) = slack.send_message(&message).await {
                warn!(error = %e, "Slack notification failed");
                errors.push(format!("Slack: {}", e));
            }
        }

        if let Some(ref email) = self.email {
            let subject = format_email_subject(notification);
            let body = format_email_html(notification);
            if let Err(e) = email.send(&subject, &body).await {
                warn!(error = %e, "email notification failed");
                errors.push(format!("Email: {}", e));
            }
        }

        let total_channels = self.slack.is_some() as usize + self.email.is_some() as usize;
        if errors.len() >= total_channels {
            return Err(NotificationError::AllChannelsFailed(errors.join("; ")));
        }
        Ok(())
    }

    /// Return whether any notification channel is configured.
    pub fn is_configured(&self) -> bool {
        self.slack.is_some() || self.email.is_some()
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn emoji(event: &MergeEvent) -> &'static str {
    match event {
        MergeEvent::MergeCompleted { .. } | MergeEvent::ConflictsResolved { .. } => {
            ":white_check_mark:"
        }
        MergeEvent::MergeFailed { .. } | MergeEvent::LockExpired => ":x:",
        MergeEvent::MergeCancelled { .. } => ":warning:",
        MergeEvent::MergeScheduled { .. } | MergeEvent::MergeDeferred { .. } => {
            ":hourglass_flowing_sand:"
        }
    }
}

/// Format a notification for Slack (Markdown).
fn format_slack(n: &Notification) -> String {
    let cr = &n.change_request;
    format!(
        "{} *{}* {}\n`{}` into `{}`\n{}",
        emoji(&n.event),
        cr.reference(),
        cr.title,
        cr.source_branch,
        cr.target_branch,
        n.event.summary(),
    )
}

fn format_email_subject(n: &Notification) -> String {
    format!(
        "[mergeflow] {} {}: {}",
        n.change_request.reference(),
        n.event.name().replace('_', " "),
        n.change_request.title
    )
}

/// Format a notification as an HTML email.
fn format_email_html(n: &Notification) -> String {
    let cr = &n.change_request;
    let mut html = format!(
        "<html><body>\
        <h2>{}: {}</h2>\
        <table style=\"border-collapse: collapse;\">\
        <tr><td style=\"padding: 4px 12px; font-weight: bold;\">Source</td>\
            <td style=\"padding: 4px 12px;\"><code>{}</code></td></tr>\
        <tr><td style=\"padding: 4px 12px; font-weight: bold;\">Target</td>\
            <td style=\"padding: 4px 12px;\"><code>{}</code></td></tr>",
        html_escape(&cr.reference()),
        html_escape(&cr.title),
        html_escape(&cr.source_branch),
        html_escape(&cr.target_branch),
    );
    if let Some(ref sha) = cr.head_sha {
        html.push_str(&format!(
            "<tr><td style=\"padding: 4px 12px; font-weight: bold;\">Head</td>\
             <td style=\"padding: 4px 12px;\"><code>{}</code></td></tr>",
            html_escape(short_sha(sha))
        ));
    }
    html.push_str("</table>");
    html.push_str(&format!("<p>{}</p>", html_escape(&n.event.summary())));
    html.push_str("</body></html>");
    html
}

pub(crate) fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

/// Minimal HTML escaping for user-provided strings.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
