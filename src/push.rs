//! Notification payloads, delivery backend traits, and failure accounting.
//!
//! The gateway itself never talks to APNs or FCM directly; delivery goes
//! through the [`ApnsBackend`] and [`FcmBackend`] traits so the binary can
//! wire in real providers, and tests (and an unconfigured deployment) use
//! the log-only stand-ins.

use std::collections::HashMap;

use serde::Serialize;

use crate::gwlog;
use crate::logging::token_tag;

/// Alert text shown on locked devices; message content stays encrypted.
pub const NOTIFICATION_BODY: &str = "You've got a new message";
pub const NOTIFICATION_TITLE: &str = "Message";

/// Category identifying notifications the app's service extension handles.
pub const IOS_CATEGORY: &str = "SECRET";

/// Consecutive failures beyond this count evict a token.
pub const FAILURE_THRESHOLD: u32 = 5;

/// APNs delivery priority for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApnsPriority {
    /// Deliver immediately (priority 10); wakes the device.
    Immediate,
    /// Power-considerate delivery (priority 5); used for silent pushes.
    Delayed,
}

/// Result of attempting delivery to one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Success,
    Failure(String),
}

#[derive(Debug)]
pub enum PushSendError {
    /// Transport-level failure before any outcome was produced; the whole
    /// batch may be retried.
    Connection(String),
    /// The backend rejected the batch outright.
    Backend(String),
}

impl std::fmt::Display for PushSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushSendError::Connection(e) => write!(f, "push connection error: {e}"),
            PushSendError::Backend(e) => write!(f, "push backend error: {e}"),
        }
    }
}

impl std::error::Error for PushSendError {}

/// One APNs notification, either visible or silent (content-available).
#[derive(Debug, Clone, Serialize)]
pub struct IosNotification {
    pub device_token: String,
    pub alert_body: Option<String>,
    pub alert_title: Option<String>,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    pub category: Option<String>,
    pub content_available: bool,
    pub mutable_content: bool,
    /// Opaque message ciphertext, forwarded for the app's extension to
    /// decrypt locally.
    pub encrypted_data: Option<String>,
}

impl IosNotification {
    /// Visible notification carrying the encrypted envelope.
    pub fn visible(device_token: &str, encrypted_data: &str) -> Self {
        Self {
            device_token: device_token.to_string(),
            alert_body: Some(NOTIFICATION_BODY.to_string()),
            alert_title: Some(NOTIFICATION_TITLE.to_string()),
            badge: Some(1),
            sound: Some("default".to_string()),
            category: Some(IOS_CATEGORY.to_string()),
            content_available: false,
            mutable_content: true,
            encrypted_data: Some(encrypted_data.to_string()),
        }
    }

    /// Background wake-up with no user-visible content.
    pub fn silent(device_token: &str) -> Self {
        Self {
            device_token: device_token.to_string(),
            alert_body: None,
            alert_title: None,
            badge: None,
            sound: None,
            category: None,
            content_available: true,
            mutable_content: false,
            encrypted_data: None,
        }
    }
}

/// Data-only FCM message; the client renders its own notification.
#[derive(Debug, Clone, Serialize)]
pub struct AndroidMessage {
    pub device_token: String,
    pub encrypted_data: String,
}

impl AndroidMessage {
    pub fn new(device_token: &str, encrypted_data: &str) -> Self {
        Self {
            device_token: device_token.to_string(),
            encrypted_data: encrypted_data.to_string(),
        }
    }
}

/// APNs delivery. Outcomes are keyed by device token.
pub trait ApnsBackend: Send + Sync {
    fn send_batch(
        &self,
        notifications: &[IosNotification],
        priority: ApnsPriority,
    ) -> Result<HashMap<String, PushOutcome>, PushSendError>;
}

/// FCM delivery. Outcomes align with the input slice by index.
pub trait FcmBackend: Send + Sync {
    fn send_batch(&self, messages: &[AndroidMessage]) -> Result<Vec<PushOutcome>, PushSendError>;
}

/// APNs device tokens are 32 bytes rendered as hex.
pub fn is_ios_device_token(token: &str) -> bool {
    token.len() == 64 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Consecutive-failure counter for registered tokens.
///
/// A success resets a token's count; a token is evicted when its count
/// exceeds [`FAILURE_THRESHOLD`], i.e. on the sixth consecutive failure.
pub struct FailureTracker {
    fails: HashMap<String, u32>,
    threshold: u32,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::with_threshold(FAILURE_THRESHOLD)
    }

    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            fails: HashMap::new(),
            threshold,
        }
    }

    /// Start tracking a token at zero failures.
    pub fn prime(&mut self, token: &str) {
        self.fails.entry(token.to_string()).or_insert(0);
    }

    pub fn record_success(&mut self, token: &str) {
        self.fails.insert(token.to_string(), 0);
    }

    /// Count one failure; returns `true` when the token should be evicted.
    pub fn record_failure(&mut self, token: &str) -> bool {
        let count = self.fails.entry(token.to_string()).or_insert(0);
        *count += 1;
        if *count > self.threshold {
            self.fails.remove(token);
            true
        } else {
            false
        }
    }

    /// Stop tracking a token, e.g. after explicit deregistration.
    pub fn forget(&mut self, token: &str) {
        self.fails.remove(token);
    }
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Log-only APNs stand-in used until a real provider is configured.
pub struct LoggingApns;

impl ApnsBackend for LoggingApns {
    fn send_batch(
        &self,
        notifications: &[IosNotification],
        priority: ApnsPriority,
    ) -> Result<HashMap<String, PushOutcome>, PushSendError> {
        let mut outcomes = HashMap::new();
        for n in notifications {
            gwlog!(
                "apns[{priority:?}]: would deliver to {} (silent={})",
                token_tag(&n.device_token),
                n.content_available
            );
            outcomes.insert(n.device_token.clone(), PushOutcome::Success);
        }
        Ok(outcomes)
    }
}

/// Log-only FCM stand-in used until a real provider is configured.
pub struct LoggingFcm;

impl FcmBackend for LoggingFcm {
    fn send_batch(&self, messages: &[AndroidMessage]) -> Result<Vec<PushOutcome>, PushSendError> {
        for m in messages {
            gwlog!("fcm: would deliver to {}", token_tag(&m.device_token));
        }
        Ok(vec![PushOutcome::Success; messages.len()])
    }
}
