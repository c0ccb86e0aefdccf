//! The two dispatch loops: normal message-driven pushes and periodic silent
//! wake-ups.
//!
//! Both loops implement [`PushLoop`] and run under [`run_loop`], which owns
//! the wait/cycle cadence and reacts to the shutdown channel at every wait
//! point, so a stop request never has to ride out a full sleep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::watch;

use crate::fetch::MessageSource;
use crate::gwlog;
use crate::logging::{session_tag, token_tag};
use crate::push::{
    is_ios_device_token, AndroidMessage, ApnsBackend, ApnsPriority, FailureTracker, FcmBackend,
    IosNotification, PushOutcome, PushSendError,
};
use crate::storage::Store;

/// Wall-clock budget for one normal dispatch cycle.
pub const CYCLE_BUDGET: Duration = Duration::from_secs(60);

/// Messages expiring sooner than this (23.9 h) are too old to push: the
/// default storage TTL is 24 h, so anything below the floor has already
/// been waiting longer than one dispatch cycle.
pub const EXPIRY_FLOOR_MS: u64 = 86_040_000;

/// Delivery attempts per batch before giving up on a connection failure.
pub const SEND_ATTEMPTS: u32 = 3;

const SILENT_WAIT_MIN_SECS: u64 = 60;
const SILENT_WAIT_MAX_SECS: u64 = 180;

/// One repeating dispatch activity driven by [`run_loop`].
pub trait PushLoop: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Wait before the first cycle.
    fn initial_wait(&self) -> Duration {
        Duration::ZERO
    }

    /// Run one cycle and return the wait before the next.
    fn dispatch_cycle(&self) -> impl std::future::Future<Output = Duration> + Send;
}

/// Drive a [`PushLoop`] until the shutdown channel flips to `true`.
///
/// Waits race against the shutdown signal, so the loop stops promptly even
/// mid-sleep. Cycles themselves always run to completion.
pub async fn run_loop<L: PushLoop>(driver: Arc<L>, mut shutdown: watch::Receiver<bool>) {
    let mut wait = driver.initial_wait();
    gwlog!("{}: loop started", driver.name());
    loop {
        if !wait.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }
        if *shutdown.borrow() {
            break;
        }
        wait = driver.dispatch_cycle().await;
    }
    gwlog!("{}: loop stopped", driver.name());
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Whether a message is fresh enough to push: its remaining lifetime must
/// still be at least the expiry floor.
pub(crate) fn within_push_window(expiration: u64, now_ms: u64) -> bool {
    expiration.saturating_sub(now_ms) >= EXPIRY_FLOOR_MS
}

async fn send_apns_with_retry(
    apns: Arc<dyn ApnsBackend>,
    batch: Vec<IosNotification>,
    priority: ApnsPriority,
) -> Result<HashMap<String, PushOutcome>, PushSendError> {
    let mut attempt = 1;
    loop {
        let apns = Arc::clone(&apns);
        let batch_clone = batch.clone();
        let result =
            tokio::task::spawn_blocking(move || apns.send_batch(&batch_clone, priority)).await;
        let result = match result {
            Ok(inner) => inner,
            Err(join_error) => Err(PushSendError::Connection(join_error.to_string())),
        };
        match result {
            Err(PushSendError::Connection(reason)) if attempt < SEND_ATTEMPTS => {
                gwlog!("apns: attempt {attempt} failed ({reason}), retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn send_fcm_with_retry(
    fcm: Arc<dyn FcmBackend>,
    batch: Vec<AndroidMessage>,
) -> Result<Vec<PushOutcome>, PushSendError> {
    let mut attempt = 1;
    loop {
        let fcm = Arc::clone(&fcm);
        let batch_clone = batch.clone();
        let result = tokio::task::spawn_blocking(move || fcm.send_batch(&batch_clone)).await;
        let result = match result {
            Ok(inner) => inner,
            Err(join_error) => Err(PushSendError::Connection(join_error.to_string())),
        };
        match result {
            Err(PushSendError::Connection(reason)) if attempt < SEND_ATTEMPTS => {
                gwlog!("fcm: attempt {attempt} failed ({reason}), retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Message-driven dispatcher: fetches from the swarm for every registered
/// identity, advances cursors, and pushes fresh messages to device tokens.
pub struct NormalDispatcher {
    store: Store,
    fetcher: Arc<dyn MessageSource>,
    apns: Arc<dyn ApnsBackend>,
    fcm: Arc<dyn FcmBackend>,
    fails: Mutex<FailureTracker>,
}

impl NormalDispatcher {
    pub fn new(
        store: Store,
        fetcher: Arc<dyn MessageSource>,
        apns: Arc<dyn ApnsBackend>,
        fcm: Arc<dyn FcmBackend>,
    ) -> Self {
        Self {
            store,
            fetcher,
            apns,
            fcm,
            fails: Mutex::new(FailureTracker::new()),
        }
    }

    /// Associate a device token with a session identity.
    pub fn register_token(&self, session_id: &str, token: &str) {
        if let Err(error) = self.store.insert_token(session_id, token) {
            gwlog!(
                "dispatch: failed to register {} for {}: {error}",
                token_tag(token),
                session_tag(session_id)
            );
            return;
        }
        self.fails.lock().unwrap().prime(token);
        gwlog!(
            "dispatch: registered {} for {}",
            token_tag(token),
            session_tag(session_id)
        );
    }

    /// Forget a token entirely.
    pub fn disable_token(&self, token: &str) {
        if let Err(error) = self.store.remove_token(token) {
            gwlog!("dispatch: failed to remove {}: {error}", token_tag(token));
            return;
        }
        self.fails.lock().unwrap().forget(token);
    }

    /// Client-confirmed delivery: advance the identity's cursor.  Unknown
    /// identities are ignored.
    pub fn acknowledge(&self, session_id: &str, last_hash: &str, expiration: u64) {
        match self
            .store
            .update_last_hash_if_newer(session_id, last_hash, expiration)
        {
            Ok(true) => gwlog!(
                "dispatch: acknowledged up to expiration {expiration} for {}",
                session_tag(session_id)
            ),
            Ok(false) => {}
            Err(error) => gwlog!(
                "dispatch: acknowledge failed for {}: {error}",
                session_tag(session_id)
            ),
        }
    }

    fn evict_token(&self, token: &str) {
        gwlog!(
            "dispatch: evicting {} after repeated failures",
            token_tag(token)
        );
        self.disable_token(token);
    }

    fn handle_apns_result(&self, result: Result<HashMap<String, PushOutcome>, PushSendError>) {
        match result {
            Ok(outcomes) => {
                let mut evicted = Vec::new();
                {
                    let mut fails = self.fails.lock().unwrap();
                    for (token, outcome) in &outcomes {
                        match outcome {
                            PushOutcome::Success => fails.record_success(token),
                            PushOutcome::Failure(reason) => {
                                gwlog!(
                                    "dispatch: apns failure for {}: {reason}",
                                    token_tag(token)
                                );
                                if fails.record_failure(token) {
                                    evicted.push(token.clone());
                                }
                            }
                        }
                    }
                }
                for token in evicted {
                    self.evict_token(&token);
                }
            }
            Err(error) => gwlog!("dispatch: apns batch failed: {error}"),
        }
    }

    fn handle_fcm_result(
        &self,
        batch: &[AndroidMessage],
        result: Result<Vec<PushOutcome>, PushSendError>,
    ) {
        match result {
            Ok(outcomes) => {
                let mut evicted = Vec::new();
                {
                    let mut fails = self.fails.lock().unwrap();
                    for (message, outcome) in batch.iter().zip(outcomes.iter()) {
                        match outcome {
                            PushOutcome::Success => fails.record_success(&message.device_token),
                            PushOutcome::Failure(reason) => {
                                gwlog!(
                                    "dispatch: fcm failure for {}: {reason}",
                                    token_tag(&message.device_token)
                                );
                                if fails.record_failure(&message.device_token) {
                                    evicted.push(message.device_token.clone());
                                }
                            }
                        }
                    }
                }
                for token in evicted {
                    self.evict_token(&token);
                }
            }
            Err(error) => gwlog!("dispatch: fcm batch failed: {error}"),
        }
    }

    /// Fetch, advance cursors, and push. Public so integration tests can run
    /// a single cycle without the loop driver.
    pub async fn run_cycle(&self) -> Duration {
        let started = Instant::now();

        let session_ids = match self.store.session_ids_with_tokens() {
            Ok(ids) => ids,
            Err(error) => {
                gwlog!("dispatch: failed to list identities: {error}");
                return CYCLE_BUDGET;
            }
        };

        let mut ios_batch = Vec::new();
        let mut android_batch = Vec::new();
        if !session_ids.is_empty() {
            let fetched = self.fetcher.fetch_messages(session_ids).await;
            let now = now_ms();
            for (session_id, messages) in fetched {
                let tokens = match self.store.tokens_for(&session_id) {
                    Ok(tokens) => tokens,
                    Err(error) => {
                        gwlog!(
                            "dispatch: failed to load tokens for {}: {error}",
                            session_tag(&session_id)
                        );
                        Vec::new()
                    }
                };
                let mut pushed = 0usize;
                for message in &messages {
                    // The cursor advances for every observed message, pushed
                    // or not, so stale messages are never re-fetched.
                    if let Err(error) = self.store.update_last_hash_if_newer(
                        &session_id,
                        &message.hash,
                        message.expiration,
                    ) {
                        gwlog!(
                            "dispatch: cursor update failed for {}: {error}",
                            session_tag(&session_id)
                        );
                    }
                    if !within_push_window(message.expiration, now) {
                        continue;
                    }
                    pushed += 1;
                    for token in &tokens {
                        if is_ios_device_token(token) {
                            ios_batch.push(IosNotification::visible(token, &message.data));
                        } else {
                            android_batch.push(AndroidMessage::new(token, &message.data));
                        }
                    }
                }
                if pushed > 0 {
                    gwlog!(
                        "dispatch: {pushed} fresh message(s) for {}",
                        session_tag(&session_id)
                    );
                }
            }
        }

        if !ios_batch.is_empty() {
            let result = send_apns_with_retry(
                Arc::clone(&self.apns),
                ios_batch,
                ApnsPriority::Immediate,
            )
            .await;
            self.handle_apns_result(result);
        }
        if !android_batch.is_empty() {
            let result = send_fcm_with_retry(Arc::clone(&self.fcm), android_batch.clone()).await;
            self.handle_fcm_result(&android_batch, result);
        }

        let elapsed = started.elapsed();
        match CYCLE_BUDGET.checked_sub(elapsed) {
            Some(remaining) => remaining,
            None => {
                gwlog!(
                    "dispatch: cycle overran its budget ({:.1}s), starting next immediately",
                    elapsed.as_secs_f64()
                );
                Duration::ZERO
            }
        }
    }
}

impl PushLoop for NormalDispatcher {
    fn name(&self) -> &'static str {
        "normal-dispatch"
    }

    async fn dispatch_cycle(&self) -> Duration {
        self.run_cycle().await
    }
}

/// Periodic content-available pushes that wake registered apps so they can
/// poll in the background.  Tracks its own token list, iOS only.
pub struct SilentDispatcher {
    store: Store,
    apns: Arc<dyn ApnsBackend>,
    fails: Mutex<FailureTracker>,
}

impl SilentDispatcher {
    pub fn new(store: Store, apns: Arc<dyn ApnsBackend>) -> Self {
        Self {
            store,
            apns,
            fails: Mutex::new(FailureTracker::new()),
        }
    }

    pub fn register_token(&self, token: &str) {
        if !is_ios_device_token(token) {
            gwlog!(
                "silent: ignoring non-apns token {}",
                token_tag(token)
            );
            return;
        }
        if let Err(error) = self.store.insert_silent_token(token) {
            gwlog!("silent: failed to register {}: {error}", token_tag(token));
            return;
        }
        self.fails.lock().unwrap().prime(token);
        gwlog!("silent: registered {}", token_tag(token));
    }

    pub fn disable_token(&self, token: &str) {
        if let Err(error) = self.store.remove_silent_token(token) {
            gwlog!("silent: failed to remove {}: {error}", token_tag(token));
            return;
        }
        self.fails.lock().unwrap().forget(token);
    }

    fn random_wait() -> Duration {
        let secs = rand::thread_rng().gen_range(SILENT_WAIT_MIN_SECS..=SILENT_WAIT_MAX_SECS);
        Duration::from_secs(secs)
    }

    /// Send one round of silent wake-ups. Public for integration tests.
    pub async fn run_cycle(&self) -> Duration {
        let tokens = match self.store.silent_tokens() {
            Ok(tokens) => tokens,
            Err(error) => {
                gwlog!("silent: failed to list tokens: {error}");
                return Self::random_wait();
            }
        };
        if tokens.is_empty() {
            return Self::random_wait();
        }

        let batch: Vec<IosNotification> = tokens
            .iter()
            .map(|token| IosNotification::silent(token))
            .collect();
        let result =
            send_apns_with_retry(Arc::clone(&self.apns), batch, ApnsPriority::Delayed).await;
        match result {
            Ok(outcomes) => {
                let mut evicted = Vec::new();
                {
                    let mut fails = self.fails.lock().unwrap();
                    for (token, outcome) in &outcomes {
                        match outcome {
                            PushOutcome::Success => fails.record_success(token),
                            PushOutcome::Failure(reason) => {
                                gwlog!("silent: failure for {}: {reason}", token_tag(token));
                                if fails.record_failure(token) {
                                    evicted.push(token.clone());
                                }
                            }
                        }
                    }
                }
                for token in evicted {
                    gwlog!("silent: evicting {} after repeated failures", token_tag(&token));
                    self.disable_token(&token);
                }
            }
            Err(error) => gwlog!("silent: batch failed: {error}"),
        }

        Self::random_wait()
    }
}

impl PushLoop for SilentDispatcher {
    fn name(&self) -> &'static str {
        "silent-dispatch"
    }

    fn initial_wait(&self) -> Duration {
        Self::random_wait()
    }

    async fn dispatch_cycle(&self) -> Duration {
        self.run_cycle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_window_floor_is_inclusive() {
        let now = 1_700_000_000_000u64;
        // Exactly at the floor: still pushable.
        assert!(within_push_window(now + EXPIRY_FLOOR_MS, now));
        // One tick under: too old.
        assert!(!within_push_window(now + EXPIRY_FLOOR_MS - 1, now));
        // Full 24 h ahead: pushable.
        assert!(within_push_window(now + 86_400_000, now));
        // Already expired.
        assert!(!within_push_window(now - 1000, now));
    }

    #[test]
    fn silent_wait_stays_in_range() {
        for _ in 0..50 {
            let wait = SilentDispatcher::random_wait();
            assert!(wait >= Duration::from_secs(SILENT_WAIT_MIN_SECS));
            assert!(wait <= Duration::from_secs(SILENT_WAIT_MAX_SECS));
        }
    }
}
