//! The delivery engine.
//!
//! One run walks every configured feed (plus any tracked-thread
//! pseudo-feeds): refresh the archive, enumerate new commits, extract
//! messages, durably queue them for every delivery of that feed, advance
//! the checkpoint, and only then attempt deliveries. Queue-then-deliver is
//! the crash-safety pivot: extraction is never repeated for recorded
//! commits, and anything unsent stays pending with enough information to be
//! re-loaded from the archive on the next run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{EngineSettings, FeedSettings, ImapAuthKind, Settings, TargetSettings};
use crate::domain::{
    Checkpoint, Delivery, DeliveryId, DeliveryTrace, FeedId, Message, MessageId, TargetId,
};
use crate::feeds::{extractor, EpochFeed, FeedSource, LeiFeed};
use crate::storage::TrackingStore;
use crate::targets::{
    ImapAuthConfig, ImapTarget, ImapTargetConfig, JsonMailConfig, JsonMailTarget, MaildirTarget,
    PipeTarget, RestInboxConfig, RestInboxTarget, Target, TargetError,
};

use super::{Blocklist, DeliveryStats, EngineError, EngineEvent, RunReport};

/// A tracked-thread pseudo-feed: one ad-hoc feed bound to one delivery,
/// processed exactly like a configured feed for a run.
pub struct ExtraFeed {
    /// The feed to poll.
    pub feed: Arc<dyn FeedSource>,
    /// Its single delivery.
    pub delivery: Delivery,
}

/// Shared handle to one target instance. The mutex serializes fan-in: two
/// deliveries into the same target never interleave messages.
type TargetHandle = Arc<Mutex<Box<dyn Target>>>;

/// Outcome of processing one feed.
struct FeedOutcome {
    feed: FeedId,
    stats: Vec<(DeliveryId, DeliveryStats)>,
    error: Option<String>,
    warnings: Vec<String>,
    failures: Vec<(DeliveryId, String)>,
}

/// The delivery engine.
pub struct DeliveryEngine {
    feeds: HashMap<FeedId, Arc<dyn FeedSource>>,
    targets: HashMap<TargetId, TargetHandle>,
    deliveries: Vec<Delivery>,
    store: Arc<TrackingStore>,
    blocklist: Blocklist,
    settings: EngineSettings,
    events: broadcast::Sender<EngineEvent>,
    limiter: Arc<Semaphore>,
    stop_flag: AtomicBool,
    http: reqwest::Client,
}

impl DeliveryEngine {
    /// Creates an empty engine over a store and blocklist.
    pub fn new(store: Arc<TrackingStore>, blocklist: Blocklist, settings: EngineSettings) -> Self {
        let (events, _) = broadcast::channel(128);
        let limiter = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        let http = reqwest::Client::builder()
            .user_agent(crate::feeds::git::user_agent())
            .build()
            .unwrap_or_default();
        Self {
            feeds: HashMap::new(),
            targets: HashMap::new(),
            deliveries: Vec::new(),
            store,
            blocklist,
            settings,
            events,
            limiter,
            stop_flag: AtomicBool::new(false),
            http,
        }
    }

    /// Builds a fully configured engine from settings.
    ///
    /// Feeds, targets and deliveries are constructed from their tagged
    /// settings; state lives under the resolved data directory.
    pub async fn from_settings(settings: &Settings) -> Result<Self, EngineError> {
        settings.validate()?;
        let data_dir = settings.resolve_data_dir()?;

        let store = Arc::new(TrackingStore::open(data_dir.join("state")).await?);
        let blocklist = crate::config::default_config_dir()
            .ok()
            .map(|dir| Blocklist::load(&dir.join("blocklist.txt")))
            .transpose()
            .map_err(crate::storage::StorageError::Io)?
            .unwrap_or_default();

        let mut engine = Self::new(store, blocklist, settings.engine.clone());

        for (name, feed) in &settings.feeds {
            let id = FeedId::from(name.as_str());
            let source: Arc<dyn FeedSource> = match feed {
                FeedSettings::Archive { url } => Arc::new(EpochFeed::new(
                    id.clone(),
                    url.clone(),
                    data_dir.join("feeds").join(name),
                )),
                FeedSettings::Lei { path } => Arc::new(LeiFeed::new(id.clone(), path.clone())),
            };
            engine.add_feed(source);
        }

        for (name, target) in &settings.targets {
            let built = build_target(name, target, &data_dir)?;
            engine.add_target(built);
        }

        for (name, delivery) in &settings.deliveries {
            engine.add_delivery(Delivery {
                id: DeliveryId::from(name.as_str()),
                feed: FeedId::from(delivery.feed.as_str()),
                target: TargetId::from(delivery.target.as_str()),
                labels: delivery.labels.clone(),
            });
        }

        Ok(engine)
    }

    /// Registers a feed source.
    pub fn add_feed(&mut self, feed: Arc<dyn FeedSource>) {
        self.feeds.insert(feed.id().clone(), feed);
    }

    /// Registers a target.
    pub fn add_target(&mut self, target: Box<dyn Target>) {
        self.targets
            .insert(target.id().clone(), Arc::new(Mutex::new(target)));
    }

    /// Registers a delivery.
    pub fn add_delivery(&mut self, delivery: Delivery) {
        self.deliveries.push(delivery);
    }

    /// Subscribes to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Requests cancellation: in-flight deliveries complete, no new ones
    /// start.
    pub fn request_cancel(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    fn cancelled(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    /// Runs one engine pass over all configured feeds and deliveries.
    pub async fn run_once(&self) -> RunReport {
        self.run_with(Vec::new()).await
    }

    /// Runs one pass over configured feeds plus tracked-thread pseudo-feeds.
    pub async fn run_with(&self, extra: Vec<ExtraFeed>) -> RunReport {
        self.stop_flag.store(false, Ordering::SeqCst);

        // Group configured deliveries by feed; feeds with no delivery are
        // still refreshed so their checkpoints stay warm.
        let mut groups: Vec<(Arc<dyn FeedSource>, Vec<Delivery>)> = Vec::new();
        for (feed_id, feed) in &self.feeds {
            let deliveries: Vec<Delivery> = self
                .deliveries
                .iter()
                .filter(|d| &d.feed == feed_id)
                .cloned()
                .collect();
            groups.push((Arc::clone(feed), deliveries));
        }
        for extra_feed in extra {
            groups.push((extra_feed.feed, vec![extra_feed.delivery]));
        }

        let outcomes =
            futures::future::join_all(groups.into_iter().map(|(feed, deliveries)| {
                self.process_feed(feed, deliveries)
            }))
            .await;

        let mut report = RunReport::default();
        for outcome in outcomes {
            if let Some(error) = outcome.error {
                report.feed_errors.push((outcome.feed.clone(), error));
            }
            report.warnings.extend(outcome.warnings);
            report.failures.extend(outcome.failures);
            for (delivery, stats) in outcome.stats {
                let entry = report.stats_mut(&delivery);
                entry.delivered += stats.delivered;
                entry.absorbed += stats.absorbed;
                entry.pending += stats.pending;
                entry.failed += stats.failed;
                entry.auth_required |= stats.auth_required;
            }
        }

        let _ = self.events.send(EngineEvent::Idle);
        info!(
            delivered = report.delivered_total(),
            pending = report.pending_total(),
            feed_errors = report.feed_errors.len(),
            "run complete"
        );
        report
    }

    /// Processes one feed: refresh → poll → extract → queue → deliver.
    async fn process_feed(
        &self,
        feed: Arc<dyn FeedSource>,
        deliveries: Vec<Delivery>,
    ) -> FeedOutcome {
        let feed_id = feed.id().clone();
        let mut outcome = FeedOutcome {
            feed: feed_id.clone(),
            stats: Vec::new(),
            error: None,
            warnings: Vec::new(),
            failures: Vec::new(),
        };

        let _ = self.events.send(EngineEvent::Syncing(feed_id.clone()));

        // A feed that cannot be refreshed is skipped for this run and
        // retried on the next; other feeds are unaffected.
        if let Err(e) = feed.refresh().await {
            warn!(feed = %feed_id, error = %e, "feed unavailable, skipping this run");
            outcome.error = Some(e.to_string());
            return outcome;
        }

        // Establish the polling position. Archives start at the tip so
        // subscribing does not replay history; backfilling feeds (tracked
        // threads) start from the beginning.
        let checkpoint = self.store.checkpoint(&feed_id).await;
        let since = match checkpoint {
            Some(cp) => Some(cp),
            None if feed.backfill_on_init() => None,
            None => match feed.tip().await {
                Ok(Some(tip)) => {
                    if let Err(e) = self.store.advance_checkpoint(&feed_id, tip.clone()).await {
                        outcome.error = Some(e.to_string());
                        return outcome;
                    }
                    debug!(feed = %feed_id, "initialized checkpoint at archive tip");
                    Some(tip)
                }
                Ok(None) => return outcome,
                Err(e) => {
                    outcome.error = Some(e.to_string());
                    return outcome;
                }
            },
        };

        let commits = match feed.poll(since.as_ref()).await {
            Ok(commits) => commits,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        // Extract new messages, oldest first. Commits that yield nothing
        // still advance the checkpoint.
        let mut batch: Vec<(MessageId, crate::domain::CommitRef)> = Vec::new();
        let mut fresh: HashMap<String, Message> = HashMap::new();
        let mut last_processed = None;
        for commit in &commits {
            match extractor::extract(feed.as_ref(), commit).await {
                Ok(Some(message)) => {
                    batch.push((message.message_id().clone(), commit.clone()));
                    fresh.insert(message.message_id().0.clone(), message);
                    last_processed = Some(commit.clone());
                }
                Ok(None) => {
                    last_processed = Some(commit.clone());
                }
                Err(e) => {
                    // Stop at the first unreadable commit; the checkpoint
                    // only advances over what was actually processed.
                    outcome.error = Some(e.to_string());
                    break;
                }
            }
        }

        // Durably queue the batch for every delivery, then advance the
        // checkpoint. Only after both are on disk do we talk to targets.
        for delivery in &deliveries {
            if let Err(e) = self.store.queue_pending(&delivery.id, &batch).await {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        }
        if let Some(last) = &last_processed {
            if let Err(e) = self
                .store
                .advance_checkpoint(&feed_id, Checkpoint::at(last))
                .await
            {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        }

        // Deliveries of the same feed to different targets run
        // concurrently; messages within one delivery stay sequential.
        let results = futures::future::join_all(deliveries.iter().map(|delivery| {
            let fresh = &fresh;
            let feed = Arc::clone(&feed);
            async move {
                let stats = self.deliver_batch(feed, delivery, fresh).await;
                (delivery.id.clone(), stats)
            }
        }))
        .await;

        for (delivery_id, (stats, mut warnings, failures)) in results {
            outcome.warnings.append(&mut warnings);
            outcome
                .failures
                .extend(failures.into_iter().map(|r| (delivery_id.clone(), r)));
            outcome.stats.push((delivery_id, stats));
        }
        outcome
    }

    /// Delivers everything pending for one delivery, in sequence order.
    ///
    /// Returns the stats, operator-facing warnings, and the reasons of any
    /// permanent failures recorded during the batch.
    async fn deliver_batch(
        &self,
        feed: Arc<dyn FeedSource>,
        delivery: &Delivery,
        fresh: &HashMap<String, Message>,
    ) -> (DeliveryStats, Vec<String>, Vec<String>) {
        let mut stats = DeliveryStats::default();
        let mut warnings = Vec::new();
        let mut failures = Vec::new();

        let pending = self.store.pending(&delivery.id).await;
        if pending.is_empty() {
            return (stats, warnings, failures);
        }

        let Some(target) = self.targets.get(&delivery.target) else {
            warnings.push(format!(
                "delivery '{}' names unknown target '{}'",
                delivery.id, delivery.target
            ));
            stats.pending = pending.len();
            return (stats, warnings, failures);
        };

        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                stats.pending = pending.len();
                return (stats, warnings, failures);
            }
        };

        // Holding the lock for the whole batch serializes fan-in and keeps
        // per-target ordering intact.
        let mut target = target.lock().await;
        let trace = DeliveryTrace {
            feed: feed.id().to_string(),
            delivery: delivery.id.to_string(),
        };

        // One authentication per batch; an auth problem parks the whole
        // batch as pending rather than failing messages individually.
        match timeout(self.settings.deliver_timeout(), target.authenticate()).await {
            Ok(Ok(())) => {}
            Ok(Err(TargetError::AuthRequired(reason))) => {
                warn!(target = %delivery.target, %reason, "authentication required");
                let _ = self.events.send(EngineEvent::AuthRequired {
                    target: delivery.target.clone(),
                });
                stats.auth_required = true;
                stats.pending = pending.len();
                return (stats, warnings, failures);
            }
            Ok(Err(e)) => {
                warn!(target = %delivery.target, error = %e, "target authentication failed");
                let _ = self.events.send(EngineEvent::TargetError {
                    target: delivery.target.clone(),
                    reason: e.to_string(),
                });
                stats.pending = pending.len();
                return (stats, warnings, failures);
            }
            Err(_) => {
                let _ = self.events.send(EngineEvent::TargetError {
                    target: delivery.target.clone(),
                    reason: "authentication timed out".to_string(),
                });
                stats.pending = pending.len();
                return (stats, warnings, failures);
            }
        }

        let total = pending.len();
        for (index, (msgid, record)) in pending.into_iter().enumerate() {
            if self.cancelled() {
                stats.pending += total - index;
                debug!(delivery = %delivery.id, "cancellation requested, stopping batch");
                break;
            }

            if record.attempts() >= self.settings.max_attempts {
                warnings.push(format!(
                    "delivery '{}': message {} exceeded {} attempts, left pending",
                    delivery.id, msgid, self.settings.max_attempts
                ));
                stats.pending += 1;
                continue;
            }

            // New messages are in memory; retries from earlier runs are
            // re-loaded from the archive via their recorded commit.
            let message = match fresh.get(&msgid.0) {
                Some(message) => message.clone(),
                None => match extractor::extract(feed.as_ref(), &record.commit).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        let reason = format!(
                            "message {} no longer extractable from commit {}",
                            msgid, record.commit
                        );
                        if self.store.mark_failed(&delivery.id, &msgid, &reason).await.is_ok() {
                            stats.failed += 1;
                            failures.push(reason);
                        } else {
                            warnings.push(reason);
                        }
                        continue;
                    }
                    Err(e) => {
                        warnings.push(format!(
                            "delivery '{}': archive read failed, leaving batch pending: {}",
                            delivery.id, e
                        ));
                        stats.pending += total - index;
                        break;
                    }
                },
            };

            // Blocklisted senders are absorbed: marked delivered without
            // the target ever seeing the message.
            if message
                .from_header()
                .is_some_and(|from| self.blocklist.matches_from(from))
            {
                match self.store.mark_delivered(&delivery.id, &msgid).await {
                    Ok(true) => stats.absorbed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warnings.push(format!("store write failed: {}", e));
                        stats.pending += total - index;
                        break;
                    }
                }
                continue;
            }

            let attempt = timeout(
                self.settings.deliver_timeout(),
                target.deliver(&message, &delivery.labels, &trace),
            )
            .await;

            let result = match attempt {
                Ok(result) => result,
                Err(_) => Err(TargetError::Transient("delivery timed out".to_string())),
            };

            match result {
                Ok(()) => match self.store.mark_delivered(&delivery.id, &msgid).await {
                    Ok(true) => stats.delivered += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warnings.push(format!("store write failed: {}", e));
                        stats.pending += total - index - 1;
                        break;
                    }
                },
                Err(TargetError::Transient(reason)) => {
                    debug!(
                        delivery = %delivery.id,
                        msgid = %msgid,
                        %reason,
                        "transient delivery failure"
                    );
                    let attempts = self
                        .store
                        .bump_attempts(&delivery.id, &msgid)
                        .await
                        .unwrap_or(0);
                    if attempts >= self.settings.max_attempts {
                        warnings.push(format!(
                            "delivery '{}': message {} still undelivered after {} attempts: {}",
                            delivery.id, msgid, attempts, reason
                        ));
                    }
                    stats.pending += 1;
                }
                Err(TargetError::AuthRequired(reason)) => {
                    warn!(target = %delivery.target, %reason, "authentication required mid-batch");
                    let _ = self.events.send(EngineEvent::AuthRequired {
                        target: delivery.target.clone(),
                    });
                    stats.auth_required = true;
                    stats.pending += total - index;
                    break;
                }
                Err(e @ (TargetError::Permanent(_) | TargetError::CapabilityUnsupported(_))) => {
                    let reason = e.to_string();
                    let _ = self.events.send(EngineEvent::TargetError {
                        target: delivery.target.clone(),
                        reason: reason.clone(),
                    });
                    if let Err(e) = self.store.mark_failed(&delivery.id, &msgid, &reason).await {
                        warnings.push(format!("store write failed: {}", e));
                        stats.pending += total - index;
                        break;
                    }
                    stats.failed += 1;
                    failures.push(format!("{}: {}", msgid, reason));
                }
            }
        }

        if stats.delivered + stats.absorbed > 0 {
            let _ = self.events.send(EngineEvent::Delivered {
                delivery: delivery.id.clone(),
                count: stats.delivered + stats.absorbed,
            });
        }
        (stats, warnings, failures)
    }

    /// Fetches one message by id from the configured message archive and
    /// delivers it directly to a target, outside any configured delivery.
    pub async fn yank_one(
        &self,
        msgid_or_url: &str,
        target_id: &TargetId,
        labels: &[String],
    ) -> Result<(), EngineError> {
        let msgid = parse_msgid(msgid_or_url);
        let url = format!(
            "{}/{}/raw",
            self.settings.message_url.trim_end_matches('/'),
            msgid
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::Fetch(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let raw = response
            .bytes()
            .await
            .map_err(|e| EngineError::Fetch(e.to_string()))?;

        let message = Message::from_raw(raw)
            .ok_or_else(|| EngineError::Parse(format!("no parseable message at {}", url)))?;

        let target = self
            .targets
            .get(target_id)
            .ok_or_else(|| EngineError::UnknownTarget(target_id.clone()))?;
        let mut target = target.lock().await;
        target.authenticate().await?;

        let trace = DeliveryTrace {
            feed: "yank".to_string(),
            delivery: format!("yank:{}", target_id),
        };
        target.deliver(&message, labels, &trace).await?;
        info!(msgid = %message.message_id(), target = %target_id, "yanked message");
        Ok(())
    }

    /// Runs the interactive authorization for one target. Invoked by the
    /// operator's explicit authenticate command, never by `run_once`.
    pub async fn authorize_target(&self, target_id: &TargetId) -> Result<(), EngineError> {
        let target = self
            .targets
            .get(target_id)
            .ok_or_else(|| EngineError::UnknownTarget(target_id.clone()))?;
        let mut target = target.lock().await;
        target.authorize().await?;
        Ok(())
    }
}

/// Builds one target from its tagged settings.
fn build_target(
    name: &str,
    settings: &TargetSettings,
    data_dir: &std::path::Path,
) -> Result<Box<dyn Target>, EngineError> {
    let id = TargetId::from(name);
    let target: Box<dyn Target> = match settings {
        TargetSettings::RestInbox { api_base } => {
            let mut config = RestInboxConfig::default();
            if let Some(base) = api_base {
                config.api_base = base.trim_end_matches('/').to_string();
            }
            Box::new(RestInboxTarget::new(id, config))
        }
        TargetSettings::Imap {
            server,
            port,
            username,
            folder,
            auth,
            password,
            password_file,
            client_id,
            tenant,
            token_file,
        } => {
            let auth = match auth {
                ImapAuthKind::Password => ImapAuthConfig::Password {
                    password: password.clone(),
                    password_file: password_file.clone(),
                },
                ImapAuthKind::OAuth2 => ImapAuthConfig::OAuth2 {
                    client_id: client_id.clone(),
                    tenant: tenant.clone(),
                    token_file: token_file.clone().unwrap_or_else(|| {
                        data_dir.join(format!("imap-{}-oauth2-token.json", name))
                    }),
                },
            };
            Box::new(ImapTarget::new(
                id,
                ImapTargetConfig {
                    server: server.clone(),
                    port: *port,
                    username: username.clone(),
                    folder: folder.clone(),
                    auth,
                },
            )?)
        }
        TargetSettings::JsonMail {
            server,
            username,
            token,
            token_file,
        } => Box::new(JsonMailTarget::new(
            id,
            JsonMailConfig {
                server: server.clone(),
                username: username.clone(),
                token: token.clone(),
                token_file: token_file.clone(),
            },
        )?),
        TargetSettings::Maildir { path } => Box::new(MaildirTarget::new(id, path.clone())?),
        TargetSettings::Pipe { command } => Box::new(PipeTarget::new(id, command.clone())?),
    };
    Ok(target)
}

/// Accepts a bare Message-ID, a bracketed one, or an archive URL whose path
/// contains the id.
fn parse_msgid(input: &str) -> String {
    let input = input.trim();
    if input.starts_with("http://") || input.starts_with("https://") {
        if let Ok(url) = url::Url::parse(input) {
            if let Some(segments) = url.path_segments() {
                for segment in segments {
                    if segment.contains('@') {
                        return segment.to_string();
                    }
                }
            }
        }
    }
    input
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_msgid_variants() {
        assert_eq!(parse_msgid("<m1@example.com>"), "m1@example.com");
        assert_eq!(parse_msgid("m1@example.com"), "m1@example.com");
        assert_eq!(
            parse_msgid("https://lore.kernel.org/all/m1@example.com/"),
            "m1@example.com"
        );
        assert_eq!(
            parse_msgid("https://lore.kernel.org/lkml/20240101.abc@host/T/#u"),
            "20240101.abc@host"
        );
    }

    #[test]
    fn build_maildir_target_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let target = build_target(
            "local",
            &TargetSettings::Maildir {
                path: dir.path().join("inbox"),
            },
            dir.path(),
        )
        .unwrap();
        assert_eq!(target.id().0, "local");
        assert_eq!(target.kind(), crate::targets::TargetKind::Maildir);
    }

    #[test]
    fn build_pipe_target_rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_target(
            "p",
            &TargetSettings::Pipe { command: vec![] },
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Target(TargetError::Permanent(_))));
    }
}
