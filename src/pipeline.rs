//! From match event to ban, as queue jobs.
//!
//! ```text
//! watcher ──submit──▶ detect (High) ──threshold──▶ ban (Critical)
//!                        └──────────────────────▶ persist match (Medium)
//! ignored ──submit──▶ persist match (Low)
//! ```
//!
//! Watchers never touch the cache, the store or the firewall themselves.
//! The ban job outranks every pending persist, so a burst that crosses the
//! threshold is banned before its matches are written.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::alerts::{notify_detached, Notifier, NotifyEvent};
use crate::bans::BanManager;
use crate::cache::MatchWindowCache;
use crate::queue::{JobQueue, Priority};
use crate::records::MatchRecord;
use crate::watcher::{MatchEvent, MatchSink};

#[derive(Clone)]
pub struct Pipeline {
    queue: JobQueue,
    cache: Arc<MatchWindowCache>,
    bans: Arc<BanManager>,
    notifier: Arc<dyn Notifier>,
}

impl Pipeline {
    pub fn new(
        queue: JobQueue,
        cache: Arc<MatchWindowCache>,
        bans: Arc<BanManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            queue,
            cache,
            bans,
            notifier,
        }
    }

    fn detect(&self, event: MatchEvent) -> anyhow::Result<()> {
        let config = &event.source.config;
        let decision = self.cache.record(
            event.source.id(),
            event.address,
            event.timestamp,
            config.find_time,
            config.max_matches,
        );
        debug!(
            source = %event.source.id(),
            address = %event.address,
            count = decision.count,
            total = decision.total,
            threshold = config.max_matches,
            "Match counted"
        );

        if decision.ban {
            let bans = Arc::clone(&self.bans);
            let ban_event = event.clone();
            self.queue.enqueue(
                "ban",
                ban_event,
                move |ev| async move {
                    bans.request_ban(ev.address, &ev.source, &ev.line, decision.total)
                        .await?;
                    Ok(())
                },
                Priority::Critical,
            )?;
        }

        let this = self.clone();
        self.queue.enqueue(
            "persist-match",
            event,
            move |ev| async move { this.persist(ev).await },
            Priority::Medium,
        )?;
        Ok(())
    }

    async fn persist(&self, event: MatchEvent) -> anyhow::Result<()> {
        let record = MatchRecord {
            id: 0,
            source_id: event.source.id().to_string(),
            address: event.address,
            line: event.line,
            pattern: event.source.config.pattern.clone(),
            timestamp: event.timestamp,
            ignored: event.ignored,
        };
        if let Err(e) = self.bans.store().create_match(record).await {
            // Any ban already decided stands
            warn!(
                source = %event.source.id(),
                address = %event.address,
                "Match not persisted, history has a gap"
            );
            return Err(e.into());
        }

        notify_detached(
            &self.notifier,
            NotifyEvent::MatchCreated {
                address: event.address,
                source_id: event.source.id().to_string(),
                source_name: event.source.config.display_name().to_string(),
                ignored: event.ignored,
            },
        );
        Ok(())
    }
}

impl MatchSink for Pipeline {
    fn submit(&self, event: MatchEvent) {
        let this = self.clone();
        let result = if event.ignored {
            self.queue.enqueue(
                "record-ignored",
                event,
                move |ev| async move { this.persist(ev).await },
                Priority::Low,
            )
        } else {
            self.queue.enqueue(
                "detect",
                event,
                move |ev| async move { this.detect(ev) },
                Priority::High,
            )
        };
        if let Err(e) = result {
            warn!("Match dropped: {}", e);
        }
    }
}
