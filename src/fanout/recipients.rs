//! Recipient selection for a poster's connections
//!
//! Broad fan-out is bounded. When some users count as active, only active
//! confirmed connections receive an eager reference; otherwise connections
//! are paged through in order. Either way at most `connections_threshold`
//! recipients are served per post.

use super::batch::CommitBatcher;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::model::{ActiveIdentityFilter, Identity};
use crate::store::SocialBackend;
use ahash::AHashSet;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Outcome of one poster fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    /// Connections handed to the delivery callback
    pub recipients: usize,
    /// Recipients per loaded page
    pub pages: Vec<usize>,
    /// Commits issued during this fan-out
    pub commits: usize,
    /// Whether the active-users path was taken
    pub active_path: bool,
    /// Lookups that failed along the way. A failed connection is skipped, a
    /// failed page ends the paging.
    #[serde(skip)]
    pub failures: Vec<StreamError>,
}

pub struct RecipientSelector<'a, B: SocialBackend> {
    backend: &'a B,
    config: &'a StreamConfig,
}

impl<'a, B: SocialBackend> RecipientSelector<'a, B> {
    pub fn new(backend: &'a B, config: &'a StreamConfig) -> Self {
        RecipientSelector { backend, config }
    }

    /// Recently logged-in users plus members of the always-active groups.
    pub fn active_users(&self) -> Result<AHashSet<String>> {
        let mut users = self.backend.active_users(&ActiveIdentityFilter::LastLoginWithinDays(
            self.config.last_login_around_days,
        ))?;
        if !self.config.active_user_groups.is_empty() {
            users.extend(self.backend.active_users(&ActiveIdentityFilter::Groups(
                self.config.active_user_groups.clone(),
            ))?);
        }
        Ok(users)
    }

    /// Hand every selected connection of `poster` to `deliver`.
    pub fn fan_out<F>(
        &self,
        poster: &Identity,
        batcher: &mut CommitBatcher,
        deliver: F,
    ) -> Result<FanoutReport>
    where
        F: FnMut(&Identity),
    {
        let active = self.active_users()?;
        let commits_before = batcher.commits();
        let mut report = if active.is_empty() {
            self.fan_out_all(poster, batcher, deliver)?
        } else {
            self.fan_out_active(poster, &active, batcher, deliver)?
        };
        report.commits = batcher.commits() - commits_before;
        info!(
            poster = %poster.remote_id,
            recipients = report.recipients,
            pages = report.pages.len(),
            commits = report.commits,
            active_path = report.active_path,
            failures = report.failures.len(),
            "poster fan-out done"
        );
        Ok(report)
    }

    fn fan_out_active<F>(
        &self,
        poster: &Identity,
        active: &AHashSet<String>,
        batcher: &mut CommitBatcher,
        mut deliver: F,
    ) -> Result<FanoutReport>
    where
        F: FnMut(&Identity),
    {
        debug!(active_users = active.len(), "fan-out to active connections");
        let threshold = self.config.connections_threshold;
        let mut report = FanoutReport {
            active_path: true,
            ..Default::default()
        };
        let mut offset = 0;
        'pages: while report.recipients < threshold {
            let page = match self.backend.connections(poster, offset, self.config.page_size) {
                Ok(page) => page,
                Err(err) => {
                    warn!(poster = %poster.remote_id, offset, error = %err, "connection page failed");
                    report.failures.push(err);
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            offset += page.len();
            let mut served = 0;
            for connection in &page {
                if connection.id == poster.id || !active.contains(&connection.remote_id) {
                    continue;
                }
                match self
                    .backend
                    .has_confirmed_relationship(&poster.id, &connection.id)
                {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        report.failures.push(err);
                        continue;
                    }
                }
                deliver(connection);
                batcher.record(self.backend);
                served += 1;
                report.recipients += 1;
                if report.recipients == threshold {
                    report.pages.push(served);
                    break 'pages;
                }
            }
            report.pages.push(served);
        }
        Ok(report)
    }

    fn fan_out_all<F>(
        &self,
        poster: &Identity,
        batcher: &mut CommitBatcher,
        mut deliver: F,
    ) -> Result<FanoutReport>
    where
        F: FnMut(&Identity),
    {
        let threshold = self.config.connections_threshold;
        let mut report = FanoutReport::default();
        let mut offset = 0;
        while report.recipients < threshold {
            let limit = self.config.page_size.min(threshold - report.recipients);
            let page = match self.backend.connections(poster, offset, limit) {
                Ok(page) => page,
                Err(err) => {
                    warn!(poster = %poster.remote_id, offset, error = %err, "connection page failed");
                    report.failures.push(err);
                    break;
                }
            };
            if page.is_empty() {
                break;
            }
            for connection in &page {
                deliver(connection);
                batcher.record(self.backend);
            }
            // checkpoint once per page
            batcher.flush(self.backend);
            offset += page.len();
            report.recipients += page.len();
            report.pages.push(page.len());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackend;

    fn world(connections: usize) -> (InMemoryBackend, Identity) {
        let backend = InMemoryBackend::new();
        let poster = backend.add_person("p", "poster");
        for i in 0..connections {
            let friend = backend.add_person(&format!("f{}", i), &format!("friend{}", i));
            backend.connect(&poster.id, &friend.id);
        }
        (backend, poster)
    }

    #[test]
    fn test_fallback_pages_clip_to_threshold() {
        let (backend, poster) = world(120);
        let config = StreamConfig::test();
        let selector = RecipientSelector::new(&backend, &config);
        let mut batcher = CommitBatcher::new(config.batch.size);
        let mut delivered = Vec::new();
        let report = selector
            .fan_out(&poster, &mut batcher, |r| delivered.push(r.remote_id.clone()))
            .unwrap();

        assert!(!report.active_path);
        assert_eq!(report.pages, vec![20, 20, 10]);
        assert_eq!(report.recipients, 50);
        assert_eq!(report.commits, 3);
        assert_eq!(backend.commits(), 3);
        assert_eq!(delivered.first().map(String::as_str), Some("friend0"));
        assert_eq!(delivered.last().map(String::as_str), Some("friend49"));
    }

    #[test]
    fn test_fallback_stops_on_empty_page() {
        let (backend, poster) = world(25);
        let config = StreamConfig::test();
        let selector = RecipientSelector::new(&backend, &config);
        let mut batcher = CommitBatcher::new(config.batch.size);
        let report = selector.fan_out(&poster, &mut batcher, |_| {}).unwrap();
        assert_eq!(report.pages, vec![20, 5]);
        assert_eq!(report.commits, 2);
    }

    #[test]
    fn test_active_path_filters_inactive_connections() {
        let (backend, poster) = world(10);
        let stranger = backend.add_person("s", "stranger");
        backend.set_now(100);
        for i in (0..10).step_by(2) {
            backend.record_login(&format!("friend{}", i), 100);
        }
        // active but not connected
        backend.record_login(&stranger.remote_id, 100);
        backend.record_login(&poster.remote_id, 100);

        let config = StreamConfig::test();
        let selector = RecipientSelector::new(&backend, &config);
        let mut batcher = CommitBatcher::new(config.batch.size);
        let mut delivered = Vec::new();
        let report = selector
            .fan_out(&poster, &mut batcher, |r| delivered.push(r.remote_id.clone()))
            .unwrap();
        batcher.flush(&backend);

        assert!(report.active_path);
        assert_eq!(report.recipients, 5);
        assert_eq!(
            delivered,
            vec!["friend0", "friend2", "friend4", "friend6", "friend8"]
        );
        assert_eq!(backend.commits(), 1);
    }

    #[test]
    fn test_active_path_honors_threshold() {
        let (backend, poster) = world(30);
        for i in 0..30 {
            backend.add_group_member("staff", &format!("friend{}", i));
        }
        let mut config = StreamConfig::test();
        config.active_user_groups = vec!["staff".into()];
        config.connections_threshold = 7;
        let selector = RecipientSelector::new(&backend, &config);
        let mut batcher = CommitBatcher::new(config.batch.size);
        let report = selector.fan_out(&poster, &mut batcher, |_| {}).unwrap();
        assert!(report.active_path);
        assert_eq!(report.recipients, 7);
        assert_eq!(report.pages, vec![7]);
    }

    #[test]
    fn test_paging_skips_unknown_connections_without_losing_offset() {
        let (backend, poster) = world(2);
        // edge to an identity the store cannot resolve, between friend1 and friend2
        backend.connect(&poster.id, &crate::model::IdentityId::new("gone"));
        for i in 2..5 {
            let friend = backend.add_person(&format!("f{}", i), &format!("friend{}", i));
            backend.connect(&poster.id, &friend.id);
        }
        let mut config = StreamConfig::test();
        config.page_size = 2;
        let selector = RecipientSelector::new(&backend, &config);
        let mut batcher = CommitBatcher::new(config.batch.size);
        let mut delivered = Vec::new();
        let report = selector
            .fan_out(&poster, &mut batcher, |r| delivered.push(r.remote_id.clone()))
            .unwrap();

        assert_eq!(
            delivered,
            vec!["friend0", "friend1", "friend2", "friend3", "friend4"]
        );
        assert_eq!(report.recipients, 5);
        assert_eq!(report.pages, vec![2, 2, 1]);
        assert!(report.failures.is_empty());
    }
}
