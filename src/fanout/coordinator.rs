//! Lifecycle event handling
//!
//! Every operation holds the manager's write guard for its whole duration.
//! Failures are handled per recipient: a missing node skips that recipient,
//! a concurrent modification is logged and ignored, anything else is recorded
//! on the event context.

use super::batch::CommitBatcher;
use super::context::StreamContext;
use super::recipients::RecipientSelector;
use crate::config::{BatchScope, StreamConfig};
use crate::error::{ErrorPolicy, NodeKind, Result, StreamError};
use crate::index::{DayKey, IndexStore, StreamIndexManager};
use crate::model::{Activity, ActivityId, Identity, IdentityId, IdentityKind, StreamType};
use crate::store::{ActivityQuery, SocialBackend};
use std::sync::Arc;
use tracing::{debug, info, warn};

const OWNER_STREAMS: [StreamType; 2] = [StreamType::Feed, StreamType::MyActivities];
const CONNECTION_STREAMS: [StreamType; 2] = [StreamType::Feed, StreamType::Connection];
const SPACE_MEMBER_STREAMS: [StreamType; 2] = [StreamType::Feed, StreamType::MySpaces];

pub struct FanoutCoordinator<B: SocialBackend> {
    index: Arc<StreamIndexManager>,
    backend: Arc<B>,
    config: StreamConfig,
}

impl<B: SocialBackend> FanoutCoordinator<B> {
    pub fn new(index: Arc<StreamIndexManager>, backend: Arc<B>, config: StreamConfig) -> Self {
        FanoutCoordinator {
            index,
            backend,
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<StreamIndexManager> {
        &self.index
    }

    // ---------------------------------------------------------------------
    // create
    // ---------------------------------------------------------------------

    /// Fan a new activity out to connections (person stream) or members
    /// (space stream), then to mentioned identities.
    pub fn on_create(&self, ctx: &mut StreamContext) {
        let mut store = self.index.write();
        let result = self.create_refs(&mut store, ctx);
        self.settle("on_create", Some(ctx), result);
    }

    /// Add the owner-side references the author expects to see at once.
    pub fn on_create_poster(&self, ctx: &mut StreamContext) {
        let mut store = self.index.write();
        let result = self.create_poster_refs(&mut store, ctx);
        self.settle("on_create_poster", Some(ctx), result);
    }

    fn create_refs(&self, store: &mut IndexStore, ctx: &mut StreamContext) -> Result<()> {
        let activity = ctx.activity()?.clone();
        let mut batcher = CommitBatcher::new(self.config.batch.size);

        match ctx.identity.kind {
            IdentityKind::Person => {
                // a failed connection stage still lets mentions through
                let selector = RecipientSelector::new(&*self.backend, &self.config);
                let served = self.identity_by_id(&ctx.poster()?).and_then(|poster| {
                    selector.fan_out(&poster, &mut batcher, |recipient| {
                        self.add_refs(store, recipient, &activity, &CONNECTION_STREAMS);
                    })
                });
                match served {
                    Ok(report) => {
                        debug!(
                            activity = %activity.id,
                            pages = ?report.pages,
                            failures = report.failures.len(),
                            "connections served"
                        );
                        for err in report.failures {
                            self.settle("on_create.connection", Some(&mut *ctx), Err(err));
                        }
                    }
                    Err(err) => {
                        self.settle("on_create.connections", Some(&mut *ctx), Err(err));
                    }
                }
            }
            IdentityKind::Space => {
                let space = self
                    .backend
                    .space_by_pretty_name(&ctx.identity.remote_id)?
                    .ok_or_else(|| StreamError::not_found(NodeKind::Space, &ctx.identity.remote_id))?;
                for member in &space.members {
                    let result = self
                        .person_by_remote_id(member)
                        .map(|identity| self.add_refs(store, &identity, &activity, &SPACE_MEMBER_STREAMS));
                    if self.settle("on_create.member", Some(&mut *ctx), result.map(|_| ())) {
                        batcher.record(&*self.backend);
                    }
                }
            }
        }
        self.end_stage(&mut batcher);

        let mentioners = ctx.mentioners.clone();
        self.add_owner_refs(store, ctx, &mentioners, &activity, &mut batcher);
        batcher.flush(&*self.backend);
        Ok(())
    }

    fn create_poster_refs(&self, store: &mut IndexStore, ctx: &StreamContext) -> Result<()> {
        let activity = ctx.activity()?;
        let poster = self.identity_by_id(&ctx.poster()?)?;
        match ctx.identity.kind {
            IdentityKind::Person => {
                self.add_refs(store, &ctx.identity, activity, &[StreamType::MyActivities]);
                self.add_refs(store, &poster, activity, &OWNER_STREAMS);
            }
            IdentityKind::Space => {
                self.add_refs(store, &ctx.identity, activity, &[StreamType::SpaceStream]);
                self.add_refs(store, &poster, activity, &[StreamType::MyActivities]);
            }
        }
        Ok(())
    }

    /// `Feed` + `MyActivities` for each identity, resolved by id.
    fn add_owner_refs(
        &self,
        store: &mut IndexStore,
        ctx: &mut StreamContext,
        identities: &[IdentityId],
        activity: &Activity,
        batcher: &mut CommitBatcher,
    ) {
        for id in identities {
            let result = self
                .identity_by_id(id)
                .map(|identity| self.add_refs(store, &identity, activity, &OWNER_STREAMS));
            if self.settle("mention", Some(&mut *ctx), result.map(|_| ())) {
                batcher.record(&*self.backend);
            }
        }
        self.end_stage(batcher);
    }

    /// Mentions added by an edit.
    pub fn on_mentioners_added(&self, ctx: &mut StreamContext) {
        if ctx.mentioners.is_empty() {
            return;
        }
        let mut store = self.index.write();
        let activity = match ctx.activity() {
            Ok(activity) => activity.clone(),
            Err(err) => {
                self.settle("on_mentioners_added", Some(ctx), Err(err));
                return;
            }
        };
        let mut batcher = CommitBatcher::new(self.config.batch.size);
        let mentioners = ctx.mentioners.clone();
        self.add_owner_refs(&mut store, ctx, &mentioners, &activity, &mut batcher);
        batcher.flush(&*self.backend);
    }

    // ---------------------------------------------------------------------
    // update / delete / visibility
    // ---------------------------------------------------------------------

    /// Move every reference to the activity's new day, or refresh it in place.
    pub fn on_update(&self, ctx: &mut StreamContext) {
        let mut store = self.index.write();
        let result = self.update_refs(&mut store, ctx);
        self.settle("on_update", Some(ctx), result);
    }

    fn update_refs(&self, store: &mut IndexStore, ctx: &StreamContext) -> Result<()> {
        let activity = ctx.activity()?;
        let new_day = DayKey::from_timestamp(activity.effective_timestamp());
        let stale_day = ctx.old_last_updated.map(DayKey::from_timestamp);
        let mut moved = 0;

        for location in store.locations_of(&activity.id) {
            if location.day == new_day {
                store.update_reference(&location, activity, activity.hidden);
                continue;
            }
            store.remove_reference_at(&location, &activity.id);
            store.add_reference(&location.identity, location.stream, activity, activity.hidden);
            if stale_day != Some(location.day) {
                self.settle(
                    "on_update",
                    None,
                    Err(StreamError::ConcurrentModification(format!(
                        "reference to {} for {}/{} found in {} instead of {:?}",
                        activity.id,
                        location.identity,
                        location.stream,
                        location.day,
                        stale_day.map(|d| d.to_string())
                    ))),
                );
            }
            moved += 1;
        }
        debug!(activity = %activity.id, moved, "references updated");
        Ok(())
    }

    /// Remove every reference to the activity.
    pub fn on_delete(&self, activity_id: &ActivityId) {
        let mut store = self.index.write();
        let locations = store.locations_of(activity_id);
        for location in &locations {
            store.remove_reference_at(location, activity_id);
        }
        debug!(activity = %activity_id, removed = locations.len(), "activity references deleted");
    }

    /// Propagate a hide/unhide to every reference's snapshot and the counts.
    pub fn on_visibility_change(&self, ctx: &mut StreamContext) {
        let mut store = self.index.write();
        let result = self.change_visibility(&mut store, ctx);
        self.settle("on_visibility_change", Some(ctx), result);
    }

    fn change_visibility(&self, store: &mut IndexStore, ctx: &mut StreamContext) -> Result<()> {
        let activity = ctx.activity()?.clone();
        if store.locations_of(&activity.id).is_empty() {
            info!(activity = %activity.id, "no references, backfilling before visibility change");
            self.create_poster_refs(store, ctx)?;
            self.create_refs(store, ctx)?;
        }
        let mut changed = 0;
        for location in store.locations_of(&activity.id) {
            if store.set_reference_hidden(&location, &activity.id, activity.hidden) {
                changed += 1;
            }
        }
        debug!(activity = %activity.id, hidden = activity.hidden, changed, "visibility updated");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // likes and comments
    // ---------------------------------------------------------------------

    pub fn on_like(&self, liker: &Identity, activity: &Activity) {
        let mut store = self.index.write();
        self.add_refs(&mut store, liker, activity, &OWNER_STREAMS);
    }

    /// Drop the unliker's `MyActivities` reference unless they still take
    /// part in the activity as commenter or mentioned identity.
    pub fn on_unlike(&self, unliker: &Identity, activity: &Activity) {
        if activity.is_commenter(&unliker.id) || activity.is_mentioned(&unliker.id) {
            debug!(identity = %unliker.id, activity = %activity.id, "unlike keeps reference");
            return;
        }
        let mut store = self.index.write();
        self.remove_refs(&mut store, unliker, &activity.id, &[StreamType::MyActivities]);
    }

    /// Re-place the commenter's references at the activity's new timestamp and
    /// make sure the poster still holds theirs.
    pub fn on_comment_update(&self, ctx: &mut StreamContext) {
        let mut store = self.index.write();
        let result = self.update_commenter_refs(&mut store, ctx);
        self.settle("on_comment_update", Some(ctx), result);
    }

    fn update_commenter_refs(&self, store: &mut IndexStore, ctx: &StreamContext) -> Result<()> {
        let activity = ctx.activity()?;
        let commenter = &ctx.identity;
        if commenter.enabled {
            for stream in [StreamType::MyActivities, StreamType::Feed] {
                let removed = match ctx.old_last_updated {
                    Some(old) => store
                        .remove_reference(&commenter.id, stream, &activity.id, Some(old))
                        .is_some(),
                    None => false,
                };
                if !removed && store.remove_reference(&commenter.id, stream, &activity.id, None).is_some() {
                    debug!(identity = %commenter.id, %stream, "stale commenter reference found outside its day");
                }
                store.add_reference(&commenter.id, stream, activity, activity.hidden);
            }
        }

        let poster = self.identity_by_id(&activity.poster)?;
        for stream in [StreamType::MyActivities, StreamType::Feed] {
            if !store.has_reference(&poster.id, stream, &activity.id, None) {
                debug!(identity = %poster.id, %stream, "restoring poster reference");
                self.add_refs(store, &poster, activity, &[stream]);
            }
        }
        Ok(())
    }

    /// Withdraw the references of mentioners and commenters of a deleted
    /// comment. Owner and poster keep theirs; connections of the owner keep
    /// their `Feed` reference.
    pub fn on_comment_delete(&self, ctx: &mut StreamContext) {
        let mut store = self.index.write();
        let activity = match ctx.activity() {
            Ok(activity) => activity.clone(),
            Err(err) => {
                self.settle("on_comment_delete", Some(ctx), Err(err));
                return;
            }
        };
        let affected: Vec<IdentityId> = ctx
            .mentioners
            .iter()
            .chain(ctx.commenters.iter())
            .cloned()
            .collect();
        for id in affected {
            if id == activity.owner || id == activity.poster {
                continue;
            }
            let result = self.withdraw_participant(&mut store, &id, &activity);
            self.settle("on_comment_delete", Some(&mut *ctx), result);
        }
    }

    fn withdraw_participant(
        &self,
        store: &mut IndexStore,
        id: &IdentityId,
        activity: &Activity,
    ) -> Result<()> {
        let identity = self.identity_by_id(id)?;
        self.remove_refs(store, &identity, &activity.id, &[StreamType::MyActivities]);
        if !self
            .backend
            .has_confirmed_relationship(&activity.owner, id)?
        {
            self.remove_refs(store, &identity, &activity.id, &[StreamType::Feed]);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // membership and relationships
    // ---------------------------------------------------------------------

    pub fn on_space_member_added(&self, ctx: &mut StreamContext) {
        let mut store = self.index.write();
        let mut batcher = CommitBatcher::new(self.config.batch.size);
        let result = self.space_activities(ctx).map(|activities| {
            for activity in &activities {
                if self.add_refs(&mut store, &ctx.identity, activity, &SPACE_MEMBER_STREAMS) {
                    batcher.record(&*self.backend);
                }
            }
            debug!(member = %ctx.identity.id, activities = activities.len(), "member joined");
        });
        batcher.flush(&*self.backend);
        self.settle("on_space_member_added", Some(ctx), result);
    }

    pub fn on_space_member_removed(&self, ctx: &mut StreamContext) {
        let mut store = self.index.write();
        let mut batcher = CommitBatcher::new(self.config.batch.size);
        let result = self.space_activities(ctx).map(|activities| {
            for activity in &activities {
                if self.remove_refs(&mut store, &ctx.identity, &activity.id, &SPACE_MEMBER_STREAMS) {
                    batcher.record(&*self.backend);
                }
            }
            debug!(member = %ctx.identity.id, activities = activities.len(), "member left");
        });
        batcher.flush(&*self.backend);
        self.settle("on_space_member_removed", Some(ctx), result);
    }

    fn space_activities(&self, ctx: &StreamContext) -> Result<Vec<Activity>> {
        let space = ctx.space()?;
        Ok(self
            .backend
            .query_activities(&ActivityQuery::stream_of(&space.id))?
            .collect())
    }

    /// Give each side the other's non-space activities under `Connection`.
    pub fn on_connect(&self, a: &Identity, b: &Identity) {
        let mut store = self.index.write();
        let mut batcher = CommitBatcher::new(self.config.batch.size);
        for (from, to) in [(a, b), (b, a)] {
            let result = self.share_activities(&mut store, from, to, &mut batcher);
            self.settle("on_connect", None, result);
        }
        batcher.flush(&*self.backend);
    }

    fn share_activities(
        &self,
        store: &mut IndexStore,
        from: &Identity,
        to: &Identity,
        batcher: &mut CommitBatcher,
    ) -> Result<()> {
        let mut shared = 0;
        for id in store.activity_ids(&from.id, StreamType::MyActivities) {
            if store.has_reference(&to.id, StreamType::Connection, &id, None) {
                continue;
            }
            let Some(activity) = self.backend.find_activity(&id)? else {
                continue;
            };
            if activity.is_space_activity() {
                continue;
            }
            if self.add_refs(store, to, &activity, &CONNECTION_STREAMS) {
                batcher.record(&*self.backend);
                shared += 1;
            }
        }
        debug!(from = %from.id, to = %to.id, shared, "connection references added");
        Ok(())
    }

    /// Withdraw from each side the `Feed` and `Connection` references to
    /// activities posted by the other side.
    pub fn on_disconnect(&self, a: &Identity, b: &Identity) {
        let mut store = self.index.write();
        let mut batcher = CommitBatcher::new(self.config.batch.size);
        for (from, to) in [(a, b), (b, a)] {
            let result = self.unshare_activities(&mut store, from, to, &mut batcher);
            self.settle("on_disconnect", None, result);
        }
        batcher.flush(&*self.backend);
    }

    fn unshare_activities(
        &self,
        store: &mut IndexStore,
        from: &Identity,
        to: &Identity,
        batcher: &mut CommitBatcher,
    ) -> Result<()> {
        let mut removed = 0;
        for id in store.activity_ids(&to.id, StreamType::Connection) {
            let Some(activity) = self.backend.find_activity(&id)? else {
                continue;
            };
            if activity.poster != from.id {
                continue;
            }
            if self.remove_refs(store, to, &id, &CONNECTION_STREAMS) {
                batcher.record(&*self.backend);
                removed += 1;
            }
        }
        debug!(from = %from.id, to = %to.id, removed, "connection references removed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // bulk loading
    // ---------------------------------------------------------------------

    /// Bulk-load references for an owner. After an earlier migration the
    /// count cache keeps the larger of its previous value and this load.
    pub fn create_activity_refs(&self, owner: &Identity, activities: &[Activity], stream: StreamType) {
        let Some(last) = activities.last() else {
            return;
        };
        let mut store = self.index.write();
        let (previous_number, previous_migration) = {
            let index = store.index_or_create(&owner.id, stream);
            let snapshot = (index.number(), index.last_migration());
            index.set_last_migration(last.effective_timestamp());
            snapshot
        };

        let mut loaded = 0;
        for activity in activities {
            let placement = store.add_reference(&owner.id, stream, activity, activity.hidden);
            if placement.created && !activity.hidden {
                loaded += 1;
            }
        }

        if previous_migration.is_some_and(|ts| ts > 0) {
            let index = store.index_or_create(&owner.id, stream);
            index.set_number(previous_number.max(loaded));
        }
        self.backend.commit();
        info!(owner = %owner.id, %stream, loaded, "activity references migrated");
    }

    /// Overwrite an index's count cache.
    pub fn migrate_stream_size(&self, owner: &Identity, size: i64, stream: StreamType) {
        let mut store = self.index.write();
        store.index_or_create(&owner.id, stream).set_number(size);
        self.backend.commit();
    }

    // ---------------------------------------------------------------------
    // helpers
    // ---------------------------------------------------------------------

    /// Add references for one recipient. Disabled identities are skipped.
    fn add_refs(
        &self,
        store: &mut IndexStore,
        identity: &Identity,
        activity: &Activity,
        streams: &[StreamType],
    ) -> bool {
        if !identity.enabled {
            debug!(identity = %identity.id, "skipping disabled identity");
            return false;
        }
        for &stream in streams {
            if stream == StreamType::Connection {
                store.set_latest_activity_time(&identity.id, activity.effective_timestamp());
            }
            store.add_reference(&identity.id, stream, activity, activity.hidden);
        }
        true
    }

    /// Remove references of one identity, wherever they sit.
    fn remove_refs(
        &self,
        store: &mut IndexStore,
        identity: &Identity,
        activity_id: &ActivityId,
        streams: &[StreamType],
    ) -> bool {
        if !identity.enabled {
            debug!(identity = %identity.id, "skipping disabled identity");
            return false;
        }
        let mut removed = false;
        for &stream in streams {
            removed |= store
                .remove_reference(&identity.id, stream, activity_id, None)
                .is_some();
        }
        removed
    }

    fn end_stage(&self, batcher: &mut CommitBatcher) {
        if self.config.batch.scope == BatchScope::Stage {
            batcher.flush(&*self.backend);
        }
    }

    fn identity_by_id(&self, id: &IdentityId) -> Result<Identity> {
        self.backend
            .find_identity_by_id(id)?
            .ok_or_else(|| StreamError::not_found(NodeKind::Identity, id.as_str()))
    }

    fn person_by_remote_id(&self, remote_id: &str) -> Result<Identity> {
        self.backend
            .find_identity(IdentityKind::Person, remote_id)?
            .ok_or_else(|| StreamError::not_found(NodeKind::Identity, remote_id))
    }

    /// Apply the error policy. Returns true when the step succeeded.
    fn settle(&self, op: &'static str, ctx: Option<&mut StreamContext>, result: Result<()>) -> bool {
        let err = match result {
            Ok(()) => return true,
            Err(err) => err,
        };
        match err.policy() {
            ErrorPolicy::SkipStep => {
                debug!(op, error = %err, "step skipped");
            }
            ErrorPolicy::Converged => {
                warn!(op, error = %err, "probably updated by another writer");
            }
            ErrorPolicy::Record => {
                warn!(op, "failed to maintain activity references");
                debug!(op, error = ?err, "failure detail");
                if let Some(ctx) = ctx {
                    ctx.fail(err);
                }
            }
        }
        false
    }
}
