//! Redundancy priorities and the boot target derived from them.

use tracing::{debug, info, instrument};

use super::ItemUpdater;
use crate::error::{Result, UpdaterError};
use crate::events::{UpdaterEvent, UpdaterObserver};
use crate::version::VersionId;

impl<O: UpdaterObserver> ItemUpdater<O> {
    /// Set the redundancy priority of `id`, renumbering conflicting images.
    ///
    /// The image holding the lowest resulting value becomes the boot target
    /// (the requester wins ties). Nothing is applied when renumbering would
    /// overflow, or when `id` is neither active nor activating.
    #[instrument(skip(self), fields(id = %id))]
    pub fn set_priority(&mut self, id: &VersionId, value: u8) -> Result<u8> {
        let state = self
            .activations
            .get(id)
            .map(|a| a.state)
            .ok_or_else(|| UpdaterError::UnknownVersion(id.clone()))?;
        if !state.holds_priority() {
            return Err(UpdaterError::NotPrioritizable {
                id: id.clone(),
                state,
            });
        }

        let (bumps, boot_target) = self.plan_priorities(id, value)?;

        self.assign_priority(id, value)?;
        for (other, priority) in bumps {
            debug!(id = %other, priority, "Bumping conflicting priority");
            self.assign_priority(&other, priority)?;
        }
        self.update_boot_target(&boot_target)?;

        if self.is_lowest_priority(value) {
            let mirrored = self.flash.mirror_alternate();
            self.best_effort("mirror boot environment", mirrored);
        }
        Ok(value)
    }

    /// Compute the cascade for `(id, value)` without touching anything.
    ///
    /// Returns the renumbered images and the image that ends up lowest.
    fn plan_priorities(
        &self,
        id: &VersionId,
        value: u8,
    ) -> Result<(Vec<(VersionId, u8)>, VersionId)> {
        let mut entries = vec![(id.clone(), value)];
        entries.extend(self.activations.values().filter_map(|a| {
            let priority = a.redundancy_priority?;
            (&a.id != id).then(|| (a.id.clone(), priority))
        }));
        // Stable: the requester stays first among equal values.
        entries.sort_by_key(|(_, priority)| *priority);

        let mut free = value;
        let mut bumps = Vec::new();
        for (other, priority) in &entries {
            if other == id || *priority != free {
                continue;
            }
            free = free.checked_add(1).ok_or_else(|| UpdaterError::PriorityExhausted {
                id: other.clone(),
                requested: value,
            })?;
            bumps.push((other.clone(), free));
        }

        let lowest = entries[0].0.clone();
        Ok((bumps, lowest))
    }

    /// Persist and publish one priority without renumbering anything else.
    pub(crate) fn assign_priority(&mut self, id: &VersionId, value: u8) -> Result<()> {
        self.store.store_priority(id, value)?;
        self.flash.set_entry(id, value)?;
        self.activation_mut(id)?.redundancy_priority = Some(value);
        self.emit(UpdaterEvent::PriorityChanged {
            id: id.clone(),
            priority: value,
        });
        Ok(())
    }

    /// Drop the priority of `id` from memory and the boot environment.
    ///
    /// Returns whether `id` held one.
    pub(crate) fn clear_priority(&mut self, id: &VersionId) -> bool {
        let had = self
            .activations
            .get_mut(id)
            .and_then(|a| a.redundancy_priority.take())
            .is_some();
        if had {
            let cleared = self.flash.clear_entry(id);
            self.best_effort("clear priority entry", cleared);
        }
        had
    }

    /// `true` when no image holds a priority strictly below `value`.
    pub fn is_lowest_priority(&self, value: u8) -> bool {
        self.activations
            .values()
            .filter_map(|a| a.redundancy_priority)
            .all(|priority| priority >= value)
    }

    /// Point the boot environment at `id`.
    pub(crate) fn update_boot_target(&mut self, id: &VersionId) -> Result<()> {
        self.flash.update_boot_target(id)?;
        info!(id = %id, "Boot target updated");
        self.emit(UpdaterEvent::BootTargetChanged { id: id.clone() });
        Ok(())
    }

    /// Re-derive the boot target from the remaining priorities.
    ///
    /// The lowest value wins; among equal values the last in id order does.
    /// Does nothing when no image holds a priority.
    pub fn recompute_boot_target(&mut self) -> Result<Option<VersionId>> {
        let mut lowest: Option<(u8, &VersionId)> = None;
        for activation in self.activations.values() {
            let Some(priority) = activation.redundancy_priority else {
                continue;
            };
            if lowest.is_none_or(|(current, _)| priority <= current) {
                lowest = Some((priority, &activation.id));
            }
        }

        let Some((_, id)) = lowest else {
            debug!("No prioritized image left, boot target unchanged");
            return Ok(None);
        };
        let id = id.clone();
        self.update_boot_target(&id)?;
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{config, harness};
    use super::*;
    use crate::platform::PlatformCall;
    use crate::state::ActivationState;
    use crate::store::PersistStore;
    use crate::version::VersionPurpose;
    use proptest::prelude::*;

    #[test]
    fn test_set_priority_cascades() {
        let mut h = harness(config(2));
        let a = h.install("aaaa0000", ActivationState::Active, Some(0), true);
        let b = h.install("bbbb0000", ActivationState::Active, Some(5), false);

        assert_eq!(h.updater.set_priority(&b, 0).unwrap(), 0);

        assert_eq!(h.priority(&a), Some(1));
        assert_eq!(h.priority(&b), Some(0));
        assert_eq!(h.platform.boot_target(), Some(b.clone()));
        assert_eq!(h.store.restore_priority(&a).unwrap(), Some(1));
        assert_eq!(h.platform.entries().get(&b), Some(&0));
        assert!(h.platform.saw(&PlatformCall::MirrorAlternate));
    }

    #[test]
    fn test_cascade_stops_at_gap() {
        let mut h = harness(config(4));
        let a = h.install("aaaa0000", ActivationState::Active, Some(1), false);
        let b = h.install("bbbb0000", ActivationState::Active, Some(2), false);
        let c = h.install("cccc0000", ActivationState::Active, Some(4), false);
        let d = h.install("dddd0000", ActivationState::Active, Some(0), false);

        h.updater.set_priority(&d, 1).unwrap();

        assert_eq!(h.priority(&a), Some(2));
        assert_eq!(h.priority(&b), Some(3));
        assert_eq!(h.priority(&c), Some(4));
        assert_eq!(h.priority(&d), Some(1));
        assert_eq!(h.platform.boot_target(), Some(d));
    }

    #[test]
    fn test_not_lowest_keeps_other_boot_target() {
        let mut h = harness(config(2));
        let a = h.install("aaaa0000", ActivationState::Active, Some(0), true);
        let b = h.install("bbbb0000", ActivationState::Active, Some(1), false);

        h.updater.set_priority(&b, 3).unwrap();

        assert_eq!(h.platform.boot_target(), Some(a));
        assert!(!h.platform.saw(&PlatformCall::MirrorAlternate));
    }

    #[test]
    fn test_overflow_applies_nothing() {
        let mut h = harness(config(2));
        let a = h.install("aaaa0000", ActivationState::Active, Some(255), false);
        let b = h.install("bbbb0000", ActivationState::Active, Some(0), false);

        let err = h.updater.set_priority(&b, 255).unwrap_err();
        assert!(matches!(err, UpdaterError::PriorityExhausted { requested: 255, .. }));
        assert_eq!(h.priority(&a), Some(255));
        assert_eq!(h.priority(&b), Some(0));
        assert!(h.platform.calls().is_empty());
    }

    #[test]
    fn test_unknown_version() {
        let mut h = harness(config(2));
        assert!(matches!(
            h.updater.set_priority(&VersionId::new("nope"), 0),
            Err(UpdaterError::UnknownVersion(_))
        ));
    }

    #[test]
    fn test_only_installed_images_take_a_priority() {
        let mut h = harness(config(3));
        let a = h.install("aaaa0000", ActivationState::Active, Some(0), true);
        h.updater.update_boot_target(&a).unwrap();
        let upload = h.upload("bmc-2.11.0", VersionPurpose::Bmc);
        let ready = upload.id.clone();
        h.updater.register_image(upload);
        let failed = h.install("ffff0000", ActivationState::Failed, None, false);
        let invalid = h.install("eeee0000", ActivationState::Invalid, None, false);
        h.platform.clear_calls();

        for (id, state) in [
            (&ready, ActivationState::Ready),
            (&failed, ActivationState::Failed),
            (&invalid, ActivationState::Invalid),
        ] {
            let err = h.updater.set_priority(id, 0).unwrap_err();
            assert!(
                matches!(err, UpdaterError::NotPrioritizable { state: s, .. } if s == state),
                "{err}"
            );
            assert_eq!(h.priority(id), None);
        }

        assert_eq!(h.priority(&a), Some(0));
        assert_eq!(h.platform.boot_target(), Some(a));
        assert!(h.platform.calls().is_empty());
    }

    #[test]
    fn test_activating_image_takes_a_priority() {
        let mut h = harness(config(3));
        let a = h.install("aaaa0000", ActivationState::Active, Some(0), true);
        let b = h.install("bbbb0000", ActivationState::Activating, None, false);

        h.updater.set_priority(&b, 0).unwrap();

        assert_eq!(h.priority(&a), Some(1));
        assert_eq!(h.platform.boot_target(), Some(b));
    }

    #[test]
    fn test_recompute_last_tie_wins() {
        let mut h = harness(config(3));
        h.install("aaaa0000", ActivationState::Active, Some(2), false);
        let b = h.install("bbbb0000", ActivationState::Active, Some(1), false);
        let c = h.install("cccc0000", ActivationState::Active, Some(1), false);

        assert_eq!(h.updater.recompute_boot_target().unwrap(), Some(c.clone()));
        assert_eq!(h.platform.boot_target(), Some(c));
        assert_ne!(h.platform.boot_target(), Some(b));
    }

    #[test]
    fn test_recompute_without_priorities_is_noop() {
        let mut h = harness(config(2));
        h.install("aaaa0000", ActivationState::Ready, None, false);
        assert_eq!(h.updater.recompute_boot_target().unwrap(), None);
        assert!(h.platform.calls().is_empty());
    }

    #[test]
    fn test_is_lowest_priority() {
        let mut h = harness(config(2));
        h.install("aaaa0000", ActivationState::Active, Some(2), false);
        assert!(h.updater.is_lowest_priority(2));
        assert!(h.updater.is_lowest_priority(0));
        assert!(!h.updater.is_lowest_priority(3));
    }

    proptest! {
        #[test]
        fn prop_priorities_stay_distinct(
            initial in proptest::collection::btree_set(0u8..16, 1..6),
            target in 0usize..6,
            value in 0u8..16,
        ) {
            let mut h = harness(config(8));
            let ids: Vec<VersionId> = initial
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    h.install(&format!("{i:08x}"), ActivationState::Active, Some(*p), false)
                })
                .collect();
            let id = ids[target % ids.len()].clone();

            h.updater.set_priority(&id, value).unwrap();

            let mut priorities: Vec<(u8, VersionId)> = ids
                .iter()
                .map(|i| (h.priority(i).unwrap(), i.clone()))
                .collect();
            priorities.sort();
            let before = priorities.len();
            priorities.dedup_by_key(|(p, _)| *p);
            prop_assert_eq!(priorities.len(), before);
            prop_assert_eq!(h.priority(&id), Some(value));
            prop_assert_eq!(h.platform.boot_target(), Some(priorities[0].1.clone()));
        }
    }
}
