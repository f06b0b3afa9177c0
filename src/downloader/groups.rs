//! Active-group membership
//!
//! Leaves with a package or pending work are listed in one of three groups.
//! Positions are ranks by region index, so they are stable across restarts.

use std::collections::BTreeSet;

use crate::types::{ActiveGroup, GroupChange, GroupPosition, RegionIndex};

#[derive(Debug, Default)]
pub(crate) struct ActiveGroups {
    new_downloads: BTreeSet<RegionIndex>,
    out_of_date: BTreeSet<RegionIndex>,
    up_to_date: BTreeSet<RegionIndex>,
}

impl ActiveGroups {
    fn members(&self, group: ActiveGroup) -> &BTreeSet<RegionIndex> {
        match group {
            ActiveGroup::NewDownloads => &self.new_downloads,
            ActiveGroup::OutOfDate => &self.out_of_date,
            ActiveGroup::UpToDate => &self.up_to_date,
        }
    }

    fn members_mut(&mut self, group: ActiveGroup) -> &mut BTreeSet<RegionIndex> {
        match group {
            ActiveGroup::NewDownloads => &mut self.new_downloads,
            ActiveGroup::OutOfDate => &mut self.out_of_date,
            ActiveGroup::UpToDate => &mut self.up_to_date,
        }
    }

    fn group_of(&self, index: RegionIndex) -> Option<ActiveGroup> {
        [
            ActiveGroup::NewDownloads,
            ActiveGroup::OutOfDate,
            ActiveGroup::UpToDate,
        ]
        .into_iter()
        .find(|g| self.members(*g).contains(&index))
    }

    pub(crate) fn position(&self, index: RegionIndex) -> Option<GroupPosition> {
        let group = self.group_of(index)?;
        let position = self.members(group).range(..index).count();
        Some(GroupPosition { group, position })
    }

    pub(crate) fn list(&self, group: ActiveGroup) -> Vec<RegionIndex> {
        self.members(group).iter().copied().collect()
    }

    /// Move `index` into `group` (or out of every group); `None` when nothing moved
    pub(crate) fn assign(
        &mut self,
        index: RegionIndex,
        group: Option<ActiveGroup>,
    ) -> Option<GroupChange> {
        let current = self.group_of(index);
        if current == group {
            return None;
        }

        let old = self.position(index);
        if let Some(current) = current {
            self.members_mut(current).remove(&index);
        }
        if let Some(group) = group {
            self.members_mut(group).insert(index);
        }
        Some(GroupChange {
            index,
            old,
            new: self.position(index),
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_ranks_by_index() {
        let mut groups = ActiveGroups::default();
        groups.assign(RegionIndex(9), Some(ActiveGroup::UpToDate));
        groups.assign(RegionIndex(3), Some(ActiveGroup::UpToDate));

        assert_eq!(
            groups.position(RegionIndex(3)),
            Some(GroupPosition {
                group: ActiveGroup::UpToDate,
                position: 0
            })
        );
        assert_eq!(groups.position(RegionIndex(9)).unwrap().position, 1);
        assert_eq!(
            groups.list(ActiveGroup::UpToDate),
            vec![RegionIndex(3), RegionIndex(9)]
        );
    }

    #[test]
    fn moving_reports_old_and_new_position() {
        let mut groups = ActiveGroups::default();
        groups.assign(RegionIndex(1), Some(ActiveGroup::OutOfDate));
        groups.assign(RegionIndex(5), Some(ActiveGroup::OutOfDate));
        groups.assign(RegionIndex(2), Some(ActiveGroup::NewDownloads));

        let change = groups
            .assign(RegionIndex(5), Some(ActiveGroup::NewDownloads))
            .unwrap();
        assert_eq!(
            change.old,
            Some(GroupPosition {
                group: ActiveGroup::OutOfDate,
                position: 1
            })
        );
        assert_eq!(
            change.new,
            Some(GroupPosition {
                group: ActiveGroup::NewDownloads,
                position: 1
            })
        );
    }

    #[test]
    fn staying_in_the_same_group_is_not_a_change() {
        let mut groups = ActiveGroups::default();
        groups.assign(RegionIndex(4), Some(ActiveGroup::NewDownloads));
        assert!(
            groups
                .assign(RegionIndex(4), Some(ActiveGroup::NewDownloads))
                .is_none()
        );
        assert!(groups.assign(RegionIndex(7), None).is_none());
    }

    #[test]
    fn leaving_every_group() {
        let mut groups = ActiveGroups::default();
        groups.assign(RegionIndex(4), Some(ActiveGroup::UpToDate));
        let change = groups.assign(RegionIndex(4), None).unwrap();
        assert!(change.new.is_none());
        assert!(groups.position(RegionIndex(4)).is_none());
    }
}
