// SPDX-License-Identifier: GPL-3.0-only

//! Path group layout and table construction.

use multipath_types::{GroupingPolicy, MapTable, TableGroup};

use crate::catalog::{Catalog, MapKey, PathGroup, PathGroupStatus, PathKey};

struct Member {
    key: PathKey,
    priority: i32,
    dev: String,
}

fn sorted_members(catalog: &Catalog, map: MapKey) -> Vec<Member> {
    let mut members: Vec<Member> = catalog
        .members(map)
        .into_iter()
        .filter_map(|key| {
            catalog.path(key).map(|path| Member {
                key,
                priority: path.priority,
                dev: path.dev().to_string(),
            })
        })
        .collect();
    members.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.dev.cmp(&b.dev)));
    members
}

fn partition(grouping: GroupingPolicy, members: &[Member]) -> Vec<Vec<PathKey>> {
    match grouping {
        GroupingPolicy::Failover => members.iter().map(|member| vec![member.key]).collect(),
        GroupingPolicy::Multibus => {
            if members.is_empty() {
                Vec::new()
            } else {
                vec![members.iter().map(|member| member.key).collect()]
            }
        }
        GroupingPolicy::GroupByPrio => {
            let mut groups: Vec<(i32, Vec<PathKey>)> = Vec::new();
            for member in members {
                match groups.last_mut() {
                    Some((priority, keys)) if *priority == member.priority => keys.push(member.key),
                    _ => groups.push((member.priority, vec![member.key])),
                }
            }
            groups.into_iter().map(|(_, keys)| keys).collect()
        }
    }
}

/// Rebuild the path groups of `map` from its members and their priorities.
pub fn rebuild_groups(catalog: &mut Catalog, map: MapKey) {
    let Some(grouping) = catalog.map(map).map(|m| m.settings.grouping) else {
        return;
    };
    let layout = partition(grouping, &sorted_members(catalog, map));

    if let Some(m) = catalog.map_mut(map) {
        m.groups = layout
            .into_iter()
            .map(|paths| PathGroup {
                paths,
                ..PathGroup::default()
            })
            .collect();
    }
    refresh_group_priorities(catalog, map);

    if let Some(m) = catalog.map_mut(map) {
        m.groups.sort_by(|a, b| b.priority.cmp(&a.priority));
    }
    assign_group_indices(catalog, map);
}

fn assign_group_indices(catalog: &mut Catalog, map: MapKey) {
    let assignments: Vec<(PathKey, usize)> = catalog
        .map(map)
        .map(|m| {
            m.groups
                .iter()
                .enumerate()
                .flat_map(|(index, group)| group.paths.iter().map(move |key| (*key, index)))
                .collect()
        })
        .unwrap_or_default();

    for (key, index) in assignments {
        if let Some(path) = catalog.path_mut(key) {
            path.group_index = Some(index);
        }
    }
}

/// Recompute each group's aggregate priority and status from its paths.
pub fn refresh_group_priorities(catalog: &mut Catalog, map: MapKey) {
    let Some(m) = catalog.map(map) else {
        return;
    };
    let summaries: Vec<(i32, bool)> = m
        .groups
        .iter()
        .map(|group| {
            let mut priority = 0;
            let mut usable = false;
            for key in &group.paths {
                if let Some(path) = catalog.path(*key)
                    && path.state.is_usable()
                {
                    priority += path.priority;
                    usable = true;
                }
            }
            (priority, usable)
        })
        .collect();

    if let Some(m) = catalog.map_mut(map) {
        for (group, (priority, usable)) in m.groups.iter_mut().zip(summaries) {
            group.priority = priority;
            group.status = if usable {
                PathGroupStatus::Enabled
            } else {
                PathGroupStatus::Disabled
            };
        }
    }
}

/// Whether current priorities would put the members into different groups.
pub fn layout_changed(catalog: &Catalog, map: MapKey) -> bool {
    let Some(m) = catalog.map(map) else {
        return false;
    };
    let normalize = |groups: Vec<Vec<PathKey>>| {
        let mut groups: Vec<Vec<PathKey>> = groups
            .into_iter()
            .map(|mut keys| {
                keys.sort();
                keys
            })
            .collect();
        groups.sort();
        groups
    };

    let current = normalize(m.groups.iter().map(|group| group.paths.clone()).collect());
    let wanted = normalize(partition(m.settings.grouping, &sorted_members(catalog, map)));
    current != wanted
}

/// Desired kernel table for `map`.
pub fn build_table(catalog: &Catalog, map: MapKey) -> Option<MapTable> {
    let m = catalog.map(map)?;
    let groups: Vec<TableGroup> = m
        .groups
        .iter()
        .map(|group| TableGroup {
            selector: m.settings.selector.clone(),
            paths: group
                .paths
                .iter()
                .filter_map(|key| catalog.path(*key))
                .map(|path| path.devt())
                .collect(),
        })
        .collect();

    Some(MapTable {
        size: m.size,
        wwid: m.wwid.clone(),
        queue_if_no_path: m.queueing,
        initial_group: m.best_group.min(groups.len().saturating_sub(1)),
        groups,
    })
}
