//! Defocus grouping.
//!
//! Clusters items by their CTF defocus into contiguous groups so that
//! CTF-related correction parameters can be shared within a group. The
//! algorithm is two-pass: a greedy partition of the sorted values, then a
//! merge pass that folds undersized groups into a neighbor. Keeping the
//! passes separate makes the partition property testable on its own.

use std::fmt;

/// One item to be grouped: an id and its defocus in Angstroms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefocusItem {
    pub id: i64,
    pub defocus: f64,
}

impl DefocusItem {
    pub fn new(id: i64, defocus: f64) -> Self {
        Self { id, defocus }
    }
}

/// A contiguous defocus range and the ids inside it. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct DefocusGroup {
    /// 1-based group id, assigned after merging in ascending defocus order.
    pub id: u32,
    pub min_defocus: f64,
    pub max_defocus: f64,
    pub members: Vec<i64>,
}

impl DefocusGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn span(&self) -> f64 {
        self.max_defocus - self.min_defocus
    }

    /// Distance from a defocus value to this group's range; zero inside.
    fn distance(&self, defocus: f64) -> f64 {
        if defocus < self.min_defocus {
            self.min_defocus - defocus
        } else if defocus > self.max_defocus {
            defocus - self.max_defocus
        } else {
            0.0
        }
    }
}

/// The groups produced by [`DefocusGroups::split_by_diff`], ordered by
/// ascending defocus.
#[derive(Debug, Clone, Default)]
pub struct DefocusGroups {
    groups: Vec<DefocusGroup>,
}

impl DefocusGroups {
    /// Partition items into groups whose defocus span stays within
    /// `defocus_diff`, then merge any group smaller than `min_group_size`
    /// into the adjacent group that keeps the merged span smallest, until
    /// every group meets the minimum or only one group remains.
    pub fn split_by_diff(items: &[DefocusItem], defocus_diff: f64, min_group_size: usize) -> Self {
        let mut sorted: Vec<DefocusItem> = items.to_vec();
        sorted.sort_by(|a, b| a.defocus.total_cmp(&b.defocus));

        // Pass 1: greedy partition of the sorted values.
        let mut groups: Vec<DefocusGroup> = Vec::new();
        for item in sorted {
            match groups.last_mut() {
                Some(g) if item.defocus - g.min_defocus <= defocus_diff => {
                    g.max_defocus = item.defocus;
                    g.members.push(item.id);
                }
                _ => groups.push(DefocusGroup {
                    id: 0,
                    min_defocus: item.defocus,
                    max_defocus: item.defocus,
                    members: vec![item.id],
                }),
            }
        }

        // Pass 2: fold undersized groups into a neighbor.
        while groups.len() > 1 {
            let Some(idx) = groups.iter().position(|g| g.len() < min_group_size) else {
                break;
            };
            let into = merge_target(&groups, idx);
            let small = groups.remove(idx);
            let merging_right = into > idx;
            let target = &mut groups[if merging_right { into - 1 } else { into }];
            target.min_defocus = target.min_defocus.min(small.min_defocus);
            target.max_defocus = target.max_defocus.max(small.max_defocus);
            // Members stay in ascending defocus order across the merge.
            if merging_right {
                target.members.splice(0..0, small.members);
            } else {
                target.members.extend(small.members);
            }
        }

        for (i, g) in groups.iter_mut().enumerate() {
            g.id = (i + 1) as u32;
        }
        Self { groups }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DefocusGroup> {
        self.groups.iter()
    }

    /// Group covering a defocus value. A value between two ranges belongs to
    /// the group with the closer boundary; ties go to the lower-id group.
    pub fn group_of(&self, defocus: f64) -> Option<&DefocusGroup> {
        let mut best: Option<(&DefocusGroup, f64)> = None;
        for g in &self.groups {
            let d = g.distance(defocus);
            match best {
                Some((_, bd)) if d >= bd => {}
                _ => best = Some((g, d)),
            }
        }
        best.map(|(g, _)| g)
    }
}

/// Adjacent group index that minimizes the merged defocus span.
fn merge_target(groups: &[DefocusGroup], idx: usize) -> usize {
    let g = &groups[idx];
    let prev = idx.checked_sub(1).map(|i| {
        (i, g.max_defocus - groups[i].min_defocus)
    });
    let next = (idx + 1 < groups.len()).then(|| {
        (idx + 1, groups[idx + 1].max_defocus - g.min_defocus)
    });
    match (prev, next) {
        (Some((i, a)), Some((j, b))) => {
            if a <= b {
                i
            } else {
                j
            }
        }
        (Some((i, _)), None) => i,
        (None, Some((j, _))) => j,
        (None, None) => idx,
    }
}

impl fmt::Display for DefocusGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>5} {:>6} {:>12} {:>12}", "group", "size", "minDefocus", "maxDefocus")?;
        for g in &self.groups {
            writeln!(
                f,
                "{:>5} {:>6} {:>12.1} {:>12.1}",
                g.id,
                g.len(),
                g.min_defocus,
                g.max_defocus
            )?;
        }
        Ok(())
    }
}
