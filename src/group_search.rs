//! Group search (C5): connected components of a close-pair relation within a cluster.
//!
//! Implemented as union-find (disjoint-set, path compression + union by rank) over cluster
//! member indices. Two members are unioned when their separation is below a pair-dependent bound
//! implied by `r_out` (the larger of the two members' outer changeover radii). Ties in the
//! pairwise test never arise from floating-point equality alone since the comparison is strict;
//! canonicalisation below is what makes `group_id` assignment deterministic regardless of
//! iteration order.

use crate::particle::Particle;
use nalgebra::Vector3;
use rustc_hash::FxHashMap;

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        // lower index wins ties in rank, keeping the merge deterministic
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
                self.parent[hi] = lo;
                self.rank[lo] += 1;
            }
        }
    }
}

/// Whether two particles at the given positions and outer radii are close enough to be unioned
/// into the same group.
fn is_bound_pair(pos_i: Vector3<f64>, r_out_i: f64, pos_j: Vector3<f64>, r_out_j: f64) -> bool {
    let bound = r_out_i.max(r_out_j);
    (pos_i - pos_j).norm() < bound
}

/// Partitions a cluster's members into connected components under [`is_bound_pair`].
///
/// The returned groups are canonicalised: indices within a group are ascending by particle id,
/// and groups are ordered by their first member's id ascending, so `group_id` assignment does
/// not depend on thread or iteration order (P9).
#[must_use]
pub fn find_groups(members: &[Particle]) -> Vec<Vec<usize>> {
    let n = members.len();
    let mut uf = UnionFind::new(n);

    for i in 0..n {
        for j in (i + 1)..n {
            if is_bound_pair(
                members[i].pos,
                members[i].changeover.r_out,
                members[j].pos,
                members[j].changeover.r_out,
            ) {
                uf.union(i, j);
            }
        }
    }

    let mut by_root: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
    for i in 0..n {
        let root = uf.find(i);
        by_root.entry(root).or_default().push(i);
    }

    let mut groups: Vec<Vec<usize>> = by_root.into_values().collect();
    for group in &mut groups {
        group.sort_by_key(|&idx| members[idx].id);
    }
    groups.sort_by_key(|group| members[group[0]].id);
    groups
}

/// Only the subsets with two or more members, i.e. the actual bound groups of `spec.md` §3
/// (`Group ⊂ Cluster`); single-member components remain isolated singles and are not returned.
#[must_use]
pub fn bound_groups_only(members: &[Particle]) -> Vec<Vec<usize>> {
    find_groups(members)
        .into_iter()
        .filter(|group| group.len() >= 2)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeover::Changeover;
    use crate::ids::ParticleId;

    fn single(id: i64, pos: Vector3<f64>) -> Particle {
        Particle::new_single(ParticleId(id), 1.0, pos, Vector3::zeros(), Changeover::new(0.01, 0.05))
    }

    #[test]
    fn sixteen_close_singles_form_one_group() {
        // a tight unit-box cluster with r_out = 0.05: any pair inside the box is well within
        // the bound radius, so the whole cluster collapses into a single connected component.
        let mut members = Vec::new();
        let mut seed: u64 = 12345;
        let mut rand01 = || {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((seed >> 33) as f64) / (u32::MAX as f64)
        };
        for i in 0..16 {
            let pos = Vector3::new(rand01() * 0.01, rand01() * 0.01, rand01() * 0.01);
            members.push(single(i, pos));
        }

        let groups = find_groups(&members);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 16);
    }

    #[test]
    fn far_apart_singles_stay_isolated() {
        let members = vec![single(0, Vector3::zeros()), single(1, Vector3::new(10.0, 0.0, 0.0))];
        let groups = find_groups(&members);
        assert_eq!(groups.len(), 2);
        assert!(bound_groups_only(&members).is_empty());
    }

    #[test]
    fn group_ids_are_deterministic_regardless_of_input_order() {
        let forward = vec![single(0, Vector3::zeros()), single(1, Vector3::new(0.001, 0.0, 0.0)), single(2, Vector3::new(5.0, 0.0, 0.0))];
        let reversed = vec![single(2, Vector3::new(5.0, 0.0, 0.0)), single(1, Vector3::new(0.001, 0.0, 0.0)), single(0, Vector3::zeros())];

        let groups_forward = find_groups(&forward);
        let groups_reversed = find_groups(&reversed);

        let ids_forward: Vec<Vec<i64>> = groups_forward
            .iter()
            .map(|g| g.iter().map(|&i| forward[i].id.0).collect())
            .collect();
        let ids_reversed: Vec<Vec<i64>> = groups_reversed
            .iter()
            .map(|g| g.iter().map(|&i| reversed[i].id.0).collect())
            .collect();

        assert_eq!(ids_forward, ids_reversed);
    }
}
