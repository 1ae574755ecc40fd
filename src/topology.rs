//! Pure k-ary tree topology functions (§4.3). These are the sole source of
//! peer identities for the [`crate::overlay::Overlay`] — no peer exists that
//! isn't produced by `parent_of`/`children_of` for the session's `{k, size}`.

/// `parent_of(rank) = (rank - 1) / k`. Rank 0 is the root and has no parent.
pub fn parent_of(rank: u32, k: u32) -> Option<u32> {
    if rank == 0 {
        None
    } else {
        Some((rank - 1) / k)
    }
}

/// `children_of(rank) = {rank*k + 1, ..., rank*k + k} ∩ [0, size)`.
pub fn children_of(rank: u32, k: u32, size: u32) -> Vec<u32> {
    let first = rank * k + 1;
    (first..first + k).filter(|&c| c < size).collect()
}

/// Tree-distance (hop count) between two ranks, computed by walking both
/// up to their lowest common ancestor.
pub fn distance(a: u32, b: u32, k: u32) -> u32 {
    let mut depth_a = Vec::new();
    let mut cur = a;
    depth_a.push(cur);
    while let Some(p) = parent_of(cur, k) {
        depth_a.push(p);
        cur = p;
    }
    let mut cur = b;
    let mut depth_b = vec![cur];
    while let Some(p) = parent_of(cur, k) {
        depth_b.push(p);
        cur = p;
    }
    // Find the lowest common ancestor by scanning for the first rank in
    // depth_a's ancestor chain that also appears in depth_b's.
    for (i, &ra) in depth_a.iter().enumerate() {
        if let Some(j) = depth_b.iter().position(|&rb| rb == ra) {
            return (i + j) as u32;
        }
    }
    unreachable!("rank 0 is a common ancestor of every rank")
}

/// Which of `self_rank`'s children is the gateway toward `target` — i.e.
/// the child whose subtree contains `target` — or `None` if `target` is
/// not a descendant of `self_rank` at all (the router then forwards
/// upstream instead, §4.9.1).
pub fn child_gateway(self_rank: u32, target: u32, k: u32, size: u32) -> Option<u32> {
    if target >= size || target == self_rank {
        return None;
    }
    let mut cur = target;
    while let Some(p) = parent_of(cur, k) {
        if p == self_rank {
            return Some(cur);
        }
        cur = p;
    }
    None
}

/// The full upward path from `rank` to the root, as rank-decimal hops,
/// root-first. Used by tests to assert S1's expected ping route.
pub fn path_to_root(rank: u32, k: u32) -> Vec<u32> {
    let mut path = vec![rank];
    let mut cur = rank;
    while let Some(p) = parent_of(cur, k) {
        path.push(p);
        cur = p;
    }
    path.reverse();
    path
}
