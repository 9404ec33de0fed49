//! Boundary tracing of a connected pixel region.
//!
//! The region boundary is assembled from unit cell edges oriented with the
//! region on their left (counter-clockwise once the row axis is flipped to
//! point north). Where two region pixels touch only at a corner the walk
//! turns right, so the outer ring visits such a corner once and stays
//! simple. Holes are not traced: the outline is the filled outer ring.

use std::collections::{HashMap, HashSet};

/// A pixel corner as `(col, row)`.
pub type Corner = (i64, i64);

/// Outer ring of the region formed by `pixels` (`(row, col)` pairs).
///
/// The ring is closed (first corner repeated at the end) and has collinear
/// corners removed. Returns an empty vector for an empty region.
pub fn trace_outline(pixels: &[(usize, usize)]) -> Vec<Corner> {
    let Some(&(r0, c0)) = pixels.iter().min() else {
        return Vec::new();
    };
    let members: HashSet<(i64, i64)> = pixels
        .iter()
        .map(|&(r, c)| (r as i64, c as i64))
        .collect();
    let inside = |r: i64, c: i64| members.contains(&(r, c));

    let mut outgoing: HashMap<Corner, Vec<Corner>> = HashMap::new();
    let mut push = |from: Corner, to: Corner| outgoing.entry(from).or_default().push(to);
    for &(r, c) in &members {
        if !inside(r + 1, c) {
            push((c, r + 1), (c + 1, r + 1));
        }
        if !inside(r, c + 1) {
            push((c + 1, r + 1), (c + 1, r));
        }
        if !inside(r - 1, c) {
            push((c + 1, r), (c, r));
        }
        if !inside(r, c - 1) {
            push((c, r), (c, r + 1));
        }
    }

    // the top edge of the first pixel in scan order faces the exterior
    let (r0, c0) = (r0 as i64, c0 as i64);
    let start = (c0 + 1, r0);
    let mut ring = vec![start];
    let mut prev = start;
    let mut cur = (c0, r0);
    if let Some(outs) = outgoing.get_mut(&start) {
        outs.retain(|&to| to != cur);
    }
    while cur != start {
        ring.push(cur);
        let Some(outs) = outgoing.get_mut(&cur).filter(|o| !o.is_empty()) else {
            break;
        };
        let heading = (cur.0 - prev.0, cur.1 - prev.1);
        let right = (-heading.1, heading.0);
        let pick = outs
            .iter()
            .position(|&to| (to.0 - cur.0, to.1 - cur.1) == right)
            .unwrap_or(0);
        let next = outs.swap_remove(pick);
        prev = cur;
        cur = next;
    }
    ring.push(start);
    simplify_collinear(ring)
}

/// Drop corners where the walk goes straight on. Expects a closed ring.
fn simplify_collinear(ring: Vec<Corner>) -> Vec<Corner> {
    if ring.len() < 4 {
        return ring;
    }
    let open = &ring[..ring.len() - 1];
    let n = open.len();
    let mut out: Vec<Corner> = Vec::with_capacity(n + 1);
    for i in 0..n {
        let a = open[(i + n - 1) % n];
        let b = open[i];
        let c = open[(i + 1) % n];
        let cross = (b.0 - a.0) * (c.1 - b.1) - (b.1 - a.1) * (c.0 - b.0);
        if cross != 0 {
            out.push(b);
        }
    }
    if let Some(&first) = out.first() {
        out.push(first);
    }
    out
}

/// Shoelace area of a closed ring in squared pixel units (sign follows the
/// `(col, row)` orientation).
pub fn ring_area(ring: &[Corner]) -> f64 {
    ring.windows(2)
        .map(|w| (w[0].0 * w[1].1 - w[1].0 * w[0].1) as f64)
        .sum::<f64>()
        / 2.0
}
