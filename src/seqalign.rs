//! Merges different observations of an append-ordered list into a single
//! history of the whole list.
//!
//! The assumption is that observations are always ordered by addition time,
//! and that removal followed by re-addition moves an item back to the top.
//! Some observations only identify the items (export bundles), others
//! identify the item together with its addition event (API captures).

use std::collections::HashMap;

use spdlog::prelude::*;

pub type ItemId = i64;
pub type EventId = i64;

/// One observation of the list at a wall-clock time (unix millis).
#[derive(Clone, Debug)]
pub enum Snapshot {
    /// Ordered item ids, most recent first.
    Items { items: Vec<ItemId>, time: i64 },
    /// (event id, item id) pairs, strictly decreasing by event id.
    Events { seq: Vec<(EventId, ItemId)>, time: i64 },
}

impl Snapshot {
    pub fn time(&self) -> i64 {
        match self {
            Snapshot::Items { time, .. } | Snapshot::Events { time, .. } => *time,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Snapshot::Items { items, .. } => items.is_empty(),
            Snapshot::Events { seq, .. } => seq.is_empty(),
        }
    }
}

// Working-sequence entries are (item, version) where version > 0 is a
// concrete event id and version <= 0 is a per-item placeholder. Placeholders
// count down so that the same item seen in successively older snapshots gets
// successively smaller versions.
type Entry = (ItemId, i64);

struct Aligner {
    recognized: HashMap<Entry, EventId>,
    edges: HashMap<Entry, Vec<Entry>>,
    ver: HashMap<ItemId, i64>,
    seqs: Vec<Vec<Entry>>,
}

impl Aligner {
    fn newver(&mut self, item: ItemId) -> i64 {
        let v = self.ver.get(&item).copied().unwrap_or(0);
        self.ver.insert(item, v - 1);
        v
    }
}

/// Produces one (event id, item id) pair per item ever observed, sorted by
/// descending event id, consistent with the relative order inside every
/// snapshot. `snapshots` must be ordered from most recent to oldest.
///
/// `evid_lower_bound` supplies a monotone lower bound on the event id that
/// could first mention an item; placeholder versions resolve to
/// `max(lower bounds) + 1` in an oldest-to-newest pass.
///
/// With `allow_retcon` disabled, a gap inside an anchor run discards the
/// anchors found so far instead of tolerating the non-contiguous match.
pub fn align<F>(
    snapshots: &[Snapshot],
    evid_lower_bound: Option<F>,
    allow_retcon: bool,
) -> Vec<(EventId, ItemId)>
where
    F: Fn(ItemId) -> EventId,
{
    let mut st = Aligner {
        recognized: HashMap::new(),
        edges: HashMap::new(),
        ver: HashMap::new(),
        seqs: Vec::new(),
    };
    let mut current_seq: Vec<Entry> = Vec::new();

    for snapshot in snapshots {
        let prev_seq = current_seq;
        let index: HashMap<ItemId, (usize, i64)> = prev_seq
            .iter()
            .enumerate()
            .map(|(i, &(item, evid))| (item, (i, evid)))
            .collect();

        current_seq = match snapshot {
            Snapshot::Items { items, .. } if prev_seq.is_empty() => items
                .iter()
                .map(|&item| (item, st.newver(item)))
                .collect(),

            Snapshot::Items { items, .. } => {
                align_items(&mut st, items, &prev_seq, &index, allow_retcon)
            }

            Snapshot::Events { seq, .. } if prev_seq.is_empty() => {
                seq.iter().map(|&(evid, item)| (item, evid)).collect()
            }

            Snapshot::Events { seq, .. } => {
                align_events(&mut st, seq, &prev_seq, &index, allow_retcon)
            }
        };

        st.seqs.push(current_seq.clone());
    }

    resolve(st, evid_lower_bound)
}

/// Anchors an item-only snapshot to the working sequence: the longest
/// in-order run of shared items aligns the two, items above the first anchor
/// are new on top, the working sequence's tail below the last anchor is kept.
fn align_items(
    st: &mut Aligner,
    items: &[ItemId],
    prev_seq: &[Entry],
    index: &HashMap<ItemId, (usize, i64)>,
    allow_retcon: bool,
) -> Vec<Entry> {
    let mut matching: Vec<usize> = Vec::new();
    let mut ri: Option<usize> = None;
    for (j, item) in items.iter().enumerate() {
        if let Some(&(i, _)) = index.get(item) {
            if let Some(r) = ri {
                if i < r {
                    continue;
                } else if r + 1 < i && !allow_retcon {
                    matching.clear();
                }
            }
            matching.push(j);
            ri = Some(i);
        }
    }

    // `matching` is built in increasing j order, so membership is a binary
    // search even for the tens-of-thousands-entry like lists of old exports.
    let mut seq: Vec<Entry> = Vec::with_capacity(items.len());
    for (j, &item) in items.iter().enumerate() {
        let evid = index.get(&item).map(|&(_, e)| e).unwrap_or(0);
        if evid <= 0 && matching.binary_search(&j).is_err() {
            seq.push((item, st.newver(item)));
        } else {
            seq.push((item, evid));
        }
    }

    if matching.first() != Some(&0) {
        let fi = match matching.first() {
            Some(&j) => index[&items[j]].0,
            None => {
                // Nothing anchors: the whole snapshot goes below, ordered
                // against the old bottom only through the recorded edge.
                ri = Some(prev_seq.len());
                prev_seq.len()
            }
        };
        if fi > 0 {
            st.edges
                .entry(prev_seq[fi - 1])
                .or_default()
                .push(seq[0]);
        }
    }

    let ri = ri.expect("item snapshot matched nothing and recorded no bottom anchor");
    seq.extend_from_slice(prev_seq.get(ri + 1..).unwrap_or(&[]));
    seq
}

/// Same anchoring for an event-tagged snapshot. Matched placeholders are
/// recognized as the concrete event id; with no anchor at all, the snapshot
/// splices above or below the working sequence depending on how its event-id
/// range compares to the concrete ids already present.
fn align_events(
    st: &mut Aligner,
    snap: &[(EventId, ItemId)],
    prev_seq: &[Entry],
    index: &HashMap<ItemId, (usize, i64)>,
    allow_retcon: bool,
) -> Vec<Entry> {
    if snap.is_empty() {
        return prev_seq.to_vec();
    }
    let mut seq: Vec<Entry> = snap.iter().map(|&(evid, item)| (item, evid)).collect();
    debug_assert!(
        seq.windows(2).all(|w| w[0].1 > w[1].1),
        "event snapshot not strictly decreasing"
    );

    let mut matching: Vec<usize> = Vec::new();
    let mut fi: Option<usize> = None;
    let mut ri: Option<usize> = None;
    for (j, &(_evid, item)) in snap.iter().enumerate() {
        let Some(&(i, _)) = index.get(&item) else {
            continue;
        };
        if fi.is_none() {
            fi = Some(i);
        }
        if let Some(r) = ri {
            if i < r {
                continue;
            } else if i > r + 1 && !allow_retcon {
                warn!("event snapshot anchors with a gap at {item}, restarting the anchor run");
                fi = Some(i);
                matching.clear();
            }
        }
        ri = Some(i);
        matching.push(j);
    }

    for (j, &(evid, item)) in snap.iter().enumerate() {
        let revid = index.get(&item).map(|&(_, e)| e).unwrap_or(1);
        if revid <= 0 && matching.binary_search(&j).is_ok() {
            st.recognized.insert((item, revid), evid);
        }
    }

    // Splice bounds into prev_seq; tail may become -1 for "insert above".
    let mut fi: Option<usize> = fi;
    let mut tail: Option<isize> = ri.map(|r| r as isize);

    if matching.is_empty() {
        let top = snap[0].0;
        if prev_seq.iter().any(|&(_, pevid)| pevid > top) {
            fi = Some(prev_seq.len());
            tail = Some(prev_seq.len() as isize - 1);
        } else {
            fi = Some(0);
            tail = Some(-1);
        }
    }

    if matching.first() != Some(&0) {
        if let Some(&j) = matching.first() {
            debug_assert_eq!(fi, Some(index[&snap[j].1].0));
        }
        if let Some(f) = fi.filter(|&f| f > 0) {
            st.edges
                .entry(prev_seq[f - 1])
                .or_default()
                .push((snap[0].1, snap[0].0));
        }
    }

    let (f, t) = (fi.unwrap_or(0), tail.unwrap_or(-1));
    let tail_start = (t + 1) as usize;
    let mut spliced = prev_seq[..f.min(prev_seq.len())].to_vec();
    spliced.append(&mut seq);
    spliced.extend_from_slice(prev_seq.get(tail_start..).unwrap_or(&[]));
    spliced
}

/// Oldest-to-newest pass that promotes placeholder versions to concrete
/// event ids, then reports the latest resolved event per item.
fn resolve<F>(st: Aligner, evid_lower_bound: Option<F>) -> Vec<(EventId, ItemId)>
where
    F: Fn(ItemId) -> EventId,
{
    let Aligner {
        mut recognized,
        edges,
        seqs,
        ..
    } = st;

    let mut pevid: Option<EventId> = Some(0);
    for seq in seqs.iter().rev() {
        for &(item, ver) in seq.iter().rev() {
            let mut evid = ver;
            if evid <= 0 {
                evid = recognized.get(&(item, ver)).copied().unwrap_or(evid);
            }
            if evid <= 0 {
                let mut bounds: Vec<EventId> = Vec::new();
                if let Some(p) = pevid {
                    bounds.push(p);
                }
                if let Some(&r) = recognized.get(&(item, evid - 1)) {
                    bounds.push(r);
                }
                for &(xitem, xver) in edges.get(&(item, evid)).into_iter().flatten() {
                    let mut xevid = xver;
                    if xevid <= 0 {
                        xevid = recognized.get(&(xitem, xver)).copied().unwrap_or(xevid);
                    }
                    if xevid <= 0 {
                        warn!("edge target {xitem} still unresolved, dropping the bound");
                    } else {
                        bounds.push(xevid);
                    }
                }
                if let Some(f) = &evid_lower_bound {
                    bounds.push(f(item));
                }
                if let Some(&max) = bounds.iter().max() {
                    let next = max + 1;
                    recognized.insert((item, evid), next);
                    pevid = Some(next);
                }
            } else {
                pevid = Some(evid);
            }
        }
        pevid = None;
    }

    // The latest resolved event id per item wins.
    let mut evmap: HashMap<ItemId, EventId> = HashMap::new();
    let mut order: Vec<ItemId> = Vec::new();
    for seq in seqs.iter().rev() {
        for &(item, ver) in seq {
            let mut evid = ver;
            if evid <= 0 {
                evid = recognized.get(&(item, ver)).copied().unwrap_or(evid);
            }
            if evid <= 0 {
                warn!("item {item} never resolved to an event id, skipping");
                continue;
            }
            if evmap.insert(item, evid).is_none() {
                order.push(item);
            }
        }
    }

    let mut items: Vec<(EventId, ItemId)> = order
        .into_iter()
        .map(|item| (evmap[&item], item))
        .collect();
    items.sort_by_key(|&(evid, item)| (std::cmp::Reverse(evid), item));
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(ids: &str, time: i64) -> Snapshot {
        Snapshot::Items {
            items: ids.bytes().map(|b| b as i64).collect(),
            time,
        }
    }

    fn events(seq: &[(EventId, char)], time: i64) -> Snapshot {
        Snapshot::Events {
            seq: seq.iter().map(|&(e, c)| (e, c as i64)).collect(),
            time,
        }
    }

    fn named(result: Vec<(EventId, ItemId)>) -> Vec<(EventId, char)> {
        result
            .into_iter()
            .map(|(e, i)| (e, u8::try_from(i).unwrap() as char))
            .collect()
    }

    const NO_BOUND: Option<fn(ItemId) -> EventId> = None;

    #[test]
    fn three_item_snapshots() {
        let r = align(
            &[items("ECBD", 3), items("CB", 2), items("DCBA", 1)],
            NO_BOUND,
            true,
        );
        assert_eq!(
            named(r),
            vec![(7, 'E'), (6, 'C'), (5, 'B'), (4, 'D'), (1, 'A')]
        );
    }

    #[test]
    fn items_then_events() {
        let r = align(
            &[items("ECBA", 2), events(&[(80, 'D'), (70, 'C')], 1)],
            NO_BOUND,
            true,
        );
        assert_eq!(
            named(r),
            vec![(81, 'E'), (80, 'D'), (70, 'C'), (2, 'B'), (1, 'A')]
        );
    }

    #[test]
    fn no_retcon_restarts_anchor_run() {
        let r = align(&[items("ECBA", 2), items("DCA", 1)], NO_BOUND, false);
        assert_eq!(
            named(r),
            vec![(6, 'E'), (5, 'C'), (4, 'B'), (3, 'D'), (1, 'A')]
        );
    }

    #[test]
    fn single_snapshot_counts_down_from_top() {
        let r = align(&[items("CBA", 1)], NO_BOUND, true);
        assert_eq!(named(r), vec![(3, 'C'), (2, 'B'), (1, 'A')]);
    }

    #[test]
    fn readdition_moves_to_top() {
        // A was re-added after the older snapshot saw it at the bottom.
        let r = align(&[items("ACB", 2), items("CBA", 1)], NO_BOUND, true);
        let r = named(r);
        let pos = |c| r.iter().position(|&(_, x)| x == c).unwrap();
        assert_eq!(r.len(), 3);
        assert!(pos('A') < pos('C'));
        assert!(pos('C') < pos('B'));
    }

    #[test]
    fn events_respected_verbatim() {
        let r = align(
            &[events(&[(90, 'C'), (75, 'B'), (60, 'A')], 1)],
            NO_BOUND,
            true,
        );
        assert_eq!(named(r), vec![(90, 'C'), (75, 'B'), (60, 'A')]);
    }

    #[test]
    fn external_lower_bound_lifts_synthesized_ids() {
        let bound = |item: ItemId| item * 100;
        let r = align(&[items("CBA", 1)], Some(bound), true);
        let r = named(r);
        // Every synthesized id clears the per-item floor.
        for &(evid, c) in &r {
            assert!(evid > (c as i64) * 100);
        }
        let pos = |c| r.iter().position(|&(_, x)| x == c).unwrap();
        assert!(pos('C') < pos('B'));
        assert!(pos('B') < pos('A'));
    }

    #[test]
    fn completeness_across_disjoint_snapshots() {
        let r = align(&[items("FE", 3), items("DC", 2), items("BA", 1)], NO_BOUND, true);
        let r = named(r);
        assert_eq!(r.len(), 6);
        for c in "ABCDEF".chars() {
            assert!(r.iter().any(|&(_, x)| x == c), "{c} missing");
        }
    }
}
