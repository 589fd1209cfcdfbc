//! Per-repository file records and the file-set store.
//!
//! The file-set keeps one view per node (our own included): a map from
//! repository-relative name to the newest [`FileRecord`] that node has
//! reported. The *global* record for a name is the supremum across all
//! views under the supersession order; the *local* record is the entry
//! in our own view. Records are replaced, never mutated in place.
//!
//! Supersession: strictly greater `version` wins; equal versions are
//! won by the node whose ID renders lexicographically lower. This is a
//! total order, so every node picks the same winner regardless of the
//! order index updates arrive in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Fixed block size; only the final block of a file may be shorter.
pub const BLOCK_SIZE: u32 = 128 * 1024;

/// Record flag bits. The low 12 bits hold unix permission bits.
pub mod flags {
    pub const PERM_MASK: u32 = 0o7777;
    pub const DIRECTORY: u32 = 1 << 12;
    pub const SYMLINK: u32 = 1 << 13;
    pub const DELETED: u32 = 1 << 14;
}

/// One content block: `size` bytes at `offset`, identified by SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: u32,
    pub hash: [u8; 32],
}

/// Metadata and block list for one entry at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Repository-relative path, forward-slash separated.
    pub name: String,
    pub flags: u32,
    /// Seconds since the epoch.
    pub modified: i64,
    /// Originator-owned change counter; see module docs for ordering.
    pub version: u64,
    /// Receive sequence per (repository, source node). Reassigned by
    /// every receiver; only meaningful locally.
    pub local_version: u64,
    /// Empty for directories and deleted entries.
    pub blocks: Vec<BlockInfo>,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.flags & flags::DELETED != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & flags::DIRECTORY != 0
    }

    pub fn is_symlink(&self) -> bool {
        self.flags & flags::SYMLINK != 0
    }

    pub fn permissions(&self) -> u32 {
        self.flags & flags::PERM_MASK
    }

    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size as u64).sum()
    }

    /// Content equality: flags, size, and block hash sequence. The
    /// modification time is deliberately excluded — a pure mtime
    /// change must not bump `version`.
    pub fn content_eq(&self, other: &FileRecord) -> bool {
        self.flags == other.flags
            && self.blocks.len() == other.blocks.len()
            && self
                .blocks
                .iter()
                .zip(&other.blocks)
                .all(|(a, b)| a.size == b.size && a.hash == b.hash)
    }
}

/// True if record `a` (reported by `a_node`) supersedes `b` (reported
/// by `b_node`).
pub fn supersedes(a: &FileRecord, a_node: &NodeId, b: &FileRecord, b_node: &NodeId) -> bool {
    a.version > b.version || (a.version == b.version && a_node < b_node)
}

/// Outcome of merging a scanned record into the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalUpdate {
    /// Content changed; version bumped, update should fan out.
    Changed,
    /// Only the modification time moved; record refreshed in place,
    /// no version bump, nothing to announce.
    MtimeOnly,
    /// Identical to what we already hold.
    Unchanged,
}

/// Per-repository store of per-node views.
pub struct FileSet {
    self_id: NodeId,
    /// node → (name → newest record reported by that node).
    views: HashMap<NodeId, HashMap<String, FileRecord>>,
    /// Receive sequence counters, one per source node (self included).
    next_local: HashMap<NodeId, u64>,
}

impl FileSet {
    pub fn new(self_id: NodeId) -> Self {
        let mut views = HashMap::new();
        views.insert(self_id, HashMap::new());
        FileSet {
            self_id,
            views,
            next_local: HashMap::new(),
        }
    }

    fn next_local_version(&mut self, node: NodeId) -> u64 {
        let counter = self.next_local.entry(node).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Seed the local view from a persisted index snapshot. Must run
    /// before any merge so receive counters resume past the snapshot.
    pub fn seed_local(&mut self, records: Vec<FileRecord>) {
        let max = records.iter().map(|r| r.local_version).max().unwrap_or(0);
        self.next_local.insert(self.self_id, max);
        let view = self.views.entry(self.self_id).or_default();
        for rec in records {
            view.insert(rec.name.clone(), rec);
        }
    }

    /// Merge one scanned record into the local view. `rec.version` and
    /// `rec.local_version` are assigned here; the scanner supplies
    /// content only.
    pub fn update_local(&mut self, mut rec: FileRecord, now_ns: u64) -> LocalUpdate {
        let prev = self
            .views
            .get(&self.self_id)
            .and_then(|v| v.get(&rec.name))
            .cloned();

        if let Some(prev) = &prev {
            if rec.content_eq(prev) {
                if rec.modified == prev.modified {
                    return LocalUpdate::Unchanged;
                }
                // mtime-only: refresh the stamp, keep version and
                // receive sequence so nothing fans out.
                rec.version = prev.version;
                rec.local_version = prev.local_version;
                self.views
                    .get_mut(&self.self_id)
                    .expect("self view exists")
                    .insert(rec.name.clone(), rec);
                return LocalUpdate::MtimeOnly;
            }
        }

        // A fresh local change must supersede everything we know of,
        // even if the wall clock went backwards.
        let floor = self
            .global(&rec.name)
            .map(|(_, g)| g.version)
            .max(prev.as_ref().map(|p| p.version))
            .unwrap_or(0);
        rec.version = now_ns.max(floor + 1);
        rec.local_version = self.next_local_version(self.self_id);
        self.views
            .get_mut(&self.self_id)
            .expect("self view exists")
            .insert(rec.name.clone(), rec);
        LocalUpdate::Changed
    }

    /// Adopt a record pulled from a peer into the local view, keeping
    /// its version so the cluster sees one winner. Returns the stored
    /// record.
    pub fn adopt_local(&mut self, mut rec: FileRecord) -> FileRecord {
        rec.local_version = self.next_local_version(self.self_id);
        self.views
            .get_mut(&self.self_id)
            .expect("self view exists")
            .insert(rec.name.clone(), rec.clone());
        rec
    }

    /// Replace a peer's entire view (initial `Index`).
    pub fn replace_view(&mut self, node: NodeId, records: Vec<FileRecord>) -> Vec<String> {
        self.views.insert(node, HashMap::new());
        self.merge_view(node, records)
    }

    /// Merge incremental records into a peer's view. Records that do
    /// not strictly supersede the entry already held for that node are
    /// dropped, which makes re-applying an update a no-op. Returns the
    /// names whose entry changed.
    pub fn merge_view(&mut self, node: NodeId, records: Vec<FileRecord>) -> Vec<String> {
        let mut touched = Vec::new();
        for mut rec in records {
            let view = self.views.entry(node).or_default();
            match view.get(&rec.name) {
                Some(existing) if rec.version <= existing.version => continue,
                _ => {}
            }
            rec.local_version = self.next_local_version(node);
            let view = self.views.get_mut(&node).expect("view exists");
            touched.push(rec.name.clone());
            view.insert(rec.name.clone(), rec);
        }
        touched
    }

    /// The record in our own view, if any.
    pub fn local(&self, name: &str) -> Option<&FileRecord> {
        self.views.get(&self.self_id).and_then(|v| v.get(name))
    }

    /// Snapshot of our own view.
    pub fn local_records(&self) -> Vec<FileRecord> {
        self.views
            .get(&self.self_id)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Local records whose receive sequence exceeds `watermark`, for
    /// outbound index updates. Sorted by `local_version` so peers see
    /// changes in the order we made them.
    pub fn local_since(&self, watermark: u64) -> Vec<FileRecord> {
        let mut out: Vec<FileRecord> = self
            .views
            .get(&self.self_id)
            .map(|v| {
                v.values()
                    .filter(|r| r.local_version > watermark)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|r| r.local_version);
        out
    }

    pub fn max_local_version(&self) -> u64 {
        self.next_local.get(&self.self_id).copied().unwrap_or(0)
    }

    /// The supremum record for a name across all views, with the node
    /// that reported it.
    pub fn global(&self, name: &str) -> Option<(NodeId, FileRecord)> {
        let mut best: Option<(NodeId, &FileRecord)> = None;
        for (node, view) in &self.views {
            if let Some(rec) = view.get(name) {
                best = match best {
                    Some((bn, br)) if !supersedes(rec, node, br, &bn) => Some((bn, br)),
                    _ => Some((*node, rec)),
                };
            }
        }
        best.map(|(n, r)| (n, r.clone()))
    }

    /// True if the global record for `name` supersedes what we hold.
    /// An equal-version record with identical content is satisfied —
    /// the node-ID tie-break only matters when contents diverge.
    pub fn needs(&self, name: &str) -> Option<FileRecord> {
        let (g_node, g_rec) = self.global(name)?;
        if g_node == self.self_id {
            return None;
        }
        match self.local(name) {
            Some(local) if local.version == g_rec.version && local.content_eq(&g_rec) => None,
            Some(local) if !supersedes(&g_rec, &g_node, local, &self.self_id) => None,
            // Nothing local and the winner is a deletion of something
            // we never had: adopt the record, no disk work.
            _ => Some(g_rec),
        }
    }

    /// Connected-side lookup: peers (never self) whose view holds a
    /// record matching the target's version and content.
    pub fn holders(&self, target: &FileRecord) -> Vec<NodeId> {
        self.views
            .iter()
            .filter(|(node, _)| **node != self.self_id)
            .filter_map(|(node, view)| {
                let rec = view.get(&target.name)?;
                (rec.version == target.version && rec.content_eq(target)).then_some(*node)
            })
            .collect()
    }

    /// All names appearing in any view.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .views
            .values()
            .flat_map(|v| v.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(byte: u8) -> NodeId {
        NodeId::from_der(&[byte])
    }

    fn file(name: &str, hash_seed: u8) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            flags: 0o644,
            modified: 1_000,
            version: 0,
            local_version: 0,
            blocks: vec![BlockInfo {
                offset: 0,
                size: 5,
                hash: [hash_seed; 32],
            }],
        }
    }

    #[test]
    fn supersession_is_total_and_antisymmetric() {
        let (n1, n2) = (node(1), node(2));
        let (lo, hi) = if n1 < n2 { (n1, n2) } else { (n2, n1) };

        let mut a = file("x", 1);
        let mut b = file("x", 2);
        a.version = 2;
        b.version = 1;
        assert!(supersedes(&a, &hi, &b, &lo));
        assert!(!supersedes(&b, &lo, &a, &hi));

        // Equal versions: lexicographically lower node wins.
        b.version = 2;
        assert!(supersedes(&b, &lo, &a, &hi));
        assert!(!supersedes(&a, &hi, &b, &lo));
    }

    #[test]
    fn update_local_bumps_version_on_content_change() {
        let me = node(0);
        let mut set = FileSet::new(me);

        assert_eq!(set.update_local(file("a", 1), 100), LocalUpdate::Changed);
        let v1 = set.local("a").unwrap().version;
        assert!(v1 >= 100);

        // Same content, same mtime: nothing happens.
        assert_eq!(set.update_local(file("a", 1), 200), LocalUpdate::Unchanged);
        assert_eq!(set.local("a").unwrap().version, v1);

        // Same content, newer mtime: refreshed without a bump.
        let mut touched = file("a", 1);
        touched.modified = 2_000;
        assert_eq!(set.update_local(touched, 300), LocalUpdate::MtimeOnly);
        let rec = set.local("a").unwrap();
        assert_eq!(rec.version, v1);
        assert_eq!(rec.modified, 2_000);

        // New content: version strictly increases even with a stale clock.
        assert_eq!(set.update_local(file("a", 9), 0), LocalUpdate::Changed);
        assert!(set.local("a").unwrap().version > v1);
    }

    #[test]
    fn merge_view_is_idempotent() {
        let me = node(0);
        let peer = node(1);
        let mut set = FileSet::new(me);

        let mut rec = file("a", 1);
        rec.version = 10;
        let touched = set.merge_view(peer, vec![rec.clone()]);
        assert_eq!(touched, vec!["a".to_string()]);

        let snapshot = set.global("a");
        let touched = set.merge_view(peer, vec![rec]);
        assert!(touched.is_empty());
        assert_eq!(set.global("a"), snapshot);
    }

    #[test]
    fn global_prefers_higher_version_then_lower_node() {
        let me = node(0);
        let (p1, p2) = (node(1), node(2));
        let (lo, hi) = if p1 < p2 { (p1, p2) } else { (p2, p1) };
        let mut set = FileSet::new(me);

        let mut from_hi = file("a", 1);
        from_hi.version = 5;
        let mut from_lo = file("a", 2);
        from_lo.version = 5;
        set.merge_view(hi, vec![from_hi]);
        set.merge_view(lo, vec![from_lo]);

        let (winner, rec) = set.global("a").unwrap();
        assert_eq!(winner, lo);
        assert_eq!(rec.blocks[0].hash, [2; 32]);
    }

    #[test]
    fn needs_reports_superseding_remote_records() {
        let me = node(0);
        let peer = node(1);
        let mut set = FileSet::new(me);

        set.update_local(file("a", 1), 100);
        assert!(set.needs("a").is_none());

        let local_version = set.local("a").unwrap().version;
        let mut newer = file("a", 2);
        newer.version = local_version + 1;
        set.merge_view(peer, vec![newer]);

        let needed = set.needs("a").unwrap();
        assert_eq!(needed.blocks[0].hash, [2; 32]);
    }

    #[test]
    fn equal_version_equal_content_is_satisfied() {
        let me = node(0);
        let peer = node(1);
        let mut set = FileSet::new(me);

        // Peer reports the same content at the same version we hold
        // (the normal state after it pulls our file). Regardless of
        // which node wins the tie-break, there is nothing to do.
        set.update_local(file("a", 1), 100);
        let mut echo = set.local("a").unwrap().clone();
        echo.local_version = 0;
        set.merge_view(peer, vec![echo]);
        assert!(set.needs("a").is_none());
    }

    #[test]
    fn adopting_a_pull_clears_the_need() {
        let me = node(0);
        let peer = node(1);
        let mut set = FileSet::new(me);

        let mut rec = file("a", 3);
        rec.version = 42;
        set.merge_view(peer, vec![rec.clone()]);
        assert!(set.needs("a").is_some());

        set.adopt_local(rec);
        assert!(set.needs("a").is_none());
    }

    #[test]
    fn holders_match_version_and_content() {
        let me = node(0);
        let (p1, p2) = (node(1), node(2));
        let mut set = FileSet::new(me);

        let mut target = file("a", 7);
        target.version = 3;
        set.merge_view(p1, vec![target.clone()]);

        let mut stale = file("a", 7);
        stale.version = 2;
        set.merge_view(p2, vec![stale]);

        assert_eq!(set.holders(&target), vec![p1]);
    }

    #[test]
    fn record_roundtrips_through_postcard() {
        let rec = file("dir/a.txt", 9);
        let bytes = postcard::to_allocvec(&rec).unwrap();
        let back: FileRecord = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, rec);
    }
}
