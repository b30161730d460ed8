//! Per-node memoization of the `Effect` queries a render pass consults
//! repeatedly: region of definition, identity, and time domain. One
//! `ActionCache` belongs to exactly one node and is bound to that node's
//! current hash; a hash change invalidates everything it holds.

use std::collections::HashMap;
use std::sync::Mutex;

use model::{CanonicalRect, MipmapLevel};
use render_protocol::{FrameRange, IdentityVerdict, Time, ViewId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ActionKey {
    time: Time,
    view: ViewId,
    mip: MipmapLevel,
}

struct Inner {
    node_hash: u64,
    rod: HashMap<ActionKey, CanonicalRect>,
    identity: HashMap<ActionKey, IdentityVerdict>,
    time_domain: Option<FrameRange>,
    rod_overwrite_attempts: u64,
}

/// Memoizes one node's answers to `region_of_definition`, `is_identity`, and
/// `time_domain` for the duration of the node's current hash. Region of
/// definition is first-write-wins within a hash: two render threads racing to
/// compute the same node's RoD at the same coordinates must agree, so a
/// disagreeing overwrite is a bug, not a cache-coherence event, and is
/// diagnosed rather than applied.
pub struct ActionCache {
    inner: Mutex<Inner>,
}

impl ActionCache {
    pub fn new(node_hash: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                node_hash,
                rod: HashMap::new(),
                identity: HashMap::new(),
                time_domain: None,
                rod_overwrite_attempts: 0,
            }),
        }
    }

    pub fn node_hash(&self) -> u64 {
        self.inner.lock().expect("action cache mutex poisoned").node_hash
    }

    pub fn get_rod(&self, time: Time, view: ViewId, mip: MipmapLevel) -> Option<CanonicalRect> {
        let key = ActionKey { time, view, mip };
        self.inner
            .lock()
            .expect("action cache mutex poisoned")
            .rod
            .get(&key)
            .copied()
    }

    /// Records the region of definition for `(time, view, mip)`. If an entry
    /// already exists and disagrees with `rod`, the existing entry is kept and
    /// the attempt is counted in `diagnostics()` rather than applied.
    pub fn set_rod(&self, time: Time, view: ViewId, mip: MipmapLevel, rod: CanonicalRect) {
        let key = ActionKey { time, view, mip };
        let mut inner = self.inner.lock().expect("action cache mutex poisoned");
        match inner.rod.get(&key) {
            None => {
                inner.rod.insert(key, rod);
            }
            Some(existing) if *existing == rod => {}
            Some(existing) => {
                let existing = *existing;
                inner.rod_overwrite_attempts += 1;
                tracing::warn!(
                    node_hash = inner.node_hash,
                    ?existing,
                    attempted = ?rod,
                    "region-of-definition cache disagreement, keeping first write",
                );
            }
        }
    }

    pub fn get_identity(
        &self,
        time: Time,
        view: ViewId,
        mip: MipmapLevel,
    ) -> Option<IdentityVerdict> {
        let key = ActionKey { time, view, mip };
        self.inner
            .lock()
            .expect("action cache mutex poisoned")
            .identity
            .get(&key)
            .copied()
    }

    /// Records the identity verdict for `(time, view, mip)`. Unlike RoD,
    /// overwrites are permitted: identity can legitimately be recomputed (e.g.
    /// once render scale support is known) without disagreement being a bug.
    pub fn set_identity(&self, time: Time, view: ViewId, mip: MipmapLevel, verdict: IdentityVerdict) {
        let key = ActionKey { time, view, mip };
        self.inner
            .lock()
            .expect("action cache mutex poisoned")
            .identity
            .insert(key, verdict);
    }

    pub fn get_time_domain(&self) -> Option<FrameRange> {
        self.inner.lock().expect("action cache mutex poisoned").time_domain
    }

    pub fn set_time_domain(&self, domain: FrameRange) {
        self.inner.lock().expect("action cache mutex poisoned").time_domain = Some(domain);
    }

    /// Drops every memoized answer and rebinds the cache to `new_hash`. Called
    /// when the node's parameters change under it.
    pub fn invalidate_all(&self, new_hash: u64) {
        let mut inner = self.inner.lock().expect("action cache mutex poisoned");
        inner.node_hash = new_hash;
        inner.rod.clear();
        inner.identity.clear();
        inner.time_domain = None;
    }

    /// Count of `set_rod` calls that disagreed with an existing entry and were
    /// ignored. Non-zero means a node's RoD computation is not deterministic
    /// for fixed inputs.
    pub fn diagnostics(&self) -> u64 {
        self.inner
            .lock()
            .expect("action cache mutex poisoned")
            .rod_overwrite_attempts
    }
}
