//! Candidate URI bookkeeping.

use std::collections::HashSet;

use url::Url;

/// Result of asking the pool for the next URI to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextUri {
    /// Try this URI next.
    Candidate(Url),
    /// Every candidate has failed in the current pass.
    AllFailed,
    /// There is nothing to connect to at all.
    Empty,
}

/// Ordered candidate lists plus per-pass failure marks.
///
/// Three lists feed the candidate set: the configured `uris`, the `updated`
/// list pushed by the broker (which replaces `uris` while non-empty), and the
/// `priority` list, whose entries are always tried first.
#[derive(Debug, Clone, Default)]
pub struct UriPool {
    uris: Vec<Url>,
    updated: Vec<Url>,
    priority: Vec<Url>,
    failed: HashSet<Url>,
    pending_removal: Vec<Url>,
    connected: Option<Url>,
    reconnect_target: Option<Url>,
    randomize: bool,
    priority_backup: bool,
}

impl UriPool {
    /// Creates a pool over the configured URIs.
    pub fn new(uris: Vec<Url>, priority: Vec<Url>, randomize: bool, priority_backup: bool) -> Self {
        let mut pool = Self {
            randomize,
            priority_backup,
            ..Self::default()
        };
        for uri in uris {
            pool.add(false, uri);
        }
        for uri in priority {
            pool.add(true, uri);
        }
        pool
    }

    /// Adds `uri` unless an equal URI is already present.
    pub fn add(&mut self, is_priority: bool, uri: Url) -> bool {
        let list = if is_priority {
            &mut self.priority
        } else {
            &mut self.uris
        };
        if list.contains(&uri) {
            return false;
        }
        list.push(uri);
        true
    }

    /// Removes `uris` from the selected list.
    ///
    /// The connected URI is only removed immediately when `reconnect` is set;
    /// otherwise its removal waits for the next disconnect. Returns `true` when
    /// the connected URI was removed and the caller should reconnect.
    pub fn remove(&mut self, is_priority: bool, uris: &[Url], reconnect: bool) -> bool {
        let mut dropped_connected = false;
        for uri in uris {
            if self.connected.as_ref() == Some(uri) {
                if reconnect {
                    dropped_connected = true;
                } else {
                    if !self.pending_removal.contains(uri) {
                        self.pending_removal.push(uri.clone());
                    }
                    continue;
                }
            }
            let list = if is_priority {
                &mut self.priority
            } else {
                &mut self.uris
            };
            list.retain(|u| u != uri);
            self.updated.retain(|u| u != uri);
            self.failed.remove(uri);
        }
        dropped_connected
    }

    /// Applies removals that were deferred while their URI was connected.
    pub fn apply_pending_removals(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending_removal);
        for uri in &pending {
            self.uris.retain(|u| u != uri);
            self.priority.retain(|u| u != uri);
            self.updated.retain(|u| u != uri);
        }
        pending.len()
    }

    /// Replaces the broker-supplied list.
    pub fn update_uris(&mut self, uris: Vec<Url>) {
        self.updated.clear();
        for uri in uris {
            if !self.updated.contains(&uri) {
                self.updated.push(uri);
            }
        }
    }

    /// Prefers `uri` on the next selection, adding it as a candidate if needed.
    pub fn set_reconnect_target(&mut self, uri: Url) {
        if !self.candidates().contains(&uri) {
            self.add(false, uri.clone());
        }
        self.failed.remove(&uri);
        self.reconnect_target = Some(uri);
    }

    /// The URI the next selection will prefer, if one was requested.
    pub fn reconnect_target(&self) -> Option<&Url> {
        self.reconnect_target.as_ref()
    }

    /// Drops a pending reconnect target.
    pub fn clear_reconnect_target(&mut self) {
        self.reconnect_target = None;
    }

    /// The candidate list in preference order: priority entries first.
    pub fn candidates(&self) -> Vec<Url> {
        let base = if self.updated.is_empty() {
            &self.uris
        } else {
            &self.updated
        };
        let mut out: Vec<Url> = self.priority.clone();
        for uri in base {
            if !out.contains(uri) {
                out.push(uri.clone());
            }
        }
        out
    }

    /// Whether `uri` is a priority URI.
    ///
    /// Without explicit priority URIs, `priorityBackup` makes the first
    /// configured URI the priority one.
    pub fn is_priority(&self, uri: &Url) -> bool {
        if self.priority.is_empty() {
            self.priority_backup && self.uris.first() == Some(uri)
        } else {
            self.priority.contains(uri)
        }
    }

    /// Picks the next URI to try in the current pass.
    ///
    /// Order: an explicit reconnect target, then untried priority URIs, then
    /// the remaining untried URIs (first in order, or uniformly at random).
    pub fn get_next(&mut self) -> NextUri {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return NextUri::Empty;
        }

        if let Some(target) = self.reconnect_target.take() {
            if !self.failed.contains(&target) {
                return NextUri::Candidate(target);
            }
        }

        let (priority, ordinary): (Vec<Url>, Vec<Url>) = candidates
            .into_iter()
            .filter(|uri| !self.failed.contains(uri))
            .partition(|uri| self.is_priority(uri));

        let pool = if priority.is_empty() { ordinary } else { priority };
        if pool.is_empty() {
            return NextUri::AllFailed;
        }
        let index = if self.randomize {
            fastrand::usize(..pool.len())
        } else {
            0
        };
        pool.into_iter()
            .nth(index)
            .map_or(NextUri::AllFailed, NextUri::Candidate)
    }

    /// Marks `uri` as failed for the rest of the current pass.
    pub fn mark_failed(&mut self, uri: &Url) {
        self.failed.insert(uri.clone());
    }

    /// Clears all failure marks, starting a new pass.
    pub fn reset_failure_marks(&mut self) {
        self.failed.clear();
    }

    /// Records the URI currently in use.
    pub fn set_connected(&mut self, uri: Option<Url>) {
        self.connected = uri;
    }

    /// The URI currently in use, if any.
    pub fn connected(&self) -> Option<&Url> {
        self.connected.as_ref()
    }

    /// Whether the connected URI is the first candidate (used for rebalancing).
    pub fn connected_is_preferred(&self) -> bool {
        match &self.connected {
            Some(uri) => self.candidates().first() == Some(uri),
            None => false,
        }
    }

    /// URIs that are candidates but not in `exclude`, in preference order.
    pub fn candidates_excluding(&self, exclude: &[Url]) -> Vec<Url> {
        self.candidates()
            .into_iter()
            .filter(|uri| !exclude.contains(uri) && self.connected.as_ref() != Some(uri))
            .collect()
    }

    /// Number of distinct candidates.
    pub fn len(&self) -> usize {
        self.candidates().len()
    }

    /// Returns `true` if there are no candidates.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
