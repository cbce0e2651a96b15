// Copyright 2025 rbgp Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::log::{debug, info};
use crate::net::Ipv4Net;
use crate::rib::path::rank_paths;
use crate::rib::{DecisionConfig, Path, Route};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

/// Loc-RIB: every candidate path per prefix, best first.
///
/// The first path of each route is the selected best path. A prefix with
/// no candidate has no entry.
#[derive(Debug, Default)]
pub struct LocRib {
    routes: HashMap<Ipv4Net, Route>,
    decision: DecisionConfig,
}

/// Insert or replace the path from the same source, then re-rank.
/// A path with unchanged attributes keeps the existing allocation.
fn upsert_path(
    table: &mut HashMap<Ipv4Net, Route>,
    prefix: Ipv4Net,
    path: Arc<Path>,
    decision: &DecisionConfig,
) {
    let route = table.entry(prefix).or_insert_with(|| Route {
        prefix,
        paths: vec![],
    });

    match route
        .paths
        .iter_mut()
        .find(|p| p.attrs.source == path.attrs.source)
    {
        Some(existing) => {
            if **existing != *path {
                *existing = path;
            }
        }
        None => route.paths.push(path),
    }

    route.paths = rank_paths(std::mem::take(&mut route.paths), decision);
}

/// Remove paths matching a predicate, then re-rank what is left.
/// Returns true if any were removed.
fn remove_paths<F: Fn(&Path) -> bool>(
    table: &mut HashMap<Ipv4Net, Route>,
    prefix: &Ipv4Net,
    decision: &DecisionConfig,
    should_remove: F,
) -> bool {
    let Some(route) = table.get_mut(prefix) else {
        return false;
    };
    let before = route.paths.len();
    route.paths.retain(|p| !should_remove(p));
    let removed = route.paths.len() != before;

    if route.paths.is_empty() {
        table.remove(prefix);
    } else if removed {
        route.paths = rank_paths(std::mem::take(&mut route.paths), decision);
    }
    removed
}

impl LocRib {
    pub fn new(decision: DecisionConfig) -> Self {
        LocRib {
            routes: HashMap::new(),
            decision,
        }
    }

    /// Apply one UPDATE worth of changes from a peer.
    /// Returns the prefixes whose best path changed.
    pub fn apply_peer_update(
        &mut self,
        peer_ip: IpAddr,
        withdrawn: &[Ipv4Net],
        announced: &[(Ipv4Net, Arc<Path>)],
    ) -> Vec<Ipv4Net> {
        // Snapshot old best BEFORE mutations
        let affected: BTreeSet<Ipv4Net> = withdrawn
            .iter()
            .copied()
            .chain(announced.iter().map(|(prefix, _)| *prefix))
            .collect();
        let old_best = self.snapshot_best(affected.iter());

        for prefix in withdrawn {
            if remove_paths(&mut self.routes, prefix, &self.decision, |p| p.source().is_from(peer_ip)) {
                debug!(%prefix, %peer_ip, "withdrew route from Loc-RIB");
            }
        }

        for (prefix, path) in announced {
            debug!(%prefix, %peer_ip, "adding route to Loc-RIB");
            upsert_path(&mut self.routes, *prefix, Arc::clone(path), &self.decision);
        }

        self.best_changed(affected, &old_best)
    }

    /// Add a locally originated route. Returns true if the best path changed.
    pub fn add_local_route(&mut self, prefix: Ipv4Net, path: Arc<Path>) -> bool {
        info!(%prefix, "adding local route to Loc-RIB");
        let old_best = self.snapshot_best([prefix].iter());
        upsert_path(&mut self.routes, prefix, path, &self.decision);
        !self.best_changed([prefix], &old_best).is_empty()
    }

    /// Remove a locally originated route. Returns None if there was none,
    /// otherwise whether the best path changed.
    pub fn remove_local_route(&mut self, prefix: Ipv4Net) -> Option<bool> {
        let old_best = self.snapshot_best([prefix].iter());
        if !remove_paths(&mut self.routes, &prefix, &self.decision, |p| p.source().is_local()) {
            return None;
        }
        info!(%prefix, "removed local route from Loc-RIB");
        Some(!self.best_changed([prefix], &old_best).is_empty())
    }

    /// Remove every path learned from `peer_ip` (implicit withdrawal).
    /// Returns the prefixes whose best path changed.
    pub fn remove_routes_from_peer(&mut self, peer_ip: IpAddr) -> Vec<Ipv4Net> {
        let affected: BTreeSet<Ipv4Net> = self
            .routes
            .values()
            .filter(|route| route.paths.iter().any(|p| p.source().is_from(peer_ip)))
            .map(|route| route.prefix)
            .collect();
        let old_best = self.snapshot_best(affected.iter());

        for prefix in &affected {
            remove_paths(&mut self.routes, prefix, &self.decision, |p| p.source().is_from(peer_ip));
        }
        if !affected.is_empty() {
            info!(%peer_ip, count = affected.len(), "removed peer routes from Loc-RIB");
        }

        self.best_changed(affected, &old_best)
    }

    fn snapshot_best<'a>(
        &self,
        prefixes: impl Iterator<Item = &'a Ipv4Net>,
    ) -> HashMap<Ipv4Net, Arc<Path>> {
        prefixes
            .filter_map(|p| self.get_best_path(p).map(|best| (*p, Arc::clone(best))))
            .collect()
    }

    fn best_changed(
        &self,
        prefixes: impl IntoIterator<Item = Ipv4Net>,
        old_best: &HashMap<Ipv4Net, Arc<Path>>,
    ) -> Vec<Ipv4Net> {
        prefixes
            .into_iter()
            .filter(|p| self.best_path_changed(p, old_best.get(p)))
            .collect()
    }

    /// Returns true if the best path for a prefix differs from the old snapshot.
    fn best_path_changed(&self, prefix: &Ipv4Net, old: Option<&Arc<Path>>) -> bool {
        match (old, self.get_best_path(prefix)) {
            (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
            (None, None) => false,
            _ => true,
        }
    }

    pub fn get_best_path(&self, prefix: &Ipv4Net) -> Option<&Arc<Path>> {
        self.routes.get(prefix).and_then(|r| r.best())
    }

    pub fn routes_len(&self) -> usize {
        self.routes.len()
    }

    pub fn get_all_routes(&self) -> Vec<Route> {
        self.routes.values().cloned().collect()
    }

    /// Iterate (prefix, best path) pairs.
    pub fn iter_best(&self) -> impl Iterator<Item = (Ipv4Net, &Arc<Path>)> {
        self.routes
            .values()
            .filter_map(|route| route.best().map(|best| (route.prefix, best)))
    }
}
