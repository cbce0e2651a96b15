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

use crate::net::Ipv4Net;
use crate::rib::{Path, Route};
use std::collections::HashMap;
use std::sync::Arc;

/// Adj-RIB-Out: routes last advertised to one peer, with export
/// attributes already applied.
#[derive(Debug, Default)]
pub struct AdjRibOut {
    routes: HashMap<Ipv4Net, Arc<Path>>,
}

impl AdjRibOut {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Record `path` as advertised for `prefix`.
    /// Returns false if the same attributes were already advertised.
    pub fn insert(&mut self, prefix: Ipv4Net, path: Arc<Path>) -> bool {
        match self.routes.get(&prefix) {
            Some(existing) if existing.attrs == path.attrs => false,
            _ => {
                self.routes.insert(prefix, path);
                true
            }
        }
    }

    /// Returns true if something was advertised for the prefix.
    pub fn remove_prefix(&mut self, prefix: &Ipv4Net) -> bool {
        self.routes.remove(prefix).is_some()
    }

    pub fn prefixes(&self) -> Vec<Ipv4Net> {
        self.routes.keys().copied().collect()
    }

    pub fn prefix_count(&self) -> usize {
        self.routes.len()
    }

    /// Forget everything (session down or route refresh).
    pub fn clear(&mut self) {
        self.routes.clear();
    }

    pub fn get_routes(&self) -> Vec<Route> {
        self.routes
            .iter()
            .map(|(prefix, path)| Route {
                prefix: *prefix,
                paths: vec![Arc::clone(path)],
            })
            .collect()
    }
}
