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

/// Adj-RIB-In: routes received from one peer, before best path selection.
///
/// Holds the most recent path per prefix. Emptied when the session ends.
#[derive(Debug, Default)]
pub struct AdjRibIn {
    routes: HashMap<Ipv4Net, Arc<Path>>,
}

impl AdjRibIn {
    pub fn new() -> Self {
        AdjRibIn {
            routes: HashMap::new(),
        }
    }

    /// Store `path` for `prefix`, replacing any earlier announcement.
    pub fn add_route(&mut self, prefix: Ipv4Net, path: Arc<Path>) {
        self.routes.insert(prefix, path);
    }

    /// Returns true if the prefix was present.
    pub fn remove_route(&mut self, prefix: Ipv4Net) -> bool {
        self.routes.remove(&prefix).is_some()
    }

    pub fn get(&self, prefix: &Ipv4Net) -> Option<&Arc<Path>> {
        self.routes.get(prefix)
    }

    pub fn get_all_routes(&self) -> Vec<Route> {
        self.routes
            .iter()
            .map(|(prefix, path)| Route {
                prefix: *prefix,
                paths: vec![Arc::clone(path)],
            })
            .collect()
    }

    pub fn prefix_count(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Drop every route, returning the prefixes that were held.
    pub fn clear(&mut self) -> Vec<Ipv4Net> {
        self.routes.drain().map(|(prefix, _)| prefix).collect()
    }
}
