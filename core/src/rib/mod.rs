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

//! Routing Information Base (RIB)
//!
//! - Adj-RIB-In: per-peer routes as received, after validation
//! - Loc-RIB: every candidate path per prefix, sorted best first
//! - Adj-RIB-Out: per-peer routes as last advertised
//!
//! All tables are owned by the server task. Paths are shared between them
//! through `Arc<Path>`.

mod path;
pub mod rib_in;
pub mod rib_loc;
pub mod rib_out;
mod types;

pub use path::{DecisionConfig, Path, PathAttrs, RouteRejected, DEFAULT_LOCAL_PREF};
pub use types::{Route, RouteSource};
