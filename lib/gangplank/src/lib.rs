// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub use gangplank_api_types as types;

pub mod itinerary;
pub mod provider;
pub mod sim;
pub mod target;
pub mod task;

pub use itinerary::{Itinerary, TransitionError, COLD, FAILED, WARM};
pub use task::{Task, TaskError, TaskOptions};
