// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

pub mod helpers;
pub mod queue_test;
pub mod reaper_test;
pub mod redis_state_store_test;
pub mod scheduler_test;
