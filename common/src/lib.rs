// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

pub mod allocations;
pub mod models;
pub mod sequential_timer;
pub mod subgraph_client;

pub mod prelude {
    pub use super::allocations::{
        monitor::eligible_allocations, Allocation, AllocationStatus, SubgraphDeployment,
    };
    pub use super::sequential_timer::{
        sequential_timer, sequential_timer_map, sequential_timer_reduce, TimerHandle,
    };
    pub use super::subgraph_client::SubgraphClient;
}
