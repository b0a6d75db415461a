// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

pub mod agent;
pub mod collector;
pub mod config;
pub mod contracts;
pub mod cost_models;
pub mod database;
pub mod dips;
pub mod gateway;
pub mod keys;
pub mod metrics;
pub mod ravs;
pub mod receipts;
pub mod vouchers;
