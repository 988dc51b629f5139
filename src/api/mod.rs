//! Authenticated client for the health-data API.
//!
//! Every request asks the [`TokenManager`](crate::token::TokenManager) for a
//! token. A `401` triggers one forced refresh and one retry.

mod client;
mod resources;

pub use client::{ApiClient, ApiError};
pub use resources::{DateRange, Page, Resource};
