pub mod client;
pub mod provider;

pub use client::{OddsApiClient, ProjectionClient};
pub use provider::{OddsSource, ProjectionSource};
