pub mod deribit;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::PriceSnapshotRow;

pub use deribit::DeribitClient;

/// Produces the current price snapshot for one base/quote pair.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, base: &str, quote: &str) -> Result<Vec<PriceSnapshotRow>>;
}
