//! Pluggable row decoding

use super::bucket::EtlRow;

/// Turns a source row into the row the target should receive
///
/// `Ok(None)` filters the row out. An error poisons the whole batch: the load
/// stage stops the task instead of applying a partial conversion.
pub trait EventConverter: Send + Sync {
    fn name(&self) -> &str;

    fn convert(&self, row: EtlRow) -> anyhow::Result<Option<EtlRow>>;
}

/// Forwards rows unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughConverter;

impl EventConverter for PassThroughConverter {
    fn name(&self) -> &str {
        "pass_through"
    }

    fn convert(&self, row: EtlRow) -> anyhow::Result<Option<EtlRow>> {
        Ok(Some(row))
    }
}
