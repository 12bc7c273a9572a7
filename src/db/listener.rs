//! Transaction lifecycle listeners

use crate::error::Result;

/// Hooks around transaction lifecycle steps
///
/// Every hook is best effort: an error is logged and never interrupts the
/// step it observes.
pub trait DatabaseListener: Send + Sync {
    fn on_before_tx_begin(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn on_after_tx_begin(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn on_before_tx_commit(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn on_after_tx_commit(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn on_before_tx_rollback(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }

    fn on_after_tx_rollback(&self, _tx_id: u64) -> Result<()> {
        Ok(())
    }
}
