//! The saved-state transaction: every write operation runs inside a scope
//! that snapshots the filter table and the WireGuard configuration and
//! opens a catalog transaction. Success commits; any error or panic
//! restores all three externalities byte-for-byte.
//!
//! Only one scope may be active at a time; the process-wide write lock
//! guarantees that, so a nested BEGIN can never happen.

use crate::{config::Settings, nft, wg, ServerError};
use rusqlite::Connection;
use std::panic::{self, AssertUnwindSafe};

pub fn with_saved_state<T, F>(
    conn: &Connection,
    settings: &Settings,
    body: F,
) -> Result<T, ServerError>
where
    F: FnOnce() -> Result<T, ServerError>,
{
    let filter_snapshot = nft::snapshot()?;
    let wg_snapshot = wg::snapshot_config(settings)?;
    conn.execute_batch("BEGIN")?;
    log::debug!("saved state captured, transaction open");

    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => match conn.execute_batch("COMMIT") {
            Ok(()) => Ok(value),
            Err(err) => {
                log::error!("commit failed, restoring saved state: {err}");
                restore(conn, settings, &filter_snapshot, &wg_snapshot);
                Err(err.into())
            },
        },
        Ok(Err(err)) => {
            log::warn!("operation failed, restoring saved state: {err}");
            restore(conn, settings, &filter_snapshot, &wg_snapshot);
            Err(err)
        },
        Err(payload) => {
            log::error!("operation panicked, restoring saved state");
            restore(conn, settings, &filter_snapshot, &wg_snapshot);
            panic::resume_unwind(payload);
        },
    }
}

/// Best-effort restore of all three externalities. Each step is attempted
/// even if an earlier one fails; the caller's original error wins.
fn restore(conn: &Connection, settings: &Settings, filter_snapshot: &str, wg_snapshot: &str) {
    if let Err(err) = nft::restore(filter_snapshot) {
        log::error!("filter restore failed: {err}");
    }
    if let Err(err) = wg::restore_config(settings, wg_snapshot) {
        log::error!("WireGuard restore failed: {err}");
    }
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        log::error!("catalog rollback failed: {err}");
    }
    log::info!("saved state restored");
}
