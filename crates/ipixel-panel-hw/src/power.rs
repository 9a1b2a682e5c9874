//! Control commands (power and clear) sent to every unit.

use futures::future::join_all;
use tracing::{debug, warn};

use crate::panel::{PayloadKind, UnitSlot};
use crate::protocol::ControlCommand;
use crate::results::UnitResults;

/// Sends `command` to each unit concurrently; one unit failing does not stop the others.
pub(crate) async fn broadcast(slots: &[UnitSlot], command: ControlCommand) -> UnitResults<()> {
    let results: UnitResults<()> = join_all(slots.iter().map(|slot| async move {
        let mut link = slot.link.lock().await;
        let result = link.conn.send_control(command).await;
        if result.is_ok() {
            slot.record(PayloadKind::Control(command), 0);
        }
        (slot.unit.id, result)
    }))
    .await
    .into_iter()
    .collect();

    for (unit, err) in results.failed() {
        warn!("Unit {}: {} failed: {}", unit, command, err);
    }
    debug!(
        "{} sent to {}/{} unit(s)",
        command,
        results.succeeded().len(),
        results.len()
    );
    results
}
