//! Entry point for callers: one logical panel made of stacked units.
//!
//! [`PanelContext`] owns the resolved units and their connection managers;
//! [`PanelCore`] wraps them with per-unit session tokens and exposes the
//! upload, power and diagnostics operations. Every fan-out operation runs
//! concurrently across units and reports per-unit results.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::RwLock;
use std::time::SystemTime;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::canvas::Canvas;
use crate::config::PanelConfig;
use crate::connection::{ConnectionManager, ReconnectPolicy};
use crate::family::FamilyRegistry;
use crate::power;
use crate::protocol::{encode_image_frame, ControlCommand};
use crate::results::UnitResults;
use crate::router;
use crate::transfer::{CancelToken, TransferOutcome, TransferSettings, WindowedTransferEngine};
use crate::unit::{ConnectionState, Unit, UnitId};
use crate::{Error, Result};

/// What was last sent to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Image,
    Animation,
    Control(ControlCommand),
}

/// Diagnostics record of the last successful send to a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRecord {
    pub kind: PayloadKind,
    /// Payload bytes, excluding framing.
    pub len: usize,
    pub sent_at: SystemTime,
}

/// Target units of an image upload and whether they are blanked first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageOptions {
    /// Units to write; empty means every unit.
    pub units: Vec<UnitId>,
    /// Send CLEAR to each target before its image frame.
    pub clear_first: bool,
}

/// Animation payloads keyed by target unit.
#[derive(Debug, Clone, Default)]
pub struct AnimationPlan {
    payloads: BTreeMap<UnitId, Vec<u8>>,
    clear_first: bool,
}

impl AnimationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same payload for every listed unit.
    pub fn broadcast(payload: &[u8], units: impl IntoIterator<Item = UnitId>) -> Self {
        Self {
            payloads: units.into_iter().map(|u| (u, payload.to_vec())).collect(),
            clear_first: false,
        }
    }

    /// Blank each target with CLEAR before its session header.
    pub fn with_clear_first(mut self, clear_first: bool) -> Self {
        self.clear_first = clear_first;
        self
    }

    pub fn clear_first(&self) -> bool {
        self.clear_first
    }

    pub fn insert(&mut self, unit: UnitId, payload: Vec<u8>) {
        self.payloads.insert(unit, payload);
    }

    pub fn units(&self) -> impl Iterator<Item = UnitId> + '_ {
        self.payloads.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (UnitId, &[u8])> {
        self.payloads.iter().map(|(u, p)| (*u, p.as_slice()))
    }
}

/// Units and their connection managers, built once at startup.
pub struct PanelContext {
    managers: Vec<ConnectionManager>,
    transfer: TransferSettings,
}

impl PanelContext {
    /// Resolves units from configuration and builds a transport for each.
    pub fn from_config(config: &PanelConfig, registry: &FamilyRegistry) -> Result<Self> {
        let units = config.resolve_units(registry)?;
        let family = registry.get(&config.family)?;
        let policy = ReconnectPolicy::from(&config.timing);

        let managers = units
            .into_iter()
            .map(|unit| {
                let transport = family.open_transport(&unit, &config.link)?;
                Ok(ConnectionManager::new(unit, transport, policy))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(managers, TransferSettings::from(&config.timing)))
    }

    /// Context over already-built managers.
    pub fn new(managers: Vec<ConnectionManager>, transfer: TransferSettings) -> Self {
        Self { managers, transfer }
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.managers.iter().map(ConnectionManager::unit)
    }
}

/// Link and engine of one unit. Holding the lock is holding the unit's session token.
pub(crate) struct UnitLink {
    pub(crate) conn: ConnectionManager,
    pub(crate) engine: WindowedTransferEngine,
}

pub(crate) struct UnitSlot {
    pub(crate) unit: Unit,
    pub(crate) link: Mutex<UnitLink>,
    pub(crate) cancel: CancelToken,
    state: watch::Receiver<ConnectionState>,
    last_payload: RwLock<Option<PayloadRecord>>,
}

impl UnitLink {
    async fn push_image(&mut self, frame: &[u8], clear_first: bool) -> Result<()> {
        if clear_first {
            self.conn.send_control(ControlCommand::Clear).await?;
        }
        self.conn.write(frame).await
    }

    async fn run_animation(
        &mut self,
        payload: &[u8],
        cancel: &CancelToken,
        clear_first: bool,
    ) -> Result<TransferOutcome> {
        if clear_first && !cancel.is_cancelled() {
            self.conn.send_control(ControlCommand::Clear).await?;
        }
        self.engine.run(&mut self.conn, payload, cancel).await
    }
}

impl UnitSlot {
    pub(crate) fn record(&self, kind: PayloadKind, len: usize) {
        let record = PayloadRecord {
            kind,
            len,
            sent_at: SystemTime::now(),
        };
        *self
            .last_payload
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(record);
    }
}

/// The multi-unit panel.
pub struct PanelCore {
    units: Vec<Unit>,
    slots: Vec<UnitSlot>,
}

impl PanelCore {
    /// Wraps a context. Fails if it has no units or repeats a unit id.
    pub fn new(context: PanelContext) -> Result<Self> {
        if context.managers.is_empty() {
            return Err(Error::Config("no units configured".to_string()));
        }

        let mut seen = HashSet::new();
        let mut slots = Vec::with_capacity(context.managers.len());
        for conn in context.managers {
            let unit = conn.unit().clone();
            if !seen.insert(unit.id) {
                return Err(Error::Config(format!("duplicate unit id {}", unit.id)));
            }
            slots.push(UnitSlot {
                state: conn.watch_state(),
                link: Mutex::new(UnitLink {
                    conn,
                    engine: WindowedTransferEngine::new(context.transfer),
                }),
                cancel: CancelToken::new(),
                last_payload: RwLock::new(None),
                unit,
            });
        }
        slots.sort_by_key(|s| s.unit.position);
        let units = slots.iter().map(|s| s.unit.clone()).collect();

        Ok(Self { units, slots })
    }

    /// Convenience for `PanelCore::new(PanelContext::from_config(..)?)`.
    pub fn from_config(config: &PanelConfig, registry: &FamilyRegistry) -> Result<Self> {
        Self::new(PanelContext::from_config(config, registry)?)
    }

    fn slot(&self, unit: UnitId) -> Result<&UnitSlot> {
        self.slots
            .iter()
            .find(|s| s.unit.id == unit)
            .ok_or_else(|| Error::Config(format!("unknown unit {}", unit)))
    }

    /// Resolves a target list; empty selects every unit.
    fn targets(&self, units: &[UnitId]) -> Result<BTreeSet<UnitId>> {
        if units.is_empty() {
            return Ok(self.units.iter().map(|u| u.id).collect());
        }
        units.iter().map(|&id| self.slot(id).map(|_| id)).collect()
    }

    /// Connects every unit concurrently.
    pub async fn connect_all(&self) -> UnitResults<()> {
        let results: UnitResults<()> = join_all(self.slots.iter().map(|slot| async move {
            let mut link = slot.link.lock().await;
            (slot.unit.id, link.conn.connect().await)
        }))
        .await
        .into_iter()
        .collect();

        info!(
            "Connected {}/{} unit(s)",
            results.succeeded().len(),
            results.len()
        );
        results
    }

    /// Stops running animations at the next window, then blanks and closes every unit.
    pub async fn disconnect_all(&self) {
        for slot in &self.slots {
            slot.cancel.cancel();
        }
        join_all(self.slots.iter().map(|slot| async move {
            slot.link.lock().await.conn.disconnect().await;
        }))
        .await;
    }

    /// Splits the canvas across units and pushes one image frame to each.
    ///
    /// Geometry and size errors are returned before anything is written.
    /// Per-unit write failures are reported in the results.
    pub async fn upload_image(&self, canvas: &Canvas) -> Result<UnitResults<()>> {
        self.upload_image_with(canvas, &ImageOptions::default()).await
    }

    /// Pushes the canvas rows that belong to `units` and leaves the others untouched.
    ///
    /// The canvas still has to cover the whole stack. Unknown ids are a config error.
    pub async fn upload_image_to(
        &self,
        canvas: &Canvas,
        units: &[UnitId],
    ) -> Result<UnitResults<()>> {
        if units.is_empty() {
            return Err(Error::Config("no target units".to_string()));
        }
        let options = ImageOptions {
            units: units.to_vec(),
            ..ImageOptions::default()
        };
        self.upload_image_with(canvas, &options).await
    }

    pub async fn upload_image_with(
        &self,
        canvas: &Canvas,
        options: &ImageOptions,
    ) -> Result<UnitResults<()>> {
        let targets = self.targets(&options.units)?;
        let parts = router::split(canvas, &self.units)?;

        let mut jobs = Vec::with_capacity(targets.len());
        for (id, part) in parts.into_iter().filter(|(id, _)| targets.contains(id)) {
            let frame = encode_image_frame(id, &part.pixels)?;
            jobs.push((self.slot(id)?, frame, part.pixels.len()));
        }

        let clear_first = options.clear_first;
        let results: UnitResults<()> =
            join_all(jobs.into_iter().map(|(slot, frame, len)| async move {
                let mut link = slot.link.lock().await;
                let result = link.push_image(&frame, clear_first).await;
                if result.is_ok() {
                    slot.record(PayloadKind::Image, len);
                }
                (slot.unit.id, result)
            }))
            .await
            .into_iter()
            .collect();

        for (unit, err) in results.failed() {
            warn!("Unit {}: image upload failed: {}", unit, err);
        }
        info!(
            "Image {}x{} pushed to {}/{} unit(s)",
            canvas.width(),
            canvas.height(),
            results.succeeded().len(),
            results.len()
        );
        Ok(results)
    }

    /// Runs one windowed transfer per planned unit, concurrently.
    ///
    /// Unknown, non-animation or empty targets fail with a config error, and
    /// a target that is already busy fails with `SessionActive`. In both cases
    /// no session is started on any unit.
    pub async fn upload_animation(
        &self,
        plan: &AnimationPlan,
    ) -> Result<UnitResults<TransferOutcome>> {
        if plan.is_empty() {
            return Err(Error::Config("animation plan has no target units".to_string()));
        }
        for (id, payload) in plan.iter() {
            let slot = self.slot(id)?;
            if !slot.unit.animation {
                return Err(Error::Config(format!(
                    "unit {} does not accept animation uploads",
                    id
                )));
            }
            if payload.is_empty() {
                return Err(Error::Config(format!("empty animation payload for unit {}", id)));
            }
        }

        let mut sessions = Vec::new();
        for (id, payload) in plan.iter() {
            let slot = self.slot(id)?;
            let guard = slot.link.try_lock().map_err(|_| Error::SessionActive(id))?;
            sessions.push((slot, guard, payload));
        }
        // Cancel requests made before the tokens were taken belong to earlier sessions.
        for (slot, _, _) in &sessions {
            slot.cancel.reset();
        }

        let clear_first = plan.clear_first;
        let results: UnitResults<TransferOutcome> = join_all(sessions.into_iter().map(
            |(slot, mut guard, payload)| async move {
                let result = guard.run_animation(payload, &slot.cancel, clear_first).await;
                if let Ok(TransferOutcome::Complete { .. }) = result {
                    slot.record(PayloadKind::Animation, payload.len());
                }
                (slot.unit.id, result)
            },
        ))
        .await
        .into_iter()
        .collect();

        for (unit, err) in results.failed() {
            warn!("Unit {}: animation upload failed: {}", unit, err);
        }
        Ok(results)
    }

    /// Asks the unit's running animation session to stop before its next window.
    pub fn cancel_animation(&self, unit: UnitId) -> Result<()> {
        self.slot(unit)?.cancel.cancel();
        info!("Unit {}: animation cancel requested", unit);
        Ok(())
    }

    /// True if the unit's last animation session completed and none is running.
    pub fn animation_complete(&self, unit: UnitId) -> Result<bool> {
        let slot = self.slot(unit)?;
        Ok(match slot.link.try_lock() {
            Ok(link) => link.engine.is_complete(),
            Err(_) => false,
        })
    }

    pub async fn clear(&self) -> UnitResults<()> {
        power::broadcast(&self.slots, ControlCommand::Clear).await
    }

    pub async fn power_on(&self) -> UnitResults<()> {
        power::broadcast(&self.slots, ControlCommand::PowerOn).await
    }

    pub async fn power_off(&self) -> UnitResults<()> {
        power::broadcast(&self.slots, ControlCommand::PowerOff).await
    }

    pub fn panel_count(&self) -> usize {
        self.units.len()
    }

    /// Logical canvas size (width, height) of the stacked units.
    pub fn canvas_size(&self) -> (u32, u32) {
        let width = self.units.first().map(Unit::width).unwrap_or(0);
        let height = self
            .units
            .iter()
            .map(Unit::height)
            .fold(0u32, u32::saturating_add);
        (width, height)
    }

    /// Units in stacking order.
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// Units that accept animation uploads.
    pub fn animation_units(&self) -> Vec<UnitId> {
        self.units
            .iter()
            .filter(|u| u.animation)
            .map(|u| u.id)
            .collect()
    }

    /// Current link state of every unit. Does not wait for running transfers.
    pub fn unit_states(&self) -> Vec<(UnitId, ConnectionState)> {
        self.slots
            .iter()
            .map(|s| (s.unit.id, *s.state.borrow()))
            .collect()
    }

    pub fn last_payload(&self, unit: UnitId) -> Result<Option<PayloadRecord>> {
        let slot = self.slot(unit)?;
        let record = slot
            .last_payload
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        Ok(record)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::canvas::BLACK;
    use crate::config::{LinkConfig, LinkKind, UnitConfig};
    use crate::connection::tests::policy;
    use crate::error::ConnectionFailure;
    use crate::link::mock::{acking_device, MockHandle, MockTransport};
    use crate::protocol::{Opcode, WINDOW_SIZE};
    use crate::router::tests::unit;
    use std::time::Duration;

    const RED: [u8; 3] = [255, 0, 0];

    fn settings() -> TransferSettings {
        TransferSettings {
            ack_timeout: Duration::from_millis(500),
            max_retries: 3,
        }
    }

    pub(crate) fn core_with(units: Vec<Unit>) -> (PanelCore, Vec<MockHandle>) {
        let mut handles = Vec::new();
        let managers = units
            .into_iter()
            .map(|u| {
                let (transport, handle) = MockTransport::new(usize::MAX);
                handles.push(handle);
                ConnectionManager::new(u, Box::new(transport), policy())
            })
            .collect();
        let core = PanelCore::new(PanelContext::new(managers, settings())).unwrap();
        (core, handles)
    }

    /// `count` stacked 64x20 units.
    pub(crate) fn stacked(count: u8) -> (PanelCore, Vec<MockHandle>) {
        core_with((0..count).map(|p| unit(p, 64, 20)).collect())
    }

    #[tokio::test]
    async fn test_two_unit_image_upload() {
        let (core, handles) = stacked(2);
        assert!(core.connect_all().await.all_ok());

        let mut canvas = Canvas::new(64, 40);
        canvas.fill_rect(0, 0, 10, 10, RED);
        let results = core.upload_image(&canvas).await.unwrap();
        assert!(results.all_ok());

        let top = handles[0].writes();
        let bottom = handles[1].writes();
        assert_eq!(top.len(), 1);
        assert_eq!(bottom.len(), 1);

        let len = (64 * 20 * 3) as u16;
        let [lo, hi] = len.to_le_bytes();
        assert_eq!(&top[0][..4], &[Opcode::Image as u8, 0, lo, hi]);
        assert_eq!(&top[0][4..7], &RED);
        assert_eq!(bottom[0][1], 1);
        assert!(bottom[0][4..].chunks(3).all(|px| px == BLACK));

        let record = core.last_payload(UnitId(1)).unwrap().unwrap();
        assert_eq!(record.kind, PayloadKind::Image);
        assert_eq!(record.len, 64 * 20 * 3);
    }

    #[tokio::test]
    async fn test_geometry_mismatch_writes_nothing() {
        let (core, handles) = stacked(2);
        core.connect_all().await;

        let err = core.upload_image(&Canvas::new(64, 30)).await.unwrap_err();
        assert!(err.is_config());
        assert!(handles.iter().all(|h| h.writes().is_empty()));
        assert!(core.last_payload(UnitId(0)).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_upload_partial_failure() {
        let (core, handles) = stacked(2);
        core.connect_all().await;
        handles[0].drop_link();

        let results = core.upload_image(&Canvas::new(64, 40)).await.unwrap();
        assert_eq!(results.succeeded(), vec![UnitId(1)]);
        assert!(matches!(
            results.get(UnitId(0)),
            Some(Err(Error::Connection {
                reason: ConnectionFailure::LinkLost { .. },
                ..
            }))
        ));
        assert_eq!(handles[1].writes().len(), 1);
    }

    #[tokio::test]
    async fn test_targeted_image_upload() {
        let (core, handles) = stacked(3);
        core.connect_all().await;

        let mut canvas = Canvas::new(64, 60);
        canvas.fill_rect(0, 20, 64, 20, RED);
        let results = core
            .upload_image_to(&canvas, &[UnitId(1), UnitId(1)])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.all_ok());

        assert!(handles[0].writes().is_empty());
        assert!(handles[2].writes().is_empty());
        let frames = handles[1].writes();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][1], 1);
        assert!(frames[0][4..].chunks(3).all(|px| px == RED));
        assert!(core.last_payload(UnitId(0)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_targeted_upload_unknown_unit_writes_nothing() {
        let (core, handles) = stacked(2);
        core.connect_all().await;

        let canvas = Canvas::new(64, 40);
        let err = core
            .upload_image_to(&canvas, &[UnitId(0), UnitId(7)])
            .await
            .unwrap_err();
        assert!(err.is_config());
        assert!(core.upload_image_to(&canvas, &[]).await.unwrap_err().is_config());
        assert!(handles.iter().all(|h| h.writes().is_empty()));
    }

    #[tokio::test]
    async fn test_image_clear_first() {
        let (core, handles) = stacked(2);
        core.connect_all().await;

        let options = ImageOptions {
            units: vec![UnitId(0)],
            clear_first: true,
        };
        let results = core
            .upload_image_with(&Canvas::new(64, 40), &options)
            .await
            .unwrap();
        assert!(results.all_ok());

        let writes = handles[0].writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], vec![0x08, 0]);
        assert_eq!(writes[1][0], Opcode::Image as u8);
        assert!(handles[1].writes().is_empty());
        assert_eq!(
            core.last_payload(UnitId(0)).unwrap().unwrap().kind,
            PayloadKind::Image
        );
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (core, handles) = stacked(2);
        core.connect_all().await;

        assert!(core.clear().await.all_ok());
        assert!(core.clear().await.all_ok());
        assert_eq!(handles[1].writes(), vec![vec![0x08, 1], vec![0x08, 1]]);
        assert_eq!(
            core.last_payload(UnitId(0)).unwrap().unwrap().kind,
            PayloadKind::Control(ControlCommand::Clear)
        );
    }

    #[tokio::test]
    async fn test_concurrent_animation_sessions() {
        let (core, handles) = stacked(2);
        for handle in &handles {
            handle.respond_with(acking_device());
        }
        core.connect_all().await;

        let plan = AnimationPlan::broadcast(&vec![9; WINDOW_SIZE + 10], core.animation_units());
        let results = core.upload_animation(&plan).await.unwrap();
        assert!(results.all_ok());
        for unit in [UnitId(0), UnitId(1)] {
            assert!(matches!(
                results.get(unit),
                Some(Ok(TransferOutcome::Complete { windows: 2 }))
            ));
            assert!(core.animation_complete(unit).unwrap());
        }
        assert_eq!(handles[1].writes()[0][1], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_animation_partial_failure() {
        let (core, handles) = stacked(2);
        for handle in &handles {
            handle.respond_with(acking_device());
        }
        core.connect_all().await;
        // Header and window 0 get through, then unit 0 is gone.
        handles[0].drop_link_after(2);

        let plan = AnimationPlan::broadcast(&vec![3; 3 * WINDOW_SIZE], core.animation_units());
        let results = core.upload_animation(&plan).await.unwrap();

        assert!(matches!(
            results.get(UnitId(0)),
            Some(Err(Error::Connection { unit: UnitId(0), .. }))
        ));
        assert!(matches!(
            results.get(UnitId(1)),
            Some(Ok(TransferOutcome::Complete { windows: 3 }))
        ));

        let windows: Vec<_> = handles[1]
            .writes()
            .into_iter()
            .filter(|w| w[0] == Opcode::AnimWindow as u8)
            .collect();
        assert_eq!(windows.len(), 3);
        assert_eq!(
            windows.iter().map(|w| w[3]).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(core.animation_complete(UnitId(1)).unwrap());
        assert!(!core.animation_complete(UnitId(0)).unwrap());
        assert_eq!(core.unit_states()[0], (UnitId(0), ConnectionState::Failed));
    }

    #[tokio::test]
    async fn test_animation_clear_first() {
        let (core, handles) = stacked(1);
        handles[0].respond_with(acking_device());
        core.connect_all().await;

        let plan = AnimationPlan::broadcast(&[1; 10], [UnitId(0)]).with_clear_first(true);
        assert!(core.upload_animation(&plan).await.unwrap().all_ok());

        let writes = handles[0].writes();
        assert_eq!(writes[0], vec![0x08, 0]);
        assert_eq!(writes[1][0], Opcode::AnimHeader as u8);
    }

    #[tokio::test]
    async fn test_stale_cancel_does_not_stop_next_session() {
        let (core, handles) = stacked(1);
        handles[0].respond_with(acking_device());
        core.connect_all().await;

        core.cancel_animation(UnitId(0)).unwrap();
        let plan = AnimationPlan::broadcast(&vec![2; WINDOW_SIZE + 1], [UnitId(0)]);
        let results = core.upload_animation(&plan).await.unwrap();
        assert!(matches!(
            results.get(UnitId(0)),
            Some(Ok(TransferOutcome::Complete { windows: 2 }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_header_wait_stops_before_first_window() {
        let (core, handles) = stacked(1);
        core.connect_all().await;

        let plan = AnimationPlan::broadcast(&vec![2; 2 * WINDOW_SIZE], [UnitId(0)]);
        let (results, _) = tokio::join!(core.upload_animation(&plan), async {
            tokio::task::yield_now().await;
            core.cancel_animation(UnitId(0)).unwrap();
            handles[0].notify(
                crate::protocol::Ack {
                    window: crate::protocol::HEADER_ACK_INDEX,
                    status: crate::protocol::AckStatus::Ok,
                }
                .encode()
                .to_vec(),
            );
        });

        assert!(matches!(
            results.unwrap().get(UnitId(0)),
            Some(Ok(TransferOutcome::Cancelled { next_window: 0 }))
        ));
        let writes = handles[0].writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0][0], Opcode::AnimHeader as u8);
        assert_eq!(writes[1], vec![Opcode::AnimAbort as u8, 0]);
    }

    #[tokio::test]
    async fn test_busy_unit_rejects_animation() {
        let (core, handles) = stacked(2);
        core.connect_all().await;

        let _token = core.slots[0].link.lock().await;
        let plan = AnimationPlan::broadcast(&[1, 2, 3], [UnitId(0), UnitId(1)]);
        let err = core.upload_animation(&plan).await.unwrap_err();
        assert!(matches!(err, Error::SessionActive(UnitId(0))));
        assert!(!core.animation_complete(UnitId(0)).unwrap());
        assert!(handles[1].writes().is_empty());
    }

    #[tokio::test]
    async fn test_animation_rejected_for_static_unit() {
        let mut legacy = unit(1, 64, 20);
        legacy.animation = false;
        let (core, handles) = core_with(vec![unit(0, 64, 20), legacy]);
        core.connect_all().await;

        let plan = AnimationPlan::broadcast(&[1, 2, 3], [UnitId(0), UnitId(1)]);
        assert!(core.upload_animation(&plan).await.unwrap_err().is_config());
        assert_eq!(core.animation_units(), vec![UnitId(0)]);

        let mut plan = AnimationPlan::new();
        plan.insert(UnitId(4), vec![1]);
        assert!(core.upload_animation(&plan).await.unwrap_err().is_config());
        assert!(core.upload_animation(&AnimationPlan::new()).await.is_err());
        assert!(handles.iter().all(|h| h.writes().is_empty()));
    }

    #[tokio::test]
    async fn test_cancelled_animation() {
        let (core, handles) = stacked(1);
        let cancel = core.slots[0].cancel.clone();
        let mut healthy = acking_device();
        handles[0].respond_with(move |frame: &[u8]| {
            if frame[0] == Opcode::AnimWindow as u8 {
                cancel.cancel();
            }
            healthy(frame)
        });
        core.connect_all().await;

        let plan = AnimationPlan::broadcast(&vec![0; 3 * WINDOW_SIZE], [UnitId(0)]);
        let results = core.upload_animation(&plan).await.unwrap();
        assert!(matches!(
            results.get(UnitId(0)),
            Some(Ok(TransferOutcome::Cancelled { next_window: 1 }))
        ));
        assert!(!core.animation_complete(UnitId(0)).unwrap());
        assert!(core.last_payload(UnitId(0)).unwrap().is_none());

        core.cancel_animation(UnitId(0)).unwrap();
        assert!(core.cancel_animation(UnitId(3)).is_err());
    }

    #[tokio::test]
    async fn test_states_and_geometry() {
        let (core, handles) = stacked(3);
        assert_eq!(core.panel_count(), 3);
        assert_eq!(core.canvas_size(), (64, 60));
        assert!(core
            .unit_states()
            .iter()
            .all(|(_, s)| *s == ConnectionState::Disconnected));

        handles[2].fail_next_connect(crate::link::LinkError::Unreachable("off".into()));
        let results = core.connect_all().await;
        assert_eq!(results.failed().len(), 1);
        assert_eq!(
            core.unit_states(),
            vec![
                (UnitId(0), ConnectionState::Connected),
                (UnitId(1), ConnectionState::Connected),
                (UnitId(2), ConnectionState::Failed),
            ]
        );

        core.disconnect_all().await;
        assert_eq!(handles[0].writes(), vec![vec![0x08, 0]]);
        assert!(handles[2].writes().is_empty());
        assert!(core
            .unit_states()
            .iter()
            .all(|(_, s)| *s == ConnectionState::Disconnected));
    }

    #[test]
    fn test_canvas_height_saturates() {
        let (core, _) = core_with(vec![unit(0, 1, u32::MAX), unit(1, 1, 1)]);
        assert_eq!(core.canvas_size(), (1, u32::MAX));
    }

    #[test]
    fn test_duplicate_unit_ids_rejected() {
        let managers = [unit(0, 64, 20), unit(0, 64, 20)]
            .into_iter()
            .map(|u| ConnectionManager::new(u, Box::new(MockTransport::new(64).0), policy()))
            .collect();
        assert!(PanelCore::new(PanelContext::new(managers, settings())).is_err());
        assert!(PanelCore::new(PanelContext::new(Vec::new(), settings())).is_err());
    }

    #[test]
    fn test_from_config_builds_serial_units() {
        let config = PanelConfig {
            link: LinkConfig {
                kind: LinkKind::Serial,
                ..LinkConfig::default()
            },
            units: ["/dev/ttyUSB0", "/dev/ttyUSB1"]
                .iter()
                .map(|path| UnitConfig {
                    address: path.to_string(),
                    width: None,
                    height: None,
                    position: None,
                    write_channel: None,
                    notify_channel: None,
                    animation: None,
                })
                .collect(),
            ..PanelConfig::default()
        };

        let core = PanelCore::from_config(&config, &FamilyRegistry::builtin()).unwrap();
        assert_eq!(core.panel_count(), 2);
        assert_eq!(core.canvas_size(), (64, 40));
        assert_eq!(core.animation_units(), vec![UnitId(0), UnitId(1)]);
    }
}
