//! The root daemon state and its single-threaded event loop (spec.md §5
//! Concurrency, §9 Design Note "Global mutable state").
//!
//! `Daemon` owns every registry, the dispatcher, and the stage engine's
//! collaborators as a single `Rc<RefCell<Daemon>>` driven from one
//! `tokio::task::LocalSet` (`main.rs`). The RPC surface (`rpc::server`)
//! never touches this state directly: tonic requires `Send` futures, and
//! `Rc<RefCell<_>>` is not `Send`, so each RPC method instead sends a
//! `DaemonCommand` down an unbounded channel and awaits a `oneshot` reply.
//! Everything that actually mutates `Daemon` runs on the loop's own
//! thread, inside `Daemon::run`.

use crate::config::{Config, MountMap};
use crate::console_user::{self, ConsoleUserEvent, ConsoleUserState};
use crate::db;
use crate::dispatch::CallbackDispatcher;
use crate::ingest::{self, IngestContext, KernelEvent, MountEntry, StageQueue};
use crate::registry::{
    Callback, Disk, DiskRegistry, DiskState, MountPointRegistry, RequestIdAllocator, SessionRegistry, UnitRegistry,
};
use crate::stage::{self, AdvanceOutcome};
use rustc_hash::FxHashMap;
use shared::constants::{REQUEST_OPTION_FORCE, REQUEST_OPTION_SKIP_REPAIR};
use shared::descriptor::{Descriptor, DescriptorKey};
use shared::errors::ArbitrationError;
use shared::proto::callback::{CallbackInvocation, CallbackKind};
use shared::proto::request::RequestKind;
use shared::traits::Auditable;
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};

/// One request/reply pair the RPC surface hands to the event loop. Every
/// variant names one `DiskArbitration` method (spec.md §6), plus the two
/// kernel/console-user event streams that feed ingest and §4.6 directly.
pub enum DaemonCommand {
    SessionCreate {
        client_name: String,
        pid: u32,
        reply: oneshot::Sender<u64>,
    },
    SessionRelease {
        session_id: u64,
        reply: oneshot::Sender<bool>,
    },
    SessionSetClientPort {
        session_id: u64,
        endpoint: String,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    SessionSetAuthorization {
        session_id: u64,
        capability: Vec<u8>,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    SessionRegisterCallback {
        session_id: u64,
        callback: Callback,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    SessionUnregisterCallback {
        session_id: u64,
        address: u64,
        context: u64,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    SessionCopyCallbackQueue {
        session_id: u64,
        reply: oneshot::Sender<Result<Vec<CallbackInvocation>, ArbitrationError>>,
    },
    SessionQueueRequest {
        session_id: u64,
        kind: RequestKind,
        disk_id: String,
        options: u32,
        argument1: String,
        argument2: String,
        address: u64,
        context: u64,
        caller_euid: u32,
        caller_egid: u32,
        reply: oneshot::Sender<(u64, Result<(), ArbitrationError>)>,
    },
    SessionQueueResponse {
        session_id: u64,
        response_id: u64,
        dissent: Option<ArbitrationError>,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    DiskCopyDescription {
        disk_id: String,
        reply: oneshot::Sender<Result<Descriptor, ArbitrationError>>,
    },
    DiskGetOptions {
        disk_id: String,
        reply: oneshot::Sender<Result<u32, ArbitrationError>>,
    },
    DiskSetOptions {
        disk_id: String,
        options: u32,
        set: bool,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    DiskGetUserUid {
        disk_id: String,
        reply: oneshot::Sender<Result<u32, ArbitrationError>>,
    },
    DiskIsClaimed {
        disk_id: String,
        reply: oneshot::Sender<Result<bool, ArbitrationError>>,
    },
    DiskUnclaim {
        session_id: u64,
        disk_id: String,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    DiskSetAdoption {
        disk_id: String,
        adopting: bool,
        caller_euid: u32,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    DiskSetEncoding {
        disk_id: String,
        encoding: u32,
        caller_euid: u32,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    Mkdir {
        path: std::path::PathBuf,
        caller_euid: u32,
        caller_egid: u32,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    Rmdir {
        path: std::path::PathBuf,
        reply: oneshot::Sender<Result<(), ArbitrationError>>,
    },
    /// Pushed by the `SIGHUP` handler (`main.rs`) once it has re-read both
    /// config files off the signal-watcher thread; no reply, since nothing
    /// blocks on a reload completing.
    ReloadConfig {
        config: Config,
        mount_map: MountMap,
    },
}

/// The daemon's entire mutable state (spec.md §3). Field names and types
/// are load-bearing: `stage::engine::mark_appeared` destructures this
/// struct directly (`let Daemon { disks, sessions, dispatcher, .. }`), and
/// `stage::engine::advance_mount` reads `config`/`mount_map`/`mount_points`/
/// `console_users` straight off a borrowed `Rc<RefCell<Daemon>>`.
pub struct Daemon {
    pub disks: DiskRegistry,
    pub units: UnitRegistry,
    pub sessions: SessionRegistry,
    pub dispatcher: CallbackDispatcher,
    pub mount_points: MountPointRegistry,
    pub config: Config,
    pub mount_map: MountMap,
    pub console_users: ConsoleUserState,
    /// Disks signaled for the Stage Engine to (re-)examine (spec.md §4.5).
    pub stage_queue: StageQueue,

    request_ids: RequestIdAllocator,
    /// Disk ids whose automatic mount was suspended pending a console-user
    /// login (spec.md §4.6), re-signaled on the next login transition.
    deferred_mounts: HashSet<String>,
    /// Sessions owed a response to an outstanding approval solicitation.
    approval_waiters: FxHashMap<u64, oneshot::Sender<Result<(), ArbitrationError>>>,
    /// Request ids torn down cooperatively (spec.md §5 Cancellation):
    /// checked once at the start of a request's pipeline, not at every
    /// intermediate await point, matching the "cancellable until the
    /// helper invocation has begun" comment on `Request::cancel`.
    canceled_requests: HashSet<u64>,
    request_owner: FxHashMap<u64, u64>,
    /// Accepted-but-inert sidecar state for `DiskSetAdoption`/
    /// `DiskSetEncoding` (spec.md §6; DESIGN.md records why these stop at
    /// bookkeeping rather than driving the mount pipeline).
    disk_adoption: FxHashMap<String, bool>,
    disk_encoding: FxHashMap<String, u32>,
    /// Last observed `/proc/self/mountinfo` snapshot, diffed on every
    /// `KernelEvent::MountTableChanged` (spec.md §4.3 "Mount-table events").
    mount_table_snapshot: Vec<MountEntry>,
    db: Option<rusqlite::Connection>,
}

impl Daemon {
    pub fn new(config: Config, mount_map: MountMap, db: Option<rusqlite::Connection>) -> Self {
        Self {
            disks: DiskRegistry::new(),
            units: UnitRegistry::new(),
            sessions: SessionRegistry::new(),
            dispatcher: CallbackDispatcher::new(),
            mount_points: MountPointRegistry::new(),
            config,
            mount_map,
            console_users: ConsoleUserState::default(),
            stage_queue: StageQueue::default(),
            request_ids: RequestIdAllocator::new(),
            deferred_mounts: HashSet::new(),
            approval_waiters: FxHashMap::default(),
            canceled_requests: HashSet::new(),
            request_owner: FxHashMap::default(),
            disk_adoption: FxHashMap::default(),
            disk_encoding: FxHashMap::default(),
            mount_table_snapshot: Vec::new(),
            db,
        }
    }

    fn audit_disk(&self, disk_id: &str, event: &str, detail: &str) {
        if let Some(conn) = &self.db {
            db::DiskEvent { disk_id, unit_id: None, event, detail }.record(conn);
        }
    }

    fn audit_request(&self, request_id: u64, disk_id: &str, kind: &str, status: Option<&str>, detail: &str) {
        if let Some(conn) = &self.db {
            let request_id = request_id.to_string();
            db::RequestEvent {
                request_id: &request_id,
                disk_id: Some(disk_id),
                kind,
                status,
                detail,
            }
            .record(conn);
        }
    }

    fn audit_session(&self, session_id: u64, pid: Option<u32>, event: &str, detail: &str) {
        if let Some(conn) = &self.db {
            let session_id = session_id.to_string();
            db::SessionEvent {
                session_id: &session_id,
                pid: pid.map(i64::from),
                event,
                detail,
            }
            .record(conn);
        }
    }
}

/// Runs the event loop to completion: pumps RPC commands, kernel events,
/// and console-user events until `shutdown` is notified. Each command is
/// spawned onto the surrounding `LocalSet` so a slow request (waiting on a
/// helper or an approval) never blocks the next one (spec.md §5).
pub async fn run(
    daemon: Rc<RefCell<Daemon>>,
    mut commands: mpsc::UnboundedReceiver<DaemonCommand>,
    mut kernel_events: mpsc::UnboundedReceiver<KernelEvent>,
    mut console_events: mpsc::UnboundedReceiver<ConsoleUserEvent>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => {
                        let daemon = Rc::clone(&daemon);
                        tokio::task::spawn_local(async move {
                            handle_command(&daemon, cmd).await;
                        });
                    }
                    None => break,
                }
            }
            event = kernel_events.recv() => {
                match event {
                    Some(event) => handle_kernel_event(&daemon, event).await,
                    None => break,
                }
            }
            event = console_events.recv() => {
                match event {
                    Some(event) => handle_console_event(&daemon, event).await,
                    None => break,
                }
            }
            _ = shutdown.notified() => break,
        }
    }
    log::info!("daemon event loop exiting");
}

async fn handle_kernel_event(daemon: &Rc<RefCell<Daemon>>, event: KernelEvent) {
    match event {
        KernelEvent::MediaAppeared { kernel_object, unit_id, descriptor } => {
            {
                let mut d = daemon.borrow_mut();
                let Daemon { disks, units, sessions, dispatcher, stage_queue, .. } = &mut *d;
                let mut ctx = IngestContext { disks, units, sessions, dispatcher, stage_queue };
                ingest::handle_appearance(&mut ctx, kernel_object, unit_id, descriptor);
            }
            drain_and_advance(daemon);
        }
        KernelEvent::MediaDisappeared { kernel_object } => {
            disappear(daemon, kernel_object).await;
            update_idle(daemon);
        }
        KernelEvent::MediaPropertyChanged { kernel_object, descriptor } => {
            property_change(daemon, kernel_object, descriptor);
        }
        KernelEvent::MountTableChanged => {
            handle_mount_table_changed(daemon);
        }
    }
}

/// Drains every disk id the Stage Engine was signaled about and advances
/// each one on its own spawned task (spec.md §4.5: "advance leftmost-first
/// whenever the Stage Engine is signaled"). Spawning rather than awaiting
/// inline keeps a slow probe/mount helper for one disk from blocking the
/// event loop's handling of every other disk.
fn drain_and_advance(daemon: &Rc<RefCell<Daemon>>) {
    let ids: Vec<String> = {
        let mut d = daemon.borrow_mut();
        let mut ids = Vec::new();
        while let Some(id) = d.stage_queue.pop() {
            ids.push(id);
        }
        ids
    };
    for id in ids {
        let daemon = Rc::clone(daemon);
        tokio::task::spawn_local(async move {
            advance_and_appear(&daemon, &id, true, false).await;
            update_idle(&daemon);
        });
    }
}

/// Runs the probe/repair/mount pipeline for `disk_id` to its terminal
/// stage and dispatches `disk-appeared` once it gets there (spec.md §4.5
/// "Appear": reached regardless of whether the mount itself succeeded).
async fn advance_and_appear(daemon: &Rc<RefCell<Daemon>>, disk_id: &str, automatic: bool, force: bool) -> Result<(), ArbitrationError> {
    match stage::advance_mount(daemon, disk_id, automatic, force).await {
        AdvanceOutcome::Suspended => {
            daemon.borrow_mut().deferred_mounts.insert(disk_id.to_string());
            Ok(())
        }
        AdvanceOutcome::ReachedAppear => {
            stage::mark_appeared(daemon, disk_id);
            daemon.borrow().audit_disk(disk_id, "appeared", "");
            Ok(())
        }
        AdvanceOutcome::Failed(e) => {
            log::warn!("mount pipeline for {disk_id} failed: {e}");
            stage::mark_appeared(daemon, disk_id);
            daemon.borrow().audit_disk(disk_id, "mount_failed", &e.detail());
            Err(e)
        }
    }
}

/// Re-evaluates and broadcasts the idle predicate (spec.md §4.4 invariant
/// 5): idle means no disk has a mount in flight and no disk carries a
/// command lock.
fn update_idle(daemon: &Rc<RefCell<Daemon>>) {
    let mut d = daemon.borrow_mut();
    let is_idle = d
        .disks
        .iter()
        .all(|disk| !disk.state.contains(DiskState::MOUNT_ONGOING) && disk.in_flight_request.is_none());
    let Daemon { sessions, dispatcher, .. } = &mut *d;
    dispatcher.update_idle(sessions, is_idle);
}

async fn handle_console_event(daemon: &Rc<RefCell<Daemon>>, event: ConsoleUserEvent) {
    let (first_login, last_logout) = {
        let mut d = daemon.borrow_mut();
        let first_login = d.console_users.apply(&event);
        let last_logout = matches!(event, ConsoleUserEvent::LoggedOut(_)) && d.console_users.is_last_logout();
        console_user::apply_permissions(&d.disks, &d.console_users);
        (first_login, last_logout)
    };

    if first_login {
        let deferred: Vec<String> = {
            let mut d = daemon.borrow_mut();
            d.deferred_mounts.drain().collect()
        };
        for disk_id in deferred {
            let daemon = Rc::clone(daemon);
            tokio::task::spawn_local(async move {
                advance_and_appear(&daemon, &disk_id, true, false).await.ok();
                update_idle(&daemon);
            });
        }
    }

    if last_logout {
        let candidates: Vec<String> = {
            let d = daemon.borrow();
            console_user::logout_unmount_candidates(&d.disks, &d.config.deferral)
                .into_iter()
                .map(str::to_string)
                .collect()
        };
        for disk_id in candidates {
            let daemon = Rc::clone(daemon);
            tokio::task::spawn_local(async move {
                if let Err(e) = perform_unmount(&daemon, &disk_id, false).await {
                    log::warn!("logout-triggered unmount of {disk_id} failed: {e}");
                    return;
                }
                let family = {
                    let d = daemon.borrow();
                    d.disks.lookup(&disk_id).and_then(|disk| disk.descriptor.logical_volume_family()).map(str::to_string)
                };
                if let Some(family) = family {
                    let config = daemon.borrow().config.clone();
                    stage::lock_logical_volume_family(&config, &family).await;
                }
            });
        }
    }
}

async fn disappear(daemon: &Rc<RefCell<Daemon>>, kernel_object: String) {
    let plan = {
        let mut d = daemon.borrow_mut();
        let Daemon { disks, units, sessions, dispatcher, stage_queue, .. } = &mut *d;
        let ctx = IngestContext { disks, units, sessions, dispatcher, stage_queue };
        ingest::plan_disappearance(&ctx, &kernel_object)
    };
    let Some(plan) = plan else {
        log::debug!("disappearance for unknown disk {kernel_object}, ignoring");
        return;
    };

    if plan.was_staged_mount {
        if let Some(path) = &plan.volume_path {
            if let Err(e) = stage::force_unmount(path).await {
                log::warn!("force-unmount of {kernel_object} during disappearance failed: {e}");
            }
        }
    }

    let mut d = daemon.borrow_mut();
    let Daemon { disks, units, sessions, dispatcher, stage_queue, .. } = &mut *d;
    let mut ctx = IngestContext { disks, units, sessions, dispatcher, stage_queue };
    ingest::finish_disappearance(&mut ctx, &kernel_object, &plan);
    d.audit_disk(&kernel_object, "disappeared", "");
}

fn property_change(daemon: &Rc<RefCell<Daemon>>, kernel_object: String, descriptor: Descriptor) {
    let mut d = daemon.borrow_mut();
    let Daemon { disks, units, sessions, dispatcher, stage_queue, .. } = &mut *d;
    let mut ctx = IngestContext { disks, units, sessions, dispatcher, stage_queue };
    ingest::handle_property_change(&mut ctx, kernel_object, descriptor);
}

/// Diffs the current `/proc/self/mountinfo` snapshot against the last one
/// observed (spec.md §4.3 "Mount-table events"):
///   - an entry that vanished from a disk that still carries its volume
///     path is an externally-issued `umount(8)` the daemon has to notice;
///   - an entry that newly appeared against a known disk lacking a volume
///     path is an externally-issued `mount(8)`, reconciled the same way;
///   - an entry matching no known disk at all (and not on a bind/union/
///     devfs filesystem) becomes a fresh `Disk`, keyed by its device path.
fn handle_mount_table_changed(daemon: &Rc<RefCell<Daemon>>) {
    let Ok(current) = ingest::read_mount_table() else {
        return;
    };

    enum Reconcile {
        ClearVolumePath(String),
        SetVolumePath(String, PathBuf),
        NewDisk(MountEntry),
    }

    let actions: Vec<Reconcile> = {
        let mut d = daemon.borrow_mut();
        let previous = std::mem::replace(&mut d.mount_table_snapshot, current.clone());

        let mut actions: Vec<Reconcile> = ingest::newly_unmounted(&previous, &current)
            .into_iter()
            .filter_map(|entry| {
                d.disks
                    .iter()
                    .find(|disk| {
                        disk.descriptor
                            .volume_path()
                            .and_then(|u| u.to_file_path().ok())
                            .as_deref()
                            == Some(entry.mount_point.as_path())
                    })
                    .map(|disk| Reconcile::ClearVolumePath(disk.id.clone()))
            })
            .collect();

        for entry in ingest::newly_mounted(&previous, &current) {
            let known = d.disks.iter().find(|disk| disk.descriptor.device_path() == Some(entry.device_path.as_str()));
            match known {
                Some(disk) if disk.descriptor.volume_path().is_none() => {
                    actions.push(Reconcile::SetVolumePath(disk.id.clone(), entry.mount_point.clone()));
                }
                Some(_) => {}
                None if !ingest::is_ignored_fs_kind(&entry.fs_type) => {
                    actions.push(Reconcile::NewDisk(entry.clone()));
                }
                None => {}
            }
        }

        actions
    };

    for action in actions {
        let mut d = daemon.borrow_mut();
        let Daemon { disks, units, sessions, dispatcher, stage_queue, .. } = &mut *d;
        let mut ctx = IngestContext { disks, units, sessions, dispatcher, stage_queue };
        match action {
            Reconcile::ClearVolumePath(disk_id) => {
                let Some(disk) = ctx.disks.lookup(&disk_id) else { continue };
                let mut new_descriptor = disk.descriptor.clone();
                new_descriptor.remove(DescriptorKey::VolumePath);
                ingest::handle_property_change(&mut ctx, disk_id, new_descriptor);
            }
            Reconcile::SetVolumePath(disk_id, mount_point) => {
                let Some(disk) = ctx.disks.lookup(&disk_id) else { continue };
                let Ok(url) = url::Url::from_file_path(&mount_point) else { continue };
                let mut new_descriptor = disk.descriptor.clone();
                new_descriptor.set(DescriptorKey::VolumePath, shared::descriptor::DescriptorValue::Url(url));
                ingest::handle_property_change(&mut ctx, disk_id, new_descriptor);
            }
            Reconcile::NewDisk(entry) => {
                if ctx.disks.iter().any(|disk| disk.descriptor.device_path() == Some(entry.device_path.as_str())) {
                    continue;
                }
                let Ok(url) = url::Url::from_file_path(&entry.mount_point) else { continue };
                let mut descriptor = Descriptor::new();
                descriptor.set(DescriptorKey::DevicePath, shared::descriptor::DescriptorValue::String(entry.device_path.clone()));
                descriptor.set(DescriptorKey::VolumePath, shared::descriptor::DescriptorValue::Url(url));
                descriptor.set(DescriptorKey::VolumeKind, shared::descriptor::DescriptorValue::String(entry.fs_type.clone()));
                descriptor.set(DescriptorKey::VolumeMountable, shared::descriptor::DescriptorValue::Bool(true));
                ingest::handle_appearance(&mut ctx, entry.device_path, None, descriptor);
            }
        }
    }
}

/// Solicits approval for `kind` against `disk_id`, resolving immediately
/// (`Ok(())`) if no session has a matching approval callback registered
/// (spec.md §4.4: zero-quorum solicitations auto-approve). Shared by
/// explicit `SessionQueueRequest` handling and the Stage Engine's own
/// mount-approval gate (scenario S1/S2: every mount, automatic or
/// client-requested, is solicited before the mount point is created).
pub(crate) async fn gate_approval(daemon: &Rc<RefCell<Daemon>>, disk_id: &str, kind: CallbackKind) -> Result<(), ArbitrationError> {
    let waiter = {
        let mut d = daemon.borrow_mut();
        let Daemon { disks, sessions, dispatcher, .. } = &mut *d;
        let Some(disk) = disks.lookup(disk_id) else {
            return Err(ArbitrationError::NotFound(disk_id.to_string()));
        };
        let Some(response_id) = dispatcher.solicit_approval(sessions, disk, kind) else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        d.approval_waiters.insert(response_id, tx);
        rx
    };
    waiter.await.unwrap_or(Err(ArbitrationError::Canceled))
}

/// Graceful-or-forced unmount shared by the explicit `unmount` request kind
/// and console-user-logout-driven unmounts (spec.md §4.3, §4.6).
async fn perform_unmount(daemon: &Rc<RefCell<Daemon>>, disk_id: &str, force: bool) -> Result<(), ArbitrationError> {
    let volume_path = {
        let d = daemon.borrow();
        let disk = d.disks.lookup(disk_id).ok_or_else(|| ArbitrationError::NotFound(disk_id.to_string()))?;
        disk.descriptor
            .volume_path()
            .cloned()
            .ok_or_else(|| ArbitrationError::NotReady)?
    };

    stage::unmount(&volume_path, force).await?;

    let mut d = daemon.borrow_mut();
    let Daemon { disks, units, sessions, dispatcher, stage_queue, mount_points, .. } = &mut *d;
    let mut ctx = IngestContext { disks, units, sessions, dispatcher, stage_queue };
    if let Some(disk) = ctx.disks.lookup(disk_id) {
        if let Ok(path) = volume_path.to_file_path() {
            mount_points.release(&path);
            let _ = crate::stage::remove_if_daemon_created(&path);
        }
        let mut new_descriptor = disk.descriptor.clone();
        new_descriptor.remove(DescriptorKey::VolumePath);
        ingest::handle_property_change(&mut ctx, disk_id.to_string(), new_descriptor);
    }
    if let Some(disk) = d.disks.lookup_any_mut(disk_id) {
        disk.state.remove(DiskState::MOUNTED_WITH_USERFS | DiskState::MOUNTED_WITH_FSKIT);
    }
    Ok(())
}

async fn handle_queue_request(
    daemon: &Rc<RefCell<Daemon>>,
    request_id: u64,
    session_id: u64,
    kind: RequestKind,
    disk_id: &str,
    options: u32,
    argument1: &str,
) -> Result<(), ArbitrationError> {
    {
        let mut d = daemon.borrow_mut();
        let Some(disk) = d.disks.lookup_any_mut(disk_id) else {
            return Err(ArbitrationError::NotFound(disk_id.to_string()));
        };
        if disk.in_flight_request.is_some() {
            return Err(ArbitrationError::Busy(format!("{disk_id} has a request in flight")));
        }
        disk.in_flight_request = Some(request_id);
        disk.state |= DiskState::COMMAND_ACTIVE;
        d.request_owner.insert(request_id, session_id);
    }

    let result = dispatch_request_kind(daemon, request_id, session_id, kind, disk_id, options, argument1).await;

    {
        let mut d = daemon.borrow_mut();
        if let Some(disk) = d.disks.lookup_any_mut(disk_id) {
            disk.in_flight_request = None;
            disk.state.remove(DiskState::COMMAND_ACTIVE);
        }
        d.request_owner.remove(&request_id);
        d.canceled_requests.remove(&request_id);
    }
    result
}

async fn dispatch_request_kind(
    daemon: &Rc<RefCell<Daemon>>,
    request_id: u64,
    session_id: u64,
    kind: RequestKind,
    disk_id: &str,
    options: u32,
    argument1: &str,
) -> Result<(), ArbitrationError> {
    let force = options & REQUEST_OPTION_FORCE != 0;

    if is_canceled(daemon, request_id) {
        return Err(ArbitrationError::Canceled);
    }

    match kind {
        RequestKind::Mount => {
            // The mount-approval solicitation itself happens inside
            // `advance_mount`, shared with the automatic appearance-time
            // mount path (scenario S1/S2) rather than duplicated here.
            let skip_repair = options & REQUEST_OPTION_SKIP_REPAIR != 0;
            match stage::advance_mount(daemon, disk_id, false, force || skip_repair).await {
                AdvanceOutcome::ReachedAppear => {
                    stage::mark_appeared(daemon, disk_id);
                    Ok(())
                }
                AdvanceOutcome::Failed(e) => {
                    stage::mark_appeared(daemon, disk_id);
                    Err(e)
                }
                AdvanceOutcome::Suspended => Err(ArbitrationError::NotReady),
            }
        }
        RequestKind::Unmount => {
            gate_approval(daemon, disk_id, stage::is_approval_kind_for_request(kind).expect("unmount is an approval kind")).await?;
            if is_canceled(daemon, request_id) {
                return Err(ArbitrationError::Canceled);
            }
            perform_unmount(daemon, disk_id, force).await
        }
        RequestKind::Eject => {
            gate_approval(daemon, disk_id, stage::is_approval_kind_for_request(kind).expect("eject is an approval kind")).await?;
            if is_canceled(daemon, request_id) {
                return Err(ArbitrationError::Canceled);
            }
            let device_path = {
                let d = daemon.borrow();
                let disk = d.disks.lookup(disk_id).ok_or_else(|| ArbitrationError::NotFound(disk_id.to_string()))?;
                disk.descriptor.device_path().map(str::to_string).ok_or(ArbitrationError::NotReady)?
            };
            stage::eject(&device_path).await
        }
        RequestKind::Rename => {
            let mut d = daemon.borrow_mut();
            let Daemon { disks, units, sessions, dispatcher, stage_queue, .. } = &mut *d;
            let mut ctx = IngestContext { disks, units, sessions, dispatcher, stage_queue };
            let Some(disk) = ctx.disks.lookup(disk_id) else {
                return Err(ArbitrationError::NotFound(disk_id.to_string()));
            };
            if disk.descriptor.volume_path().is_none() {
                return Err(ArbitrationError::NotReady);
            }
            let mut new_descriptor = disk.descriptor.clone();
            new_descriptor.set(DescriptorKey::VolumeName, shared::descriptor::DescriptorValue::String(argument1.to_string()));
            ingest::handle_property_change(&mut ctx, disk_id.to_string(), new_descriptor);
            Ok(())
        }
        RequestKind::Refresh => {
            let mut d = daemon.borrow_mut();
            if let Some(disk) = d.disks.lookup_any_mut(disk_id) {
                disk.state.remove(DiskState::STAGED_PROBE);
            }
            d.stage_queue.signal(disk_id.to_string());
            Ok(())
        }
        RequestKind::Probe => {
            let config = daemon.borrow().config.clone();
            let mut disk = {
                let mut d = daemon.borrow_mut();
                let Some(disk) = d.disks.lookup_any_mut(disk_id) else {
                    return Err(ArbitrationError::NotFound(disk_id.to_string()));
                };
                std::mem::replace(disk, Disk::new(disk_id, Descriptor::new()))
            };
            stage::probe(&config, &mut disk).await;
            let dirty = disk.state.contains(DiskState::REQUIRE_REPAIR);
            let mut d = daemon.borrow_mut();
            if let Some(slot) = d.disks.lookup_any_mut(disk_id) {
                *slot = disk;
            }
            if dirty && !force {
                return Err(ArbitrationError::DirtyVolume);
            }
            Ok(())
        }
        RequestKind::Claim => {
            let mut d = daemon.borrow_mut();
            let Some(disk) = d.disks.lookup_any_mut(disk_id) else {
                return Err(ArbitrationError::NotFound(disk_id.to_string()));
            };
            match disk.claim {
                Some(holder) if holder != session_id => Err(ArbitrationError::ExclusiveAccess),
                _ => {
                    disk.claim = Some(session_id);
                    Ok(())
                }
            }
        }
        RequestKind::Peek => {
            let mut d = daemon.borrow_mut();
            let Daemon { disks, sessions, dispatcher, .. } = &mut *d;
            let Some(disk) = disks.lookup(disk_id) else {
                return Err(ArbitrationError::NotFound(disk_id.to_string()));
            };
            dispatcher.dispatch_peek(sessions, disk);
            Ok(())
        }
        RequestKind::Classic | RequestKind::RequestKindUnspecified => Ok(()),
    }
}

fn is_canceled(daemon: &Rc<RefCell<Daemon>>, request_id: u64) -> bool {
    daemon.borrow().canceled_requests.contains(&request_id)
}

async fn handle_command(daemon: &Rc<RefCell<Daemon>>, cmd: DaemonCommand) {
    match cmd {
        DaemonCommand::SessionCreate { client_name, pid, reply } => {
            let id = {
                let mut d = daemon.borrow_mut();
                let id = d.sessions.create(client_name, pid);
                d.audit_session(id, Some(pid), "create", "");
                id
            };
            let _ = reply.send(id);
        }
        DaemonCommand::SessionRelease { session_id, reply } => {
            let existed = {
                let mut d = daemon.borrow_mut();
                let completed = d.dispatcher.session_torn_down(session_id);
                for (response_id, outcome) in completed {
                    if let Some(tx) = d.approval_waiters.remove(&response_id) {
                        let _ = tx.send(outcome);
                    }
                }
                let owned_requests: Vec<u64> = d
                    .request_owner
                    .iter()
                    .filter(|(_, owner)| **owner == session_id)
                    .map(|(id, _)| *id)
                    .collect();
                for request_id in owned_requests {
                    d.canceled_requests.insert(request_id);
                }
                let existed = d.sessions.release(session_id);
                d.audit_session(session_id, None, "release", "");
                existed
            };
            let _ = reply.send(existed);
        }
        DaemonCommand::SessionSetClientPort { session_id, endpoint, reply } => {
            let result = {
                let mut d = daemon.borrow_mut();
                match d.sessions.lookup_mut(session_id) {
                    Some(session) => {
                        session.client_endpoint = Some(endpoint);
                        Ok(())
                    }
                    None => Err(ArbitrationError::NotFound(session_id.to_string())),
                }
            };
            let _ = reply.send(result);
        }
        DaemonCommand::SessionSetAuthorization { session_id, capability, reply } => {
            let result = {
                let mut d = daemon.borrow_mut();
                match d.sessions.lookup_mut(session_id) {
                    Some(session) => {
                        session.authorization = Some(capability);
                        Ok(())
                    }
                    None => Err(ArbitrationError::NotFound(session_id.to_string())),
                }
            };
            let _ = reply.send(result);
        }
        DaemonCommand::SessionRegisterCallback { session_id, callback, reply } => {
            let result = {
                let mut d = daemon.borrow_mut();
                let Daemon { disks, sessions, dispatcher, .. } = &mut *d;
                match sessions.lookup_mut(session_id) {
                    Some(session) => {
                        let kind = callback.kind;
                        session.register_callback(callback);
                        dispatcher.replay_appearance_on_registration(session, disks.iter());
                        dispatcher.replay_idle_on_registration(session, kind);
                        Ok(())
                    }
                    None => Err(ArbitrationError::NotFound(session_id.to_string())),
                }
            };
            let _ = reply.send(result);
        }
        DaemonCommand::SessionUnregisterCallback { session_id, address, context, reply } => {
            let result = {
                let mut d = daemon.borrow_mut();
                match d.sessions.lookup_mut(session_id) {
                    Some(session) => {
                        if session.unregister_callback(address, context) {
                            Ok(())
                        } else {
                            Err(ArbitrationError::NotFound("no matching callback".to_string()))
                        }
                    }
                    None => Err(ArbitrationError::NotFound(session_id.to_string())),
                }
            };
            let _ = reply.send(result);
        }
        DaemonCommand::SessionCopyCallbackQueue { session_id, reply } => {
            let result = {
                let mut d = daemon.borrow_mut();
                match d.sessions.lookup_mut(session_id) {
                    Some(session) => Ok(session.drain_queue()),
                    None => Err(ArbitrationError::NotFound(session_id.to_string())),
                }
            };
            let _ = reply.send(result);
        }
        DaemonCommand::SessionQueueRequest {
            session_id,
            kind,
            disk_id,
            options,
            argument1,
            argument2: _,
            address: _,
            context: _,
            caller_euid: _,
            caller_egid: _,
            reply,
        } => {
            let request_id = daemon.borrow_mut().request_ids.next_id();
            let result = handle_queue_request(daemon, request_id, session_id, kind, &disk_id, options, &argument1).await;
            daemon.borrow().audit_request(
                request_id,
                &disk_id,
                &format!("{kind:?}"),
                Some(&format!("{:?}", result.as_ref().map(|_| "ok"))),
                result.as_ref().err().map(ArbitrationError::detail).unwrap_or_default().as_str(),
            );
            let _ = reply.send((request_id, result));
        }
        DaemonCommand::SessionQueueResponse { session_id, response_id, dissent, reply } => {
            let mut d = daemon.borrow_mut();
            if let Some(outcome) = d.dispatcher.record_response(response_id, session_id, dissent) {
                if let Some(tx) = d.approval_waiters.remove(&response_id) {
                    let _ = tx.send(outcome);
                }
            }
            let _ = reply.send(Ok(()));
        }
        DaemonCommand::DiskCopyDescription { disk_id, reply } => {
            let result = {
                let d = daemon.borrow();
                d.disks
                    .lookup(&disk_id)
                    .map(|disk| disk.descriptor.clone())
                    .ok_or_else(|| ArbitrationError::NotFound(disk_id.clone()))
            };
            let _ = reply.send(result);
        }
        DaemonCommand::DiskGetOptions { disk_id, reply } => {
            let result = {
                let d = daemon.borrow();
                d.disks
                    .lookup(&disk_id)
                    .map(|disk| (disk.state & DiskState::CLIENT_OPTIONS).bits())
                    .ok_or_else(|| ArbitrationError::NotFound(disk_id.clone()))
            };
            let _ = reply.send(result);
        }
        DaemonCommand::DiskSetOptions { disk_id, options, set, reply } => {
            let result = {
                let mut d = daemon.borrow_mut();
                match d.disks.lookup_any_mut(&disk_id) {
                    Some(disk) => {
                        let mask = DiskState::from_bits_truncate(options) & DiskState::CLIENT_OPTIONS;
                        if set {
                            disk.state |= mask;
                        } else {
                            disk.state.remove(mask);
                        }
                        Ok(())
                    }
                    None => Err(ArbitrationError::NotFound(disk_id.clone())),
                }
            };
            let _ = reply.send(result);
        }
        DaemonCommand::DiskGetUserUid { disk_id, reply } => {
            let result = {
                let d = daemon.borrow();
                d.disks
                    .lookup(&disk_id)
                    .map(|disk| disk.descriptor.suggested_uid().unwrap_or(0) as u32)
                    .ok_or_else(|| ArbitrationError::NotFound(disk_id.clone()))
            };
            let _ = reply.send(result);
        }
        DaemonCommand::DiskIsClaimed { disk_id, reply } => {
            let result = {
                let d = daemon.borrow();
                d.disks
                    .lookup(&disk_id)
                    .map(|disk| disk.is_claimed())
                    .ok_or_else(|| ArbitrationError::NotFound(disk_id.clone()))
            };
            let _ = reply.send(result);
        }
        DaemonCommand::DiskUnclaim { session_id, disk_id, reply } => {
            let result = {
                let mut d = daemon.borrow_mut();
                match d.disks.lookup_any_mut(&disk_id) {
                    Some(disk) => match disk.claim {
                        Some(holder) if holder == session_id => {
                            disk.claim = None;
                            Ok(())
                        }
                        None => Ok(()),
                        Some(_) => Err(ArbitrationError::NotPermitted(format!("{disk_id} is claimed by another session"))),
                    },
                    None => Err(ArbitrationError::NotFound(disk_id.clone())),
                }
            };
            let _ = reply.send(result);
        }
        DaemonCommand::DiskSetAdoption { disk_id, adopting, caller_euid, reply } => {
            let result = {
                let mut d = daemon.borrow_mut();
                match d.disks.lookup(&disk_id) {
                    Some(disk) => authorize_disk_owner(disk, caller_euid),
                    None => Err(ArbitrationError::NotFound(disk_id.clone())),
                }
                .map(|()| {
                    d.disk_adoption.insert(disk_id, adopting);
                })
            };
            let _ = reply.send(result);
        }
        DaemonCommand::DiskSetEncoding { disk_id, encoding, caller_euid, reply } => {
            let result = {
                let mut d = daemon.borrow_mut();
                match d.disks.lookup(&disk_id) {
                    Some(disk) => authorize_disk_owner(disk, caller_euid),
                    None => Err(ArbitrationError::NotFound(disk_id.clone())),
                }
                .map(|()| {
                    d.disk_encoding.insert(disk_id, encoding);
                })
            };
            let _ = reply.send(result);
        }
        DaemonCommand::Mkdir { path, caller_euid, caller_egid, reply } => {
            let result = {
                let d = daemon.borrow();
                create_client_directory(&d.config.mount_root, &path, caller_euid, caller_egid)
            };
            let _ = reply.send(result);
        }
        DaemonCommand::Rmdir { path, reply } => {
            let result = {
                let d = daemon.borrow();
                remove_client_directory(&d.config.mount_root, &path)
            };
            let _ = reply.send(result);
        }
        DaemonCommand::ReloadConfig { config, mount_map } => {
            let mut d = daemon.borrow_mut();
            d.config = config;
            d.mount_map = mount_map;
            log::info!("configuration reloaded");
        }
    }
}

/// Restricts `DiskSetAdoption`/`DiskSetEncoding` (spec.md §6) to root or the
/// disk's own owning uid, now that `caller_euid` is kernel-verified rather
/// than a client-supplied wire field.
fn authorize_disk_owner(disk: &crate::registry::Disk, caller_euid: u32) -> Result<(), ArbitrationError> {
    if caller_euid == 0 {
        return Ok(());
    }
    let owner = disk.descriptor.suggested_uid().unwrap_or(0) as u32;
    if caller_euid == owner {
        Ok(())
    } else {
        Err(ArbitrationError::NotPermitted(format!("{} is not owned by uid {caller_euid}", disk.id)))
    }
}

/// `Mkdir`/`Rmdir` (spec.md §6 Filesystem surface) are restricted to one
/// level directly under `mount_root`, mirroring the same containment the
/// Stage Engine enforces on its own synthesized mount points.
fn create_client_directory(
    mount_root: &std::path::Path,
    path: &std::path::Path,
    caller_euid: u32,
    caller_egid: u32,
) -> Result<(), ArbitrationError> {
    if path.parent() != Some(mount_root) {
        return Err(ArbitrationError::BadArgument(format!("{} is not directly under the mount root", path.display())));
    }
    std::fs::create_dir(path).map_err(|e| ArbitrationError::NoResources.tap(&e))?;
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(caller_euid)),
        Some(nix::unistd::Gid::from_raw(caller_egid)),
    )
    .map_err(|e| ArbitrationError::NoResources.tap(&std::io::Error::other(e.to_string())))?;
    Ok(())
}

fn remove_client_directory(mount_root: &std::path::Path, path: &std::path::Path) -> Result<(), ArbitrationError> {
    if path.parent() != Some(mount_root) {
        return Err(ArbitrationError::BadArgument(format!("{} is not directly under the mount root", path.display())));
    }
    std::fs::remove_dir(path).map_err(|e| ArbitrationError::NoResources.tap(&e))
}

trait TapIo {
    fn tap(self, e: &std::io::Error) -> ArbitrationError;
}

impl TapIo for ArbitrationError {
    fn tap(self, e: &std::io::Error) -> ArbitrationError {
        log::warn!("{self}: {e}");
        self
    }
}
