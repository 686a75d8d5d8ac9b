//! Black-box end-to-end coverage for the scenarios in spec.md §8, driving
//! the registries and Stage Engine together through `Daemon` rather than
//! unit-testing any one collaborator in isolation.

use diskarbd::config::{Config, DatabaseConfig, DeferralPolicy, MountBackend, MountMap};
use diskarbd::daemon::{self, Daemon, DaemonCommand};
use diskarbd::dispatch::CallbackDispatcher;
use diskarbd::ingest::{handle_appearance, IngestContext, KernelEvent, StageQueue};
use diskarbd::registry::{Callback, Disk, DiskRegistry, DiskState, SessionRegistry, UnitRegistry};
use diskarbd::stage::{advance_mount, AdvanceOutcome};
use shared::descriptor::{Descriptor, DescriptorKey, DescriptorValue};
use shared::proto::callback::CallbackKind;
use std::cell::RefCell;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

fn write_helper(dir: &Path, name: &str, script: &str) {
    let path = dir.join(name);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn test_config(helper_dir: PathBuf, mount_root: PathBuf) -> Config {
    Config {
        mount_root,
        mount_map_path: "/etc/diskarbd/mount-map.toml".into(),
        rpc_socket_path: "/var/run/diskarbd.sock".into(),
        pid_file_path: "/var/run/diskarbd.pid".into(),
        database: DatabaseConfig {
            path: "telemetry.db".into(),
            purge_on_restart: false,
            synchronous: "NORMAL".into(),
            journal_size_limit: 1_000_000,
        },
        deferral: DeferralPolicy::default(),
        always_repair: false,
        helper_dir,
        mount_backend: MountBackend::UserFs,
        console_user_proxy_present: true,
        base_system_image_creator: false,
    }
}

fn usb_descriptor() -> Descriptor {
    let mut d = Descriptor::new();
    d.set(DescriptorKey::DevicePath, DescriptorValue::String("/dev/sdb1".into()));
    d.set(DescriptorKey::DeviceRemovable, DescriptorValue::Bool(true));
    d.set(DescriptorKey::DeviceWritable, DescriptorValue::Bool(true));
    d.set(DescriptorKey::MediaName, DescriptorValue::String("USB".into()));
    d.set(DescriptorKey::VolumeName, DescriptorValue::String("USB".into()));
    d.set(DescriptorKey::VolumeKind, DescriptorValue::String("hfs".into()));
    d.set(DescriptorKey::VolumeMountable, DescriptorValue::Bool(true));
    d
}

/// Sends `cmd` and awaits its reply, panicking if the event loop dropped
/// the reply channel (it shouldn't, for the lifetime of these tests).
async fn call<T>(
    cmd_tx: &mpsc::UnboundedSender<DaemonCommand>,
    make: impl FnOnce(oneshot::Sender<T>) -> DaemonCommand,
) -> T {
    let (tx, rx) = oneshot::channel();
    cmd_tx.send(make(tx)).ok().unwrap();
    rx.await.expect("daemon event loop dropped the reply channel")
}

/// S1: a lone approving session gets a directory created, the helper
/// invoked with the untrusted-removable option set, and the descriptor
/// updated before the stage reaches `StagedAppear`. Driven end-to-end
/// through the same `DaemonCommand`/`KernelEvent` surface `main.rs` wires
/// the RPC server and kernel event source onto, rather than calling the
/// Stage Engine directly, since mount-approval solicitation now spans a
/// real round trip through the session's callback queue.
#[tokio::test]
async fn s1_hot_plug_automatic_mount() {
    let helper_dir = tempfile::tempdir().unwrap();
    let mount_root = tempfile::tempdir().unwrap();
    write_helper(
        helper_dir.path(),
        "mount",
        "#!/bin/sh\nmkdir -p \"$4\"\necho \"$@\" > \"$4/.mount-args\"\nexit 0\n",
    );

    let mut config = test_config(helper_dir.path().to_path_buf(), mount_root.path().to_path_buf());
    // This scenario is about approval gating and option composition, not
    // the console-user deferral policy; disable deferral so the mount
    // proceeds without a simulated login.
    config.deferral = DeferralPolicy { removable: false, internal: false, external: false };
    let daemon = Rc::new(RefCell::new(Daemon::new(config, MountMap::default(), None)));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (kernel_tx, kernel_rx) = mpsc::unbounded_channel();
    let (_console_tx, console_rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            tokio::task::spawn_local(daemon::run(Rc::clone(&daemon), cmd_rx, kernel_rx, console_rx, Arc::clone(&shutdown)));

            let session_id = call(&cmd_tx, |reply| DaemonCommand::SessionCreate { client_name: "approver".into(), pid: 1, reply }).await;
            call(&cmd_tx, |reply| DaemonCommand::SessionRegisterCallback {
                session_id,
                callback: Callback {
                    kind: CallbackKind::DiskMountApproval,
                    order: 0,
                    address: session_id,
                    context: 0,
                    match_dict: None,
                    watch_set: None,
                    sequence: 0,
                },
                reply,
            })
            .await
            .unwrap();

            kernel_tx
                .send(KernelEvent::MediaAppeared { kernel_object: "disk2s1".into(), unit_id: None, descriptor: usb_descriptor() })
                .unwrap();

            // Poll the session's queue until the mount-approval solicitation
            // lands, then approve it.
            let response_id = loop {
                let invocations = call(&cmd_tx, |reply| DaemonCommand::SessionCopyCallbackQueue { session_id, reply }).await.unwrap();
                if let Some(inv) = invocations.iter().find(|i| i.kind == CallbackKind::DiskMountApproval as i32) {
                    break inv.response_id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            call(&cmd_tx, |reply| DaemonCommand::SessionQueueResponse { session_id, response_id, dissent: None, reply }).await.unwrap();

            // Poll the disk's descriptor until the mount has landed.
            loop {
                let descriptor = call(&cmd_tx, |reply| DaemonCommand::DiskCopyDescription { disk_id: "disk2s1".into(), reply }).await.unwrap();
                if descriptor.volume_path().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

    let d = daemon.borrow();
    let disk = d.disks.lookup("disk2s1").unwrap();
    assert!(disk.state.contains(DiskState::STAGED_MOUNT));
    let volume_path = disk.descriptor.volume_path().expect("volume path set after mount");
    let mount_point = volume_path.to_file_path().unwrap();
    assert_eq!(mount_point.parent(), Some(mount_root.path()));
    assert!(mount_point.join(".mount-args").exists());
    let args = std::fs::read_to_string(mount_point.join(".mount-args")).unwrap();
    assert!(args.contains("nosuid"));
    assert!(args.contains("noowners"));
    assert!(args.contains("nodev"));
}

/// S2: same hot-plug setup as S1, but the lone subscribed session dissents
/// with `NotPermitted`. Expected: no mount point, no mount helper
/// invocation, the disk is still delivered as appeared (mount is
/// optional), and a subsequent re-queue of the mount without dissent
/// succeeds.
#[tokio::test]
async fn s2_dissent_blocks_mount_without_side_effects() {
    let helper_dir = tempfile::tempdir().unwrap();
    let mount_root = tempfile::tempdir().unwrap();
    write_helper(
        helper_dir.path(),
        "mount",
        "#!/bin/sh\nmkdir -p \"$4\"\necho \"$@\" > \"$4/.mount-args\"\nexit 0\n",
    );

    let mut config = test_config(helper_dir.path().to_path_buf(), mount_root.path().to_path_buf());
    config.deferral = DeferralPolicy { removable: false, internal: false, external: false };
    let daemon = Rc::new(RefCell::new(Daemon::new(config, MountMap::default(), None)));

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (kernel_tx, kernel_rx) = mpsc::unbounded_channel();
    let (_console_tx, console_rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            tokio::task::spawn_local(daemon::run(Rc::clone(&daemon), cmd_rx, kernel_rx, console_rx, Arc::clone(&shutdown)));

            let session_id = call(&cmd_tx, |reply| DaemonCommand::SessionCreate { client_name: "dissenter".into(), pid: 1, reply }).await;
            call(&cmd_tx, |reply| DaemonCommand::SessionRegisterCallback {
                session_id,
                callback: Callback {
                    kind: CallbackKind::DiskMountApproval,
                    order: 0,
                    address: session_id,
                    context: 0,
                    match_dict: None,
                    watch_set: None,
                    sequence: 0,
                },
                reply,
            })
            .await
            .unwrap();

            kernel_tx
                .send(KernelEvent::MediaAppeared { kernel_object: "disk2s1".into(), unit_id: None, descriptor: usb_descriptor() })
                .unwrap();

            let response_id = loop {
                let invocations = call(&cmd_tx, |reply| DaemonCommand::SessionCopyCallbackQueue { session_id, reply }).await.unwrap();
                if let Some(inv) = invocations.iter().find(|i| i.kind == CallbackKind::DiskMountApproval as i32) {
                    break inv.response_id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            call(&cmd_tx, |reply| DaemonCommand::SessionQueueResponse {
                session_id,
                response_id,
                dissent: Some(shared::errors::ArbitrationError::NotPermitted("operator declined".into())),
                reply,
            })
            .await
            .unwrap();

            // Poll until the disk reaches StagedAppear without ever mounting.
            loop {
                let descriptor = call(&cmd_tx, |reply| DaemonCommand::DiskCopyDescription { disk_id: "disk2s1".into(), reply }).await.unwrap();
                if descriptor.volume_path().is_some() {
                    panic!("dissented mount must not have landed a volume path");
                }
                let appeared = {
                    let d = daemon.borrow();
                    d.disks.lookup("disk2s1").map(|d| d.state.contains(DiskState::STAGED_APPEAR)).unwrap_or(false)
                };
                if appeared {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            {
                let d = daemon.borrow();
                let disk = d.disks.lookup("disk2s1").unwrap();
                assert!(!disk.state.contains(DiskState::STAGED_MOUNT));
                assert!(disk.descriptor.volume_path().is_none());
            }
            assert!(!mount_root.path().read_dir().unwrap().next().is_some(), "no mount point directory should have been created");

            // Re-queue the mount with the same session, this time approving.
            // The reply only arrives once the approval gate resolves, so it
            // is sent without being awaited yet — poll for the solicitation
            // and respond to it first, the same way the automatic path did.
            let (reply_tx, reply_rx) = oneshot::channel();
            cmd_tx
                .send(DaemonCommand::SessionQueueRequest {
                    session_id,
                    kind: shared::proto::request::RequestKind::Mount,
                    disk_id: "disk2s1".into(),
                    options: 0,
                    argument1: String::new(),
                    argument2: String::new(),
                    address: 0,
                    context: 0,
                    caller_euid: 0,
                    caller_egid: 0,
                    reply: reply_tx,
                })
                .unwrap();

            let response_id = loop {
                let invocations = call(&cmd_tx, |reply| DaemonCommand::SessionCopyCallbackQueue { session_id, reply }).await.unwrap();
                if let Some(inv) = invocations.iter().find(|i| i.kind == CallbackKind::DiskMountApproval as i32) {
                    break inv.response_id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };
            call(&cmd_tx, |reply| DaemonCommand::SessionQueueResponse { session_id, response_id, dissent: None, reply }).await.unwrap();

            let (_request_id, result) = reply_rx.await.expect("daemon dropped the re-queue reply");
            result.expect("re-queued mount without dissent must succeed");
        })
        .await;

    let d = daemon.borrow();
    let disk = d.disks.lookup("disk2s1").unwrap();
    assert!(disk.descriptor.volume_path().is_some(), "re-queue without dissent must succeed");
}

/// S3: a repair helper reporting a dirty volume on an automatic mount is
/// retried exactly once, forced and read-only, and the retry succeeds.
#[tokio::test]
async fn s3_dirty_auto_retry() {
    let helper_dir = tempfile::tempdir().unwrap();
    let mount_root = tempfile::tempdir().unwrap();
    // First call (no "force"/"rdonly" combo yet in $1) reports dirty via
    // stderr; the retry carries both and succeeds.
    write_helper(
        helper_dir.path(),
        "mount",
        "#!/bin/sh\ncase \"$2\" in\n  *force*rdonly*|*rdonly*force*) mkdir -p \"$4\"; exit 0 ;;\n  *) echo EDIRTY >&2; exit 1 ;;\nesac\n",
    );

    let config = test_config(helper_dir.path().to_path_buf(), mount_root.path().to_path_buf());
    let daemon = Rc::new(RefCell::new(Daemon::new(config, MountMap::default(), None)));

    let mut disk = Disk::new("disk3s2", usb_descriptor());
    disk.state |= DiskState::STAGED_PROBE | DiskState::MOUNT_AUTOMATIC_NODEFER;
    daemon.borrow_mut().disks.insert(disk).unwrap();

    let outcome = advance_mount(&daemon, "disk3s2", true, false).await;
    assert!(matches!(outcome, AdvanceOutcome::ReachedAppear));

    let d = daemon.borrow();
    let disk = d.disks.lookup("disk3s2").unwrap();
    assert!(disk.descriptor.volume_path().is_some(), "retry must have mounted the volume");
    assert!(disk.descriptor.is_writable(), "descriptor keeps MediaWritable=true even though the mount is read-only");
}

/// S6: a target-disk-mode-locked disk is refused before any helper runs,
/// unless its content role is PreBoot.
#[tokio::test]
async fn s6_tdm_locked_refusal_unless_preboot() {
    let helper_dir = tempfile::tempdir().unwrap();
    let mount_root = tempfile::tempdir().unwrap();
    // If the mount helper were invoked for the locked disk this test would
    // fail, since this script always errors out.
    write_helper(helper_dir.path(), "mount", "#!/bin/sh\nexit 1\n");

    let config = test_config(helper_dir.path().to_path_buf(), mount_root.path().to_path_buf());
    let daemon = Rc::new(RefCell::new(Daemon::new(config, MountMap::default(), None)));

    let mut locked = usb_descriptor();
    locked.set(DescriptorKey::DeviceTdmLocked, DescriptorValue::Bool(true));
    let mut disk = Disk::new("disk6", locked);
    disk.state |= DiskState::STAGED_PROBE;
    daemon.borrow_mut().disks.insert(disk).unwrap();

    let outcome = advance_mount(&daemon, "disk6", true, false).await;
    assert!(matches!(outcome, AdvanceOutcome::Failed(shared::errors::ArbitrationError::NotPermitted(_))));

    let mut preboot = usb_descriptor();
    preboot.set(DescriptorKey::DeviceTdmLocked, DescriptorValue::Bool(true));
    preboot.set(DescriptorKey::MediaContentRole, DescriptorValue::String("PreBoot".into()));
    let mut disk = Disk::new("disk6-preboot", preboot);
    disk.state |= DiskState::STAGED_PROBE | DiskState::MOUNT_AUTOMATIC_NODEFER;
    daemon.borrow_mut().disks.insert(disk).unwrap();

    write_helper(
        helper_dir.path(),
        "mount",
        "#!/bin/sh\nmkdir -p \"$4\"\nexit 0\n",
    );
    let outcome = advance_mount(&daemon, "disk6-preboot", true, false).await;
    assert!(matches!(outcome, AdvanceOutcome::ReachedAppear));
}

/// S4 (queue-crossing): a disappearance followed by a re-appearance under
/// the same id, delivered back-to-back through `IngestContext`, leaves one
/// registry entry carrying the newest descriptor with a signal queued for
/// the Stage Engine, not two conflicting entries or a leaked zombie.
#[test]
fn s4_queue_crossing_reappearance_replaces_disk() {
    let mut disks = DiskRegistry::new();
    let mut units = UnitRegistry::new();
    let mut sessions = SessionRegistry::new();
    let mut dispatcher = CallbackDispatcher::new();
    let mut stage_queue = StageQueue::default();
    let mut ctx = IngestContext {
        disks: &mut disks,
        units: &mut units,
        sessions: &mut sessions,
        dispatcher: &mut dispatcher,
        stage_queue: &mut stage_queue,
    };

    handle_appearance(&mut ctx, "disk4".into(), None, usb_descriptor());
    assert_eq!(stage_queue.pop().as_deref(), Some("disk4"));

    let mut updated = usb_descriptor();
    updated.set(DescriptorKey::VolumeName, DescriptorValue::String("USB-renamed".into()));
    let mut ctx = IngestContext {
        disks: &mut disks,
        units: &mut units,
        sessions: &mut sessions,
        dispatcher: &mut dispatcher,
        stage_queue: &mut stage_queue,
    };
    handle_appearance(&mut ctx, "disk4".into(), None, updated);

    assert_eq!(disks.lookup("disk4").unwrap().descriptor.volume_name(), Some("USB-renamed"));
}

/// S5: the console user's last logout unmounts every deferred-policy disk
/// still mounted, and, for a disk backing an LVM logical-volume family,
/// locks that family afterward (spec.md §4.6).
///
/// `stage::mount::unmount` shells out to a bare `umount` resolved via
/// `$PATH` rather than `config.helper_dir` (unlike the mount helper), so
/// this test prepends `helper_dir` onto `PATH` for its duration to stub it;
/// `lock_logical_volume_family`'s `vgchange` invocation already resolves
/// through the absolute `helper_dir` path and needs no such shim.
#[tokio::test]
async fn s5_logout_unmount_locks_logical_volume_family() {
    let helper_dir = tempfile::tempdir().unwrap();
    let mount_root = tempfile::tempdir().unwrap();
    write_helper(helper_dir.path(), "umount", "#!/bin/sh\nexit 0\n");
    write_helper(
        helper_dir.path(),
        "vgchange",
        "#!/bin/sh\necho \"$@\" > \"$DISKARBD_TEST_VGCHANGE_MARKER\"\nexit 0\n",
    );

    let marker = mount_root.path().join(".vgchange-args");
    std::env::set_var("DISKARBD_TEST_VGCHANGE_MARKER", &marker);
    let original_path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{}", helper_dir.path().display(), original_path));

    let config = test_config(helper_dir.path().to_path_buf(), mount_root.path().to_path_buf());
    let daemon = Rc::new(RefCell::new(Daemon::new(config, MountMap::default(), None)));

    let mounted_at = mount_root.path().join("lvdisk");
    let mut descriptor = usb_descriptor();
    descriptor.set(
        DescriptorKey::VolumePath,
        DescriptorValue::Url(url::Url::from_file_path(&mounted_at).unwrap()),
    );
    descriptor.set(DescriptorKey::DeviceLogicalVolumeFamily, DescriptorValue::String("vg0".into()));
    let disk = Disk::new("disk5", descriptor);
    daemon.borrow_mut().disks.insert(disk).unwrap();

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (_kernel_tx, kernel_rx) = mpsc::unbounded_channel();
    let (console_tx, console_rx) = mpsc::unbounded_channel();
    let shutdown = Arc::new(Notify::new());

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            tokio::task::spawn_local(daemon::run(Rc::clone(&daemon), cmd_rx, kernel_rx, console_rx, Arc::clone(&shutdown)));

            let alice = diskarbd::console_user::ConsoleUser { uid: 501, name: "alice".into() };
            console_tx.send(diskarbd::console_user::ConsoleUserEvent::LoggedIn(alice.clone())).unwrap();
            console_tx.send(diskarbd::console_user::ConsoleUserEvent::LoggedOut(alice)).unwrap();

            loop {
                let descriptor = call(&cmd_tx, |reply| DaemonCommand::DiskCopyDescription { disk_id: "disk5".into(), reply }).await.unwrap();
                if descriptor.volume_path().is_none() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            // The family lock runs fire-and-forget after the unmount
            // resolves; poll for its marker file rather than assuming it
            // landed the instant the volume path cleared.
            for _ in 0..200 {
                if marker.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

    std::env::set_var("PATH", original_path);
    std::env::remove_var("DISKARBD_TEST_VGCHANGE_MARKER");

    assert!(marker.exists(), "logout-triggered unmount must lock the disk's logical-volume family");
    let args = std::fs::read_to_string(&marker).unwrap();
    assert!(args.contains("--lock-vg"));
    assert!(args.contains("vg0"));
}
