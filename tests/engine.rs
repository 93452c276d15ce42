//! Lifecycle engine tests over an in-memory BlockOps fake.
//!
//! The fake records every call so tests can assert the exact forward and
//! compensating call order the engine issues.

use async_trait::async_trait;
use rbdvol::config::{DaemonConfig, RemoveAction};
use rbdvol::rbd::{BlockError, BlockOps};
use rbdvol::shell::ShellTimeout;
use rbdvol::volume::api::CreateOptions;
use rbdvol::volume::driver::VolumeDriver;
use rbdvol::volume::engine::LifecycleEngine;
use rbdvol::volume::error::PluginError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    ImageExists(String, String),
    CreateImage(String, String, u64, String),
    RemoveImage(String, String),
    RenameImage(String, String, String),
    Lock(String, String, String),
    Unlock(String, String, String),
    Map(String, String),
    Unmap(PathBuf),
    Detect(PathBuf),
    Verify(PathBuf, String),
    Mount(PathBuf, PathBuf, String),
    Unmount(PathBuf),
    ListImages(String),
}

#[derive(Default)]
struct FakeOps {
    calls: Mutex<Vec<Call>>,
    exists: AtomicBool,
    images: Vec<String>,
    fail_lock: bool,
    fail_map: bool,
    fail_verify: bool,
    fail_mount: bool,
    fail_unmount: bool,
    busy_unmap: bool,
}

impl FakeOps {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn set_exists(&self, exists: bool) {
        self.exists.store(exists, Ordering::SeqCst);
    }

    fn injected() -> BlockError {
        BlockError::Io(std::io::Error::other("injected failure"))
    }
}

#[async_trait]
impl BlockOps for FakeOps {
    async fn image_exists(&self, pool: &str, image: &str) -> Result<bool, BlockError> {
        self.record(Call::ImageExists(pool.into(), image.into()));
        Ok(self.exists.load(Ordering::SeqCst))
    }

    async fn create_image(
        &self,
        pool: &str,
        image: &str,
        size_mb: u64,
        fstype: &str,
    ) -> Result<(), BlockError> {
        self.record(Call::CreateImage(
            pool.into(),
            image.into(),
            size_mb,
            fstype.into(),
        ));
        Ok(())
    }

    async fn remove_image(&self, pool: &str, image: &str) -> Result<(), BlockError> {
        self.record(Call::RemoveImage(pool.into(), image.into()));
        Ok(())
    }

    async fn rename_image(
        &self,
        pool: &str,
        image: &str,
        new_name: &str,
    ) -> Result<(), BlockError> {
        self.record(Call::RenameImage(pool.into(), image.into(), new_name.into()));
        Ok(())
    }

    async fn lock_image(&self, pool: &str, image: &str, cookie: &str) -> Result<(), BlockError> {
        self.record(Call::Lock(pool.into(), image.into(), cookie.into()));
        if self.fail_lock {
            return Err(Self::injected());
        }
        Ok(())
    }

    async fn unlock_image(&self, pool: &str, image: &str, cookie: &str) -> Result<(), BlockError> {
        self.record(Call::Unlock(pool.into(), image.into(), cookie.into()));
        Ok(())
    }

    async fn map_image(&self, pool: &str, image: &str) -> Result<PathBuf, BlockError> {
        self.record(Call::Map(pool.into(), image.into()));
        if self.fail_map {
            return Err(Self::injected());
        }
        Ok(PathBuf::from(format!("/dev/rbd/{pool}/{image}")))
    }

    async fn unmap_device(&self, device: &Path) -> Result<(), BlockError> {
        self.record(Call::Unmap(device.to_path_buf()));
        if self.busy_unmap {
            return Err(BlockError::Busy(device.to_path_buf()));
        }
        Ok(())
    }

    async fn detect_fstype(&self, device: &Path) -> Result<Option<String>, BlockError> {
        self.record(Call::Detect(device.to_path_buf()));
        Ok(Some("xfs".to_string()))
    }

    async fn verify_fs(
        &self,
        device: &Path,
        fstype: &str,
        _mountpoint: &Path,
    ) -> Result<(), BlockError> {
        self.record(Call::Verify(device.to_path_buf(), fstype.into()));
        if self.fail_verify {
            return Err(BlockError::Corrupt {
                device: device.to_path_buf(),
                detail: "injected corruption".into(),
            });
        }
        Ok(())
    }

    async fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        fstype: &str,
    ) -> Result<(), BlockError> {
        self.record(Call::Mount(
            device.to_path_buf(),
            mountpoint.to_path_buf(),
            fstype.into(),
        ));
        if self.fail_mount {
            return Err(Self::injected());
        }
        Ok(())
    }

    async fn unmount(&self, device: &Path) -> Result<(), BlockError> {
        self.record(Call::Unmount(device.to_path_buf()));
        if self.fail_unmount {
            return Err(Self::injected());
        }
        Ok(())
    }

    async fn list_images(&self, pool: &str) -> Result<Vec<String>, BlockError> {
        self.record(Call::ListImages(pool.into()));
        Ok(self.images.clone())
    }
}

const LOCKER: &str = "testhost";

fn harness(
    ops: FakeOps,
    tweak: impl FnOnce(&mut DaemonConfig),
) -> (Arc<FakeOps>, LifecycleEngine, TempDir) {
    let root = TempDir::new().unwrap();
    let mut config = DaemonConfig {
        plugin_name: "rbd".into(),
        socket_dir: PathBuf::from("/run/docker/plugins"),
        pool: "rbd".into(),
        user: "admin".into(),
        size_mb: 20480,
        fstype: "xfs".into(),
        mount_root: root.path().to_path_buf(),
        remove_action: RemoveAction::Ignore,
        can_create: false,
        shell_timeout: ShellTimeout::default(),
    };
    tweak(&mut config);
    let ops = Arc::new(ops);
    let engine = LifecycleEngine::new(config, ops.clone(), LOCKER.into());
    (ops, engine, root)
}

fn existing() -> FakeOps {
    FakeOps {
        exists: AtomicBool::new(true),
        ..Default::default()
    }
}

fn device(pool: &str, image: &str) -> PathBuf {
    PathBuf::from(format!("/dev/rbd/{pool}/{image}"))
}

#[tokio::test]
async fn mount_then_unmount_reverses_the_pipeline() {
    let (ops, engine, root) = harness(existing(), |_| {});

    let mp = engine.mount("foo", "c1").await.unwrap();
    assert_eq!(mp, root.path().join("rbd").join("foo"));
    assert!(mp.is_dir());

    let dev = device("rbd", "foo");
    assert_eq!(
        ops.calls(),
        vec![
            Call::Lock("rbd".into(), "foo".into(), LOCKER.into()),
            Call::Map("rbd".into(), "foo".into()),
            Call::Detect(dev.clone()),
            Call::Verify(dev.clone(), "xfs".into()),
            Call::Mount(dev.clone(), mp.clone(), "xfs".into()),
        ]
    );

    ops.clear();
    engine.unmount("foo", "c1").await.unwrap();
    assert_eq!(
        ops.calls(),
        vec![
            Call::Unmount(dev.clone()),
            Call::Unmap(dev.clone()),
            Call::Unlock("rbd".into(), "foo".into(), LOCKER.into()),
        ]
    );

    // Registry is back to its pre-mount state.
    assert_eq!(engine.get("foo").await.unwrap().mountpoint, "");
}

#[tokio::test]
async fn mount_uses_the_named_pool() {
    let (ops, engine, root) = harness(existing(), |_| {});

    let mp = engine.mount("liverpool/foo", "c1").await.unwrap();
    assert_eq!(mp, root.path().join("liverpool").join("foo"));
    assert_eq!(
        ops.calls()[0],
        Call::Lock("liverpool".into(), "foo".into(), LOCKER.into())
    );
}

#[tokio::test]
async fn lock_denied_stops_the_pipeline() {
    let (ops, engine, _root) = harness(
        FakeOps {
            exists: AtomicBool::new(true),
            fail_lock: true,
            ..Default::default()
        },
        |_| {},
    );

    let err = engine.mount("foo", "c1").await.unwrap_err();
    assert!(matches!(err, PluginError::LockDenied { .. }));
    assert_eq!(
        ops.calls(),
        vec![Call::Lock("rbd".into(), "foo".into(), LOCKER.into())]
    );
}

#[tokio::test]
async fn failed_map_releases_the_lock() {
    let (ops, engine, _root) = harness(
        FakeOps {
            exists: AtomicBool::new(true),
            fail_map: true,
            ..Default::default()
        },
        |_| {},
    );

    let err = engine.mount("foo", "c1").await.unwrap_err();
    assert!(matches!(err, PluginError::MapFailed { .. }));
    assert_eq!(
        ops.calls(),
        vec![
            Call::Lock("rbd".into(), "foo".into(), LOCKER.into()),
            Call::Map("rbd".into(), "foo".into()),
            Call::Unlock("rbd".into(), "foo".into(), LOCKER.into()),
        ]
    );
}

#[tokio::test]
async fn failed_verification_unwinds_map_and_lock() {
    let (ops, engine, _root) = harness(
        FakeOps {
            exists: AtomicBool::new(true),
            fail_verify: true,
            ..Default::default()
        },
        |_| {},
    );

    let err = engine.mount("foo", "c1").await.unwrap_err();
    assert!(matches!(err, PluginError::FsCorrupt { .. }));

    let dev = device("rbd", "foo");
    assert_eq!(
        ops.calls(),
        vec![
            Call::Lock("rbd".into(), "foo".into(), LOCKER.into()),
            Call::Map("rbd".into(), "foo".into()),
            Call::Detect(dev.clone()),
            Call::Verify(dev.clone(), "xfs".into()),
            Call::Unmap(dev.clone()),
            Call::Unlock("rbd".into(), "foo".into(), LOCKER.into()),
        ]
    );
}

#[tokio::test]
async fn failed_mount_unwinds_and_leaves_no_record() {
    let (ops, engine, _root) = harness(
        FakeOps {
            exists: AtomicBool::new(true),
            fail_mount: true,
            ..Default::default()
        },
        |_| {},
    );

    let err = engine.mount("foo", "c1").await.unwrap_err();
    assert!(matches!(err, PluginError::MountFailed { .. }));

    let dev = device("rbd", "foo");
    let calls = ops.calls();
    let mountpoint = calls
        .iter()
        .find_map(|c| match c {
            Call::Mount(_, mp, _) => Some(mp.clone()),
            _ => None,
        })
        .expect("no Mount call recorded");
    assert_eq!(
        calls[calls.len() - 3..].to_vec(),
        vec![
            Call::Mount(dev.clone(), mountpoint, "xfs".into()),
            Call::Unmap(dev.clone()),
            Call::Unlock("rbd".into(), "foo".into(), LOCKER.into()),
        ]
    );

    assert_eq!(engine.get("foo").await.unwrap().mountpoint, "");
}

#[tokio::test]
async fn unmount_from_stale_client_is_ignored() {
    let (ops, engine, root) = harness(existing(), |_| {});

    let mp = engine.mount("foo", "c1").await.unwrap();
    ops.clear();

    engine.unmount("foo", "c2").await.unwrap();
    assert!(ops.calls().is_empty(), "no teardown for a stale client");

    // The record survives under the original client.
    assert_eq!(
        engine.get("foo").await.unwrap().mountpoint,
        mp.display().to_string()
    );
    drop(root);
}

#[tokio::test]
async fn unmount_of_unknown_volume_succeeds_silently() {
    let (ops, engine, _root) = harness(existing(), |_| {});

    engine.unmount("foo", "c1").await.unwrap();
    assert!(ops.calls().is_empty());
}

#[tokio::test]
async fn busy_device_aborts_teardown() {
    let (ops, engine, root) = harness(
        FakeOps {
            exists: AtomicBool::new(true),
            busy_unmap: true,
            ..Default::default()
        },
        |_| {},
    );

    let mp = engine.mount("foo", "c1").await.unwrap();
    ops.clear();

    let err = engine.unmount("foo", "c1").await.unwrap_err();
    assert!(matches!(err, PluginError::Busy(_)));

    let dev = device("rbd", "foo");
    // No unlock after Busy: the volume is still in use.
    assert_eq!(
        ops.calls(),
        vec![Call::Unmount(dev.clone()), Call::Unmap(dev.clone())]
    );

    // The record stays so a later Unmount can finish the job.
    assert_eq!(
        engine.get("foo").await.unwrap().mountpoint,
        mp.display().to_string()
    );
    drop(root);
}

#[tokio::test]
async fn teardown_errors_accumulate_but_do_not_stop() {
    let (ops, engine, _root) = harness(
        FakeOps {
            exists: AtomicBool::new(true),
            fail_unmount: true,
            ..Default::default()
        },
        |_| {},
    );

    engine.mount("foo", "c1").await.unwrap();
    ops.clear();

    let err = engine.unmount("foo", "c1").await.unwrap_err();
    assert!(matches!(err, PluginError::Teardown(_)));
    assert!(err.to_string().contains("unmount error"));

    let dev = device("rbd", "foo");
    assert_eq!(
        ops.calls(),
        vec![
            Call::Unmount(dev.clone()),
            Call::Unmap(dev.clone()),
            Call::Unlock("rbd".into(), "foo".into(), LOCKER.into()),
        ]
    );

    // The entry is gone even though teardown reported errors.
    assert_eq!(engine.get("foo").await.unwrap().mountpoint, "");
}

#[tokio::test]
async fn create_without_provisioning_reports_missing_image() {
    let (ops, engine, _root) = harness(FakeOps::default(), |_| {});

    let err = engine
        .create("foo", CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Ceph RBD Image not found: foo");
    assert_eq!(
        ops.calls(),
        vec![Call::ImageExists("rbd".into(), "foo".into())]
    );
}

#[tokio::test]
async fn create_of_existing_image_is_idempotent() {
    let (ops, engine, _root) = harness(existing(), |_| {});

    engine.create("foo", CreateOptions::default()).await.unwrap();
    assert_eq!(
        ops.calls(),
        vec![Call::ImageExists("rbd".into(), "foo".into())]
    );
}

#[tokio::test]
async fn create_overlays_docker_options() {
    let (ops, engine, _root) = harness(FakeOps::default(), |c| c.can_create = true);

    engine
        .create(
            "foo",
            CreateOptions {
                pool: Some("liverpool".into()),
                size: Some("1024".into()),
                fstype: Some("ext4".into()),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        ops.calls(),
        vec![
            Call::ImageExists("liverpool".into(), "foo".into()),
            Call::CreateImage("liverpool".into(), "foo".into(), 1024, "ext4".into()),
        ]
    );
}

#[tokio::test]
async fn create_ignores_unusable_size_option() {
    let (ops, engine, _root) = harness(FakeOps::default(), |c| c.can_create = true);

    engine
        .create(
            "foo",
            CreateOptions {
                pool: None,
                size: Some("lots".into()),
                fstype: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(
        ops.calls()[1],
        Call::CreateImage("rbd".into(), "foo".into(), 20480, "xfs".into())
    );
}

#[tokio::test]
async fn remove_with_rename_unlocks_under_the_new_name() {
    let (ops, engine, _root) = harness(existing(), |c| c.remove_action = RemoveAction::Rename);

    engine.remove("foo").await.unwrap();
    assert_eq!(
        ops.calls(),
        vec![
            Call::ImageExists("rbd".into(), "foo".into()),
            Call::Lock("rbd".into(), "foo".into(), LOCKER.into()),
            Call::RenameImage("rbd".into(), "foo".into(), "zz_foo".into()),
            Call::Unlock("rbd".into(), "zz_foo".into(), LOCKER.into()),
        ]
    );
}

#[tokio::test]
async fn remove_with_delete_removes_the_image() {
    let (ops, engine, _root) = harness(existing(), |c| c.remove_action = RemoveAction::Delete);

    engine.remove("foo").await.unwrap();
    assert_eq!(
        ops.calls(),
        vec![
            Call::ImageExists("rbd".into(), "foo".into()),
            Call::Lock("rbd".into(), "foo".into(), LOCKER.into()),
            Call::RemoveImage("rbd".into(), "foo".into()),
            Call::Unlock("rbd".into(), "foo".into(), LOCKER.into()),
        ]
    );
}

#[tokio::test]
async fn remove_of_missing_image_is_not_found() {
    let (ops, engine, _root) = harness(FakeOps::default(), |_| {});

    let err = engine.remove("foo").await.unwrap_err();
    assert!(matches!(err, PluginError::NotFound(_)));
    assert_eq!(
        ops.calls(),
        vec![Call::ImageExists("rbd".into(), "foo".into())]
    );
}

#[tokio::test]
async fn remove_drops_the_registry_entry() {
    let (ops, engine, _root) = harness(existing(), |_| {});

    engine.mount("foo", "c1").await.unwrap();
    engine.remove("foo").await.unwrap();
    ops.clear();

    assert_eq!(engine.get("foo").await.unwrap().mountpoint, "");
}

#[tokio::test]
async fn list_marks_volumes_mounted_on_this_host() {
    let (_ops, engine, root) = harness(
        FakeOps {
            exists: AtomicBool::new(true),
            images: vec!["foo".into(), "bar".into()],
            ..Default::default()
        },
        |_| {},
    );

    let mp = engine.mount("foo", "c1").await.unwrap();

    let volumes = engine.list().await.unwrap();
    let summary: Vec<(String, String)> = volumes
        .into_iter()
        .map(|v| (v.name, v.mountpoint))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("foo".to_string(), mp.display().to_string()),
            ("bar".to_string(), String::new()),
        ]
    );
    drop(root);
}

#[tokio::test]
async fn path_is_purely_computational() {
    let (ops, engine, root) = harness(FakeOps::default(), |_| {});

    let p = engine.path("liverpool/foo").await.unwrap();
    assert_eq!(p, root.path().join("liverpool").join("foo"));
    assert!(ops.calls().is_empty(), "Path must not touch BlockOps");
}

#[tokio::test]
async fn get_drops_stale_entries_for_missing_images() {
    let (ops, engine, root) = harness(existing(), |_| {});

    let mp = engine.mount("foo", "c1").await.unwrap();
    assert_eq!(
        engine.get("foo").await.unwrap().mountpoint,
        mp.display().to_string()
    );

    // The image disappears behind our back.
    ops.set_exists(false);
    let err = engine.get("foo").await.unwrap_err();
    assert!(matches!(err, PluginError::NotFound(_)));

    // Even once it is back, the stale record is gone.
    ops.set_exists(true);
    assert_eq!(engine.get("foo").await.unwrap().mountpoint, "");
    drop(root);
}

#[tokio::test]
async fn invalid_names_never_reach_the_block_layer() {
    let (ops, engine, _root) = harness(FakeOps::default(), |_| {});

    let err = engine.mount("a/b/c", "c1").await.unwrap_err();
    assert!(matches!(err, PluginError::Name(_)));
    let err = engine.create("foo@", CreateOptions::default()).await.unwrap_err();
    assert!(matches!(err, PluginError::Name(_)));
    assert!(ops.calls().is_empty());
}
