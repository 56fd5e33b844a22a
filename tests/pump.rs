//! Event pump behavior against a daemon with a fake kernel store.

use std::{
    collections::HashMap,
    fs,
    os::fd::{AsRawFd, OwnedFd},
    sync::{Arc, Mutex},
    time::Duration,
};

use gadgetd::{
    config::DaemonConfig,
    configfs::GadgetFs,
    core::Daemon,
    ffs::blocks::{Event, FfsEvent},
    probe::{KernelFunction, KernelFunctionType},
    pump::EventPump,
    registry::FunctionRegistry,
};

fn daemon(tmp: &tempfile::TempDir) -> Arc<Mutex<Daemon>> {
    fs::create_dir(tmp.path().join("usb_gadget")).unwrap();
    let gadget_fs = GadgetFs::new(tmp.path()).unwrap();

    let mut registry = FunctionRegistry::new();
    registry.register(Arc::new(KernelFunctionType::new(KernelFunction::Acm))).unwrap();

    Arc::new(Mutex::new(Daemon::new(DaemonConfig::default(), gadget_fs, registry, Vec::new())))
}

fn event_bytes(event: FfsEvent) -> [u8; Event::SIZE] {
    let mut raw = [0u8; Event::SIZE];
    raw[8] = event.code();
    raw
}

#[tokio::test]
async fn watch_ends_after_dispatch_declines() {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = daemon(&tmp);

    let function = {
        let mut daemon = daemon.lock().unwrap();
        daemon.create_gadget("g1", &HashMap::new(), &HashMap::new()).unwrap();
        daemon.create_function("g1", "acm", "tty0").unwrap()
    };

    let (rx, tx) = nix::unistd::pipe().unwrap();
    let rx: Arc<OwnedFd> = Arc::new(rx);

    let pump = Arc::new(EventPump::new());
    pump.register(daemon.clone(), "g1".to_string(), function.id, rx.clone());
    assert_eq!(pump.len(), 1);

    // A kernel function has no ep0 protocol; dispatch declines and the
    // watch winds down.
    nix::unistd::write(&tx, &event_bytes(FfsEvent::Bind)).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !pump.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("watch did not wind down");
}

#[tokio::test]
async fn deregister_drops_watch() {
    let tmp = tempfile::tempdir().unwrap();
    let daemon = daemon(&tmp);

    let function = {
        let mut daemon = daemon.lock().unwrap();
        daemon.create_gadget("g1", &HashMap::new(), &HashMap::new()).unwrap();
        daemon.create_function("g1", "acm", "tty0").unwrap()
    };

    let (rx, _tx) = nix::unistd::pipe().unwrap();
    let rx: Arc<OwnedFd> = Arc::new(rx);
    let fd = rx.as_raw_fd();

    let pump = Arc::new(EventPump::new());
    pump.register(daemon.clone(), "g1".to_string(), function.id, rx);
    assert_eq!(pump.len(), 1);

    pump.deregister(fd);
    assert!(pump.is_empty());
}
