//! End-to-end launch of a FunctionFS service handler.
//!
//! Uses a plain directory in place of a FunctionFS mount: descriptor writes
//! land in a regular `ep0` file and the handler is a shell script reporting
//! its activation environment and fd table.

use nix::sys::wait::{waitpid, WaitStatus};
use std::{fs, os::unix::fs::PermissionsExt, sync::Arc};

use gadgetd::{
    ffs::{blocks::FfsEvent, service::load_service, FfsFunction, FfsState},
    Error,
};

#[test]
fn activation_launches_handler() {
    let tmp = tempfile::tempdir().unwrap();

    let mount = tmp.path().join("mount");
    fs::create_dir(&mount).unwrap();
    for ep in ["ep0", "ep1", "ep2"] {
        fs::write(mount.join(ep), b"").unwrap();
    }

    let out = tmp.path().join("out");
    let script = tmp.path().join("handler.sh");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\n\
             echo \"$LISTEN_FDS $LISTEN_PID $ACTIVATION_EVENT $$\" > \"{out}\"\n\
             for fd in 3 4 5; do\n\
                 if [ -e \"/proc/self/fd/$fd\" ]; then echo \"open $fd\" >> \"{out}\"; fi\n\
             done\n",
            out = out.display()
        ),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let service_file = tmp.path().join("echo");
    fs::write(
        &service_file,
        format!(
            r#"
            activation_event = "FUNCTIONFS_ENABLE"
            exec = "{exec}"

            [[descriptors.fs_desc]]
            type = "INTERFACE_DESC"
            bInterfaceClass = "USB_CLASS_VENDOR_SPEC"

            [[descriptors.fs_desc]]
            type = "EP_NO_AUDIO_DESC"
            address = 1
            direction = "in"
            bmAttributes = 2

            [[descriptors.fs_desc]]
            type = "EP_NO_AUDIO_DESC"
            address = 2
            direction = "out"
            bmAttributes = 2
            "#,
            exec = script.display()
        ),
    )
    .unwrap();

    let service = Arc::new(load_service(&service_file).unwrap());
    let mut func = FfsFunction::with_prepared(&service, &mount).unwrap();
    assert_eq!(func.state(), FfsState::Ready);

    // Descriptors and strings were written into ep0.
    assert!(fs::metadata(mount.join("ep0")).unwrap().len() > 0);

    // The service allows a single instance only.
    assert!(matches!(FfsFunction::with_prepared(&service, &mount), Err(Error::Other(_))));
    assert_eq!(func.state(), FfsState::Ready);

    assert!(func.handle_event(FfsEvent::Bind).unwrap());
    assert_eq!(func.state(), FfsState::Bound);

    assert!(!func.handle_event(FfsEvent::Enable).unwrap());
    assert_eq!(func.state(), FfsState::Running);
    assert!(func.ep0().is_none());

    let pid = func.child().expect("child pid recorded");
    match waitpid(pid, None).unwrap() {
        WaitStatus::Exited(_, code) => assert_eq!(code, 0),
        status => panic!("unexpected child status {status:?}"),
    }

    let report = fs::read_to_string(&out).unwrap();
    let mut lines = report.lines();
    let head: Vec<String> = lines.next().unwrap().split_whitespace().map(str::to_string).collect();
    assert_eq!(head[0], "3", "ep0 plus two data endpoints");
    assert_eq!(head[1], pid.to_string(), "LISTEN_PID names the handler process");
    assert_eq!(head[2], FfsEvent::Enable.code().to_string());
    assert_eq!(head[1], head[3], "handler sees its own pid");

    let fds: Vec<&str> = lines.collect();
    assert_eq!(fds, ["open 3", "open 4", "open 5"]);
}
