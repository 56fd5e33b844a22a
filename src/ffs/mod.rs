//! FunctionFS function types and instances.
//!
//! A [`FfsService`] is the loaded form of a declarative service file; it
//! owns the prebuilt descriptor and strings blocks and counts its live
//! instances. A [`FfsFunction`] is one mounted instance driving the
//! ep0 protocol until its activation event launches the service handler.

pub mod blocks;
pub mod service;
pub mod spawn;

use bitflags::bitflags;
use nix::{
    errno::Errno,
    unistd::{Gid, Pid, Uid},
};
use std::{
    fs,
    io::{ErrorKind, Write},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    objects::{Function, FunctionKind},
    registry::{FunctionEnv, FunctionGroup, FunctionType},
    Error, Result,
};
use blocks::FfsEvent;

bitflags! {
    /// Service option flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ServiceOptions: u32 {
        /// A second instance of the type may be created.
        const ALLOW_MULTIPLE = 1;
        /// Two instances may run at the same time. Requires
        /// [`ALLOW_MULTIPLE`](Self::ALLOW_MULTIPLE).
        const ALLOW_CONCURRENT = 2;
    }
}

/// Loaded FunctionFS service description.
#[derive(Debug)]
pub struct FfsService {
    /// Service name, taken from the file name.
    pub name: String,
    /// Program implementing the function.
    pub exec_path: PathBuf,
    /// Working directory of the handler.
    pub working_dir: Option<PathBuf>,
    /// Directory the handler is chrooted into.
    pub chroot_dir: Option<PathBuf>,
    /// User the handler runs as.
    pub uid: Option<Uid>,
    /// Group the handler runs as.
    pub gid: Option<Gid>,
    /// Option flags.
    pub options: ServiceOptions,
    /// Event that triggers the handler launch.
    pub activation_event: FfsEvent,
    /// Prebuilt descriptor block.
    pub descriptors: Vec<u8>,
    /// Prebuilt strings block.
    pub strings: Vec<u8>,
    refs: AtomicU32,
}

impl FfsService {
    /// Creates a service description.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String, exec_path: PathBuf, working_dir: Option<PathBuf>, chroot_dir: Option<PathBuf>,
        uid: Option<Uid>, gid: Option<Gid>, options: ServiceOptions, activation_event: FfsEvent,
        descriptors: Vec<u8>, strings: Vec<u8>,
    ) -> Self {
        Self {
            name,
            exec_path,
            working_dir,
            chroot_dir,
            uid,
            gid,
            options,
            activation_event,
            descriptors,
            strings,
            refs: AtomicU32::new(0),
        }
    }

    /// Take an instance reference.
    ///
    /// Refused when the service is already in use and does not allow
    /// multiple instances.
    pub fn acquire(&self) -> Result<()> {
        if self.in_use() && !self.options.contains(ServiceOptions::ALLOW_MULTIPLE) {
            return Err(Error::Other(format!("service {} is already in use", self.name)));
        }

        self.refs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release an instance reference.
    pub fn release(&self) {
        self.refs.fetch_sub(1, Ordering::Relaxed);
    }

    /// Whether any instance holds a reference.
    pub fn in_use(&self) -> bool {
        self.refs.load(Ordering::Relaxed) > 0
    }
}

/// FunctionFS instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FfsState {
    /// Descriptors written, waiting for the gadget to bind.
    Ready,
    /// Bound to a gadget.
    Bound,
    /// Enabled by the host.
    Enabled,
    /// Handler process running; ep0 has been handed over.
    Running,
    /// Handler process exited.
    Exited,
}

/// A live FunctionFS function instance.
#[derive(Debug)]
pub struct FfsFunction {
    service: Arc<FfsService>,
    mount_dir: PathBuf,
    ep0: Option<Arc<OwnedFd>>,
    state: FfsState,
    child: Option<Pid>,
}

impl FfsFunction {
    /// Mount and initialize an instance under the given mount root.
    ///
    /// On failure every step taken so far is unwound: the ep0 fd is closed,
    /// the instance unmounted, its directories removed and the service
    /// reference released.
    pub fn prepare(service: &Arc<FfsService>, mount_root: &Path, instance: &str) -> Result<Self> {
        service.acquire()?;
        match Self::prepare_mounted(service, mount_root, instance) {
            Ok(func) => Ok(func),
            Err(err) => {
                service.release();
                Err(err)
            }
        }
    }

    /// Initialize an instance over an externally mounted FunctionFS
    /// directory. Descriptors and strings are written into its `ep0`.
    pub fn with_prepared(service: &Arc<FfsService>, mount_dir: impl Into<PathBuf>) -> Result<Self> {
        service.acquire()?;
        let mount_dir = mount_dir.into();
        match Self::init_ep0(service, &mount_dir) {
            Ok(ep0) => Ok(Self {
                service: service.clone(),
                mount_dir,
                ep0: Some(Arc::new(ep0)),
                state: FfsState::Ready,
                child: None,
            }),
            Err(err) => {
                service.release();
                Err(err)
            }
        }
    }

    fn prepare_mounted(service: &Arc<FfsService>, mount_root: &Path, instance: &str) -> Result<Self> {
        let service_dir = mount_root.join(&service.name);
        let mut builder = fs::DirBuilder::new();
        builder.mode(0o777);
        match builder.create(&service_dir) {
            Ok(()) => (),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => (),
            Err(err) => return Err(err.into()),
        }

        let mount_dir = service_dir.join(instance);
        match builder.create(&mount_dir) {
            Ok(()) => (),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Exist(format!("ffs instance directory {}", mount_dir.display())))
            }
            Err(err) => return Err(err.into()),
        }

        tracing::debug!("mounting functionfs instance {instance} at {}", mount_dir.display());
        if let Err(err) = blocks::mount(instance, &mount_dir) {
            remove_instance_dirs(&mount_dir);
            return Err(err);
        }

        match Self::init_ep0(service, &mount_dir) {
            Ok(ep0) => Ok(Self {
                service: service.clone(),
                mount_dir,
                ep0: Some(Arc::new(ep0)),
                state: FfsState::Ready,
                child: None,
            }),
            Err(err) => {
                if blocks::umount(&mount_dir).is_ok() {
                    remove_instance_dirs(&mount_dir);
                }
                Err(err)
            }
        }
    }

    fn init_ep0(service: &FfsService, mount_dir: &Path) -> Result<OwnedFd> {
        let ep0_path = mount_dir.join("ep0");
        let mut ep0 = fs::File::options().read(true).write(true).open(&ep0_path)?;

        tracing::debug!("writing functionfs descriptors to {}", ep0_path.display());
        if ep0.write(&service.descriptors)? != service.descriptors.len() {
            return Err(Error::Other("short descriptor write".into()));
        }

        tracing::debug!("writing functionfs strings to {}", ep0_path.display());
        if ep0.write(&service.strings)? != service.strings.len() {
            return Err(Error::Other("short strings write".into()));
        }

        set_nonblocking(ep0.as_raw_fd())?;
        Ok(OwnedFd::from(ep0))
    }

    /// Service behind this instance.
    pub fn service(&self) -> &Arc<FfsService> {
        &self.service
    }

    /// FunctionFS mount directory.
    pub fn mount_dir(&self) -> &Path {
        &self.mount_dir
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FfsState {
        self.state
    }

    /// Pid of the spawned handler.
    pub fn child(&self) -> Option<Pid> {
        self.child
    }

    /// The instance's ep0 fd, until it is handed to the handler.
    pub fn ep0(&self) -> Option<&Arc<OwnedFd>> {
        self.ep0.as_ref()
    }

    /// Apply one ep0 event.
    ///
    /// Returns whether the instance wants to keep receiving events. After a
    /// successful activation the handler owns ep0 and the instance stops
    /// listening.
    pub fn handle_event(&mut self, event: FfsEvent) -> Result<bool> {
        if self.state == FfsState::Running {
            return Ok(false);
        }

        match (self.state, event) {
            (FfsState::Ready, FfsEvent::Bind) => self.state = FfsState::Bound,
            (FfsState::Bound, FfsEvent::Unbind) => self.state = FfsState::Ready,
            (FfsState::Bound, FfsEvent::Enable) => self.state = FfsState::Enabled,
            // All other pairs leave the state unchanged.
            _ => (),
        }

        if event == self.service.activation_event {
            let Some(ep0) = self.ep0.clone() else {
                return Err(Error::Other(format!("instance of {} has no ep0", self.service.name)));
            };

            tracing::info!("received activation event, starting ffs service {}", self.service.name);
            let pid = spawn::launch(&self.service, &self.mount_dir, ep0.as_raw_fd())?;
            tracing::info!("ffs service {} started, pid {pid}", self.service.name);

            self.child = Some(pid);
            self.state = FfsState::Running;
            self.ep0 = None;
            return Ok(false);
        }

        Ok(true)
    }

    /// Note that the handler process exited.
    pub fn child_exited(&mut self) {
        self.child = None;
        self.state = FfsState::Exited;
    }

    /// Tear down the instance: close ep0, unmount and release the service.
    pub fn shutdown(&mut self) {
        self.ep0 = None;

        match blocks::umount(&self.mount_dir) {
            Ok(()) => remove_instance_dirs(&self.mount_dir),
            Err(err) => tracing::warn!("unable to unmount {}: {err}", self.mount_dir.display()),
        }

        self.service.release();
    }
}

/// Remove an instance mount directory, and its service directory when no
/// other instance uses it.
fn remove_instance_dirs(mount_dir: &Path) {
    if let Err(err) = fs::remove_dir(mount_dir) {
        tracing::warn!("unable to remove ffs instance directory {}: {err}", mount_dir.display());
        return;
    }

    let Some(service_dir) = mount_dir.parent() else { return };
    let empty = fs::read_dir(service_dir).map(|mut entries| entries.next().is_none()).unwrap_or(false);
    if empty {
        tracing::info!("all ffs instances removed, removing service directory");
        if let Err(err) = fs::remove_dir(service_dir) {
            tracing::warn!("unable to remove ffs service directory {}: {err}", service_dir.display());
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) }).map_err(Error::from)?;
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map_err(Error::from)?;
    Ok(())
}

/// Function type backed by a loaded FunctionFS service.
#[derive(Debug)]
pub struct FfsFunctionType {
    service: Arc<FfsService>,
}

impl FfsFunctionType {
    /// Creates the type for a loaded service.
    pub fn new(service: Arc<FfsService>) -> Self {
        Self { service }
    }

    /// The service behind this type.
    pub fn service(&self) -> &Arc<FfsService> {
        &self.service
    }
}

impl FunctionType for FfsFunctionType {
    fn name(&self) -> &str {
        &self.service.name
    }

    fn group(&self) -> FunctionGroup {
        FunctionGroup::Ffs
    }

    fn create_instance(&self, env: &FunctionEnv, gadget: &str, instance: &str) -> Result<Function> {
        env.gadget_fs.create_function(gadget, "ffs", instance)?;

        let ffs = match FfsFunction::prepare(&self.service, &env.ffs_mount_root, instance) {
            Ok(ffs) => ffs,
            Err(err) => {
                let _ = env.gadget_fs.remove_function(gadget, "ffs", instance);
                return Err(err);
            }
        };

        Ok(Function::new(self.service.name.clone(), instance, FunctionGroup::Ffs, FunctionKind::Ffs(ffs)))
    }

    fn remove_instance(&self, env: &FunctionEnv, gadget: &str, function: &mut Function) -> Result<()> {
        if let FunctionKind::Ffs(ffs) = &mut function.kind {
            ffs.shutdown();
        }
        env.gadget_fs.remove_function(gadget, "ffs", &function.instance)
    }

    fn busy(&self) -> bool {
        self.service.in_use()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn service(activation_event: FfsEvent, options: ServiceOptions) -> Arc<FfsService> {
        Arc::new(FfsService::new(
            "svc".into(),
            "/bin/sh".into(),
            None,
            None,
            None,
            None,
            options,
            activation_event,
            Vec::new(),
            Vec::new(),
        ))
    }

    fn instance(service: &Arc<FfsService>) -> FfsFunction {
        service.acquire().unwrap();
        FfsFunction {
            service: service.clone(),
            mount_dir: PathBuf::from("/nonexistent"),
            ep0: None,
            state: FfsState::Ready,
            child: None,
        }
    }

    #[test]
    fn single_instance_reference() {
        let svc = service(FfsEvent::Enable, ServiceOptions::empty());
        svc.acquire().unwrap();
        assert!(matches!(svc.acquire(), Err(Error::Other(_))));
        svc.release();
        svc.acquire().unwrap();
    }

    #[test]
    fn multiple_instance_reference() {
        let svc = service(FfsEvent::Enable, ServiceOptions::ALLOW_MULTIPLE);
        svc.acquire().unwrap();
        svc.acquire().unwrap();
        assert!(svc.in_use());
    }

    #[test]
    fn state_transitions() {
        // Setup never arrives in this test, so the activation path stays cold.
        let svc = service(FfsEvent::Setup, ServiceOptions::empty());
        let mut func = instance(&svc);

        assert!(func.handle_event(FfsEvent::Enable).unwrap());
        assert_eq!(func.state(), FfsState::Ready);

        assert!(func.handle_event(FfsEvent::Bind).unwrap());
        assert_eq!(func.state(), FfsState::Bound);

        assert!(func.handle_event(FfsEvent::Enable).unwrap());
        assert_eq!(func.state(), FfsState::Enabled);

        assert!(func.handle_event(FfsEvent::Unbind).unwrap());
        assert_eq!(func.state(), FfsState::Enabled);

        assert!(func.handle_event(FfsEvent::Suspend).unwrap());
        assert!(func.handle_event(FfsEvent::Resume).unwrap());
        assert_eq!(func.state(), FfsState::Enabled);
    }

    #[test]
    fn unbind_returns_to_ready() {
        let svc = service(FfsEvent::Setup, ServiceOptions::empty());
        let mut func = instance(&svc);

        func.handle_event(FfsEvent::Bind).unwrap();
        func.handle_event(FfsEvent::Unbind).unwrap();
        assert_eq!(func.state(), FfsState::Ready);
    }

    #[test]
    fn running_ignores_events() {
        let svc = service(FfsEvent::Setup, ServiceOptions::empty());
        let mut func = instance(&svc);
        func.state = FfsState::Running;

        assert!(!func.handle_event(FfsEvent::Bind).unwrap());
        assert_eq!(func.state(), FfsState::Running);
    }

    #[test]
    fn child_exit_is_terminal() {
        let svc = service(FfsEvent::Setup, ServiceOptions::empty());
        let mut func = instance(&svc);
        func.state = FfsState::Running;
        func.child = Some(Pid::from_raw(1234));

        func.child_exited();
        assert_eq!(func.state(), FfsState::Exited);
        assert_eq!(func.child(), None);
    }

    #[test]
    fn type_busy_tracks_references() {
        let svc = service(FfsEvent::Enable, ServiceOptions::empty());
        let ty = FfsFunctionType::new(svc.clone());
        assert!(!ty.busy());
        svc.acquire().unwrap();
        assert!(ty.busy());
        svc.release();
        assert!(!ty.busy());
    }
}
