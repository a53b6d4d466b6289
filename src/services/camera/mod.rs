// Capture session lifecycle on a dedicated serial worker thread

pub mod permissions;

use anyhow::{Context, Result};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::CameraConfig;
use crate::core::errors::{CaptureError, CaptureResult};
use crate::core::types::SourceImage;

pub use permissions::{AuthorizationStatus, CameraPermissions, FixedPermissions};

/// Hardware behind a capture session
///
/// Every method is called from the session's worker thread only, so
/// implementations need no internal locking.
pub trait CaptureDevice: Send + 'static {
    /// One-time wiring of inputs and outputs
    fn configure(&mut self) -> CaptureResult<()>;
    fn start_running(&mut self);
    fn stop_running(&mut self);
    fn is_running(&self) -> bool;
    /// Begin a still capture; `completion` may be resolved later from any thread
    fn capture_photo(&mut self, completion: PhotoCompletion);
}

/// Resolves a pending capture exactly once
///
/// Resolving consumes the handle; dropping it unresolved delivers "no image".
pub struct PhotoCompletion {
    tx: Option<oneshot::Sender<Option<SourceImage>>>,
}

impl PhotoCompletion {
    pub fn pair() -> (Self, oneshot::Receiver<Option<SourceImage>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn resolve(mut self, image: Option<SourceImage>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(image);
        }
    }
}

impl Drop for PhotoCompletion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            debug!("Photo completion dropped unresolved");
            let _ = tx.send(None);
        }
    }
}

/// App lifecycle transitions that drive the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    WillResignActive,
    DidBecomeActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub configured: bool,
    pub running: bool,
    pub stop_pending: bool,
}

enum Command {
    Start,
    Stop { immediate: bool },
    Capture(PhotoCompletion),
    Lifecycle(LifecycleEvent),
    Status(oneshot::Sender<SessionStatus>),
    Shutdown,
}

struct Worker {
    device: Box<dyn CaptureDevice>,
    configured: bool,
    stop_deadline: Option<Instant>,
    stop_delay: Duration,
    ready: watch::Sender<bool>,
}

impl Worker {
    fn run(mut self, commands: channel::Receiver<Command>) {
        loop {
            let command = match self.stop_deadline {
                Some(deadline) => match commands.recv_deadline(deadline) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        self.stop_deadline = None;
                        self.stop("delayed");
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match commands.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            match command {
                Command::Start => self.start(),
                Command::Stop { immediate: true } => {
                    self.stop_deadline = None;
                    self.stop("immediate");
                }
                Command::Stop { immediate: false } => {
                    self.stop_deadline = Some(Instant::now() + self.stop_delay);
                }
                Command::Capture(completion) => {
                    if self.device.is_running() {
                        self.device.capture_photo(completion);
                    } else {
                        warn!("Capture requested while the session is not running");
                        completion.resolve(None);
                    }
                }
                Command::Lifecycle(LifecycleEvent::WillResignActive) => {
                    self.stop_deadline = None;
                    self.stop("resign active");
                }
                Command::Lifecycle(LifecycleEvent::DidBecomeActive) => {
                    if self.configured {
                        self.start();
                    }
                }
                Command::Status(reply) => {
                    let _ = reply.send(SessionStatus {
                        configured: self.configured,
                        running: self.device.is_running(),
                        stop_pending: self.stop_deadline.is_some(),
                    });
                }
                Command::Shutdown => break,
            }
        }

        if self.device.is_running() {
            self.device.stop_running();
        }
        debug!("Camera session thread shutting down");
    }

    fn start(&mut self) {
        self.stop_deadline = None;
        if !self.configured {
            match self.device.configure() {
                Ok(()) => {
                    self.configured = true;
                    self.ready.send_replace(true);
                    info!("✓ Camera configured");
                }
                Err(e) => {
                    warn!("Camera unavailable, session will not start: {}", e);
                    return;
                }
            }
        }
        if !self.device.is_running() {
            self.device.start_running();
            debug!("Camera session started");
        }
    }

    fn stop(&mut self, reason: &str) {
        if self.device.is_running() {
            self.device.stop_running();
            debug!("Camera session stopped ({})", reason);
        }
    }
}

/// Owns a capture device and serializes every configure/start/stop on one thread
pub struct CameraSession {
    commands: Sender<Command>,
    ready: watch::Receiver<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CameraSession {
    pub fn new(device: Box<dyn CaptureDevice>, config: &CameraConfig) -> Result<Self> {
        let (commands, rx) = channel::unbounded();
        let (ready_tx, ready) = watch::channel(false);
        let worker = Worker {
            device,
            configured: false,
            stop_deadline: None,
            stop_delay: config.stop_delay,
            ready: ready_tx,
        };

        let handle = thread::Builder::new()
            .name("capword-camera".into())
            .spawn(move || worker.run(rx))
            .context("failed to spawn camera session thread")?;

        Ok(Self {
            commands,
            ready,
            worker: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            error!("Camera session thread is gone");
        }
    }

    /// Configure once if needed, cancel any pending stop and run
    pub fn start_session(&self) {
        self.send(Command::Start);
    }

    /// Stop now, or after the configured delay unless a start intervenes
    pub fn stop_session(&self, immediate: bool) {
        self.send(Command::Stop { immediate });
    }

    pub fn handle_lifecycle(&self, event: LifecycleEvent) {
        self.send(Command::Lifecycle(event));
    }

    /// Forward lifecycle events from `events` until the sender side closes
    pub fn attach_lifecycle(
        &self,
        mut events: mpsc::Receiver<LifecycleEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!("Lifecycle event: {:?}", event);
                if commands.send(Command::Lifecycle(event)).is_err() {
                    break;
                }
            }
        })
    }

    /// Whether the device was configured successfully
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn ready_watch(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    pub async fn status(&self) -> CaptureResult<SessionStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .map_err(|_| CaptureError::SessionClosed)?;
        rx.await.map_err(|_| CaptureError::SessionClosed)
    }

    /// Capture one still; `None` on any device failure
    #[instrument(skip(self))]
    pub async fn capture_photo(&self) -> Option<SourceImage> {
        let (completion, rx) = PhotoCompletion::pair();
        if self.commands.send(Command::Capture(completion)).is_err() {
            error!("Camera session thread is gone");
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Start only once camera access is granted, requesting it if undecided
    pub async fn start_authorized(&self, permissions: &dyn CameraPermissions) -> CaptureResult<()> {
        match permissions.status() {
            AuthorizationStatus::Authorized => {}
            AuthorizationStatus::NotDetermined => {
                if !permissions.request().await {
                    return Err(CaptureError::PermissionDenied);
                }
            }
            AuthorizationStatus::Denied => return Err(CaptureError::PermissionDenied),
        }
        self.start_session();
        Ok(())
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().take() {
            let _ = self.commands.send(Command::Shutdown);
            if let Err(err) = handle.join() {
                error!("Failed to join camera session thread: {:?}", err);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::DynamicImage;
    use std::sync::Arc;

    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    pub(crate) struct DeviceLog {
        pub configures: usize,
        pub starts: usize,
        pub stops: usize,
        pub captures: usize,
    }

    /// Records calls; `available = false` simulates a missing camera
    pub(crate) struct RecordingDevice {
        pub log: Arc<Mutex<DeviceLog>>,
        pub available: bool,
        pub fail_capture: bool,
        running: bool,
    }

    impl RecordingDevice {
        pub(crate) fn new(log: Arc<Mutex<DeviceLog>>) -> Self {
            Self {
                log,
                available: true,
                fail_capture: false,
                running: false,
            }
        }
    }

    impl CaptureDevice for RecordingDevice {
        fn configure(&mut self) -> CaptureResult<()> {
            self.log.lock().configures += 1;
            if self.available {
                Ok(())
            } else {
                Err(CaptureError::DeviceUnavailable)
            }
        }

        fn start_running(&mut self) {
            self.log.lock().starts += 1;
            self.running = true;
        }

        fn stop_running(&mut self) {
            self.log.lock().stops += 1;
            self.running = false;
        }

        fn is_running(&self) -> bool {
            self.running
        }

        fn capture_photo(&mut self, completion: PhotoCompletion) {
            self.log.lock().captures += 1;
            if self.fail_capture {
                // Simulates a delegate callback that never delivers data
                drop(completion);
                return;
            }
            std::thread::spawn(move || {
                let image = DynamicImage::new_rgba8(4, 3);
                completion.resolve(Some(SourceImage::new(
                    image,
                    crate::core::types::Orientation::Up,
                    1.0,
                )));
            });
        }
    }

    fn session(device: RecordingDevice, delay_ms: u64) -> CameraSession {
        let config = CameraConfig {
            stop_delay: Duration::from_millis(delay_ms),
        };
        CameraSession::new(Box::new(device), &config).unwrap()
    }

    #[tokio::test]
    async fn test_start_twice_configures_once() {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let camera = session(RecordingDevice::new(log.clone()), 50);

        camera.start_session();
        camera.start_session();
        let status = camera.status().await.unwrap();

        assert!(status.configured && status.running);
        assert!(camera.is_ready());
        let log = log.lock().clone();
        assert_eq!(log.configures, 1);
        assert_eq!(log.starts, 1);
    }

    #[tokio::test]
    async fn test_deferred_stop_cancelled_by_start() {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let camera = session(RecordingDevice::new(log.clone()), 50);

        camera.start_session();
        camera.stop_session(false);
        assert!(camera.status().await.unwrap().stop_pending);
        camera.start_session();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let status = camera.status().await.unwrap();
        assert!(status.running && !status.stop_pending);
        assert_eq!(log.lock().stops, 0);
    }

    #[tokio::test]
    async fn test_deferred_stop_fires_after_delay() {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let camera = session(RecordingDevice::new(log.clone()), 30);

        camera.start_session();
        camera.stop_session(false);
        assert!(camera.status().await.unwrap().running);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(!camera.status().await.unwrap().running);
        assert_eq!(log.lock().stops, 1);

        camera.start_session();
        camera.stop_session(true);
        assert!(!camera.status().await.unwrap().running);
        assert_eq!(log.lock().stops, 2);
    }

    #[tokio::test]
    async fn test_missing_device_never_ready() {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let mut device = RecordingDevice::new(log.clone());
        device.available = false;
        let camera = session(device, 50);

        camera.start_session();
        let status = camera.status().await.unwrap();
        assert!(!status.configured && !status.running);
        assert!(!camera.is_ready());
        assert!(camera.capture_photo().await.is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_events_stop_and_restart_only_when_configured() {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let camera = session(RecordingDevice::new(log.clone()), 50);
        let (tx, rx) = mpsc::channel(4);
        let forwarder = camera.attach_lifecycle(rx);

        // Not configured yet: becoming active must not configure
        tx.send(LifecycleEvent::DidBecomeActive).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!camera.status().await.unwrap().configured);

        camera.start_session();
        tx.send(LifecycleEvent::WillResignActive).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!camera.status().await.unwrap().running);

        tx.send(LifecycleEvent::DidBecomeActive).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(camera.status().await.unwrap().running);
        assert_eq!(log.lock().configures, 1);

        drop(tx);
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_resolves_once_with_image_or_none() {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let camera = session(RecordingDevice::new(log.clone()), 50);
        camera.start_session();
        let frame = camera.capture_photo().await.unwrap();
        assert_eq!(frame.image.width(), 4);

        let mut failing = RecordingDevice::new(Arc::new(Mutex::new(DeviceLog::default())));
        failing.fail_capture = true;
        let camera = session(failing, 50);
        camera.start_session();
        assert!(camera.capture_photo().await.is_none());
    }

    #[tokio::test]
    async fn test_completion_delivers_exactly_one_value() {
        let (completion, rx) = PhotoCompletion::pair();
        completion.resolve(None);
        assert_eq!(rx.await.unwrap().map(|s| s.scale), None);

        let (completion, rx) = PhotoCompletion::pair();
        drop(completion);
        assert!(rx.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_authorized() {
        let log = Arc::new(Mutex::new(DeviceLog::default()));
        let camera = session(RecordingDevice::new(log.clone()), 50);

        let denied = FixedPermissions::new(AuthorizationStatus::Denied, false);
        assert!(matches!(
            camera.start_authorized(&denied).await,
            Err(CaptureError::PermissionDenied)
        ));

        let refused = FixedPermissions::new(AuthorizationStatus::NotDetermined, false);
        assert!(camera.start_authorized(&refused).await.is_err());
        assert_eq!(refused.requests(), 1);
        assert!(!camera.status().await.unwrap().configured);

        let granted = FixedPermissions::new(AuthorizationStatus::NotDetermined, true);
        camera.start_authorized(&granted).await.unwrap();
        assert!(camera.status().await.unwrap().running);
        assert_eq!(granted.status(), AuthorizationStatus::Authorized);
    }
}
