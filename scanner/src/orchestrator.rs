/*!
Scanner orchestrator.

Sequences device initialization, the rotate-and-capture loop, finalization
and device release against one worker. State transitions:

```text
Uninitialized --initialize--> Initializing --ok--> Ready --scan--> Scanning
                                   |                 ^                |
                                   v                 |                v
                                 Error <---failure---+-- Finalizing <-+
```

`cleanup()` is accepted in every state and returns to `Uninitialized`. Each
cleanup starts a new session; an operation that notices its session has gone
stale after an await stops without touching the lifecycle state.

The state mutex is never held across an await or while listeners run.
*/

use crate::camera::CameraProxy;
use crate::codec::Codec;
use crate::listeners::{EventRegistry, Subscription};
use crate::persistence::ScanRepository;
use crate::stage::StageProxy;
use chrono::Local;
use shared::protocol::WorkerEvent;
use shared::{
    LifecycleReply, Phase, Result, ScanFailure, ScanProgress, ScanResult, ScannerError,
    ScannerSettings, ScannerState, StatusReport,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

struct Core {
    lifecycle: ScannerState,
    settings: Option<ScannerSettings>,
    /// Last commanded position in degrees
    position: f64,
    session: u64,
    last_error: Option<String>,
}

struct Inner {
    codec: Codec,
    camera: CameraProxy,
    stage: StageProxy,
    repository: Option<Arc<dyn ScanRepository>>,
    core: Mutex<Core>,
    progress: EventRegistry<ScanProgress>,
    complete: EventRegistry<ScanResult>,
    errors: EventRegistry<ScanFailure>,
}

/// Frames written so far by the running scan
#[derive(Default)]
struct ScanRun {
    output_path: PathBuf,
    frames: Vec<PathBuf>,
}

impl ScanRun {
    fn frames_captured(&self) -> u32 {
        self.frames.len() as u32
    }
}

/// Drives one worker through initialize / scan / cleanup cycles.
///
/// Cloning yields another handle to the same orchestrator, so `cleanup` can
/// be issued from one task while `scan` runs on another.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Orchestrator in preview mode: scans are never recorded
    pub fn new(codec: Codec) -> Self {
        Self::build(codec, None)
    }

    /// Orchestrator that records scans carrying metadata
    pub fn with_repository(codec: Codec, repository: Arc<dyn ScanRepository>) -> Self {
        Self::build(codec, Some(repository))
    }

    fn build(codec: Codec, repository: Option<Arc<dyn ScanRepository>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                camera: CameraProxy::new(codec.clone()),
                stage: StageProxy::new(codec.clone()),
                codec,
                repository,
                core: Mutex::new(Core {
                    lifecycle: ScannerState::Uninitialized,
                    settings: None,
                    position: 0.0,
                    session: 0,
                    last_error: None,
                }),
                progress: EventRegistry::new(),
                complete: EventRegistry::new(),
                errors: EventRegistry::new(),
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state
    pub fn state(&self) -> ScannerState {
        self.core().lifecycle
    }

    /// Reason for the most recent transition into `Error`
    pub fn last_error(&self) -> Option<String> {
        self.core().last_error.clone()
    }

    /// Settings of the current cycle, if initialized
    pub fn settings(&self) -> Option<ScannerSettings> {
        self.core().settings.clone()
    }

    pub fn on_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ScanProgress) + Send + Sync + 'static,
    {
        self.inner.progress.subscribe(callback)
    }

    pub fn on_complete<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ScanResult) + Send + Sync + 'static,
    {
        self.inner.complete.subscribe(callback)
    }

    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ScanFailure) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(callback)
    }

    /// Unsolicited events straight from the worker
    pub fn on_worker_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.inner.codec.on_event(callback)
    }

    fn is_current(&self, session: u64) -> bool {
        self.core().session == session
    }

    fn ensure_current(&self, session: u64, operation: &str) -> Result<()> {
        if self.is_current(session) {
            Ok(())
        } else {
            Err(ScannerError::Aborted(format!("{} aborted by cleanup", operation)))
        }
    }

    /// Connect camera then stage with the given settings.
    ///
    /// Allowed from `Uninitialized`, `Ready` and `Error`; devices held by a
    /// previous cycle are released first.
    pub async fn initialize(&self, settings: ScannerSettings) -> Result<LifecycleReply> {
        settings.validate()?;

        let (previous, session) = {
            let mut core = self.core();
            if !core.lifecycle.can_initialize() {
                return Err(ScannerError::invalid_state("initialize", core.lifecycle));
            }
            let previous = core.lifecycle;
            core.lifecycle = ScannerState::Initializing;
            core.settings = None;
            (previous, core.session)
        };
        info!(
            "Initializing scanner: camera {}, stage {}",
            settings.camera.camera_ip_address, settings.stage.device_name
        );

        if previous != ScannerState::Uninitialized {
            self.release_devices().await;
        }

        match self.connect_devices(&settings, session).await {
            Ok(()) => {
                {
                    let mut core = self.core();
                    core.lifecycle = ScannerState::Ready;
                    core.settings = Some(settings);
                    core.position = 0.0;
                    core.last_error = None;
                }
                info!("✅ Scanner ready");
                Ok(LifecycleReply {
                    success: true,
                    initialized: true,
                })
            }
            Err(e) => {
                let message = e.to_string();
                error!("❌ Initialization failed: {}", message);
                {
                    let mut core = self.core();
                    if core.session == session {
                        core.lifecycle = ScannerState::Error;
                        core.last_error = Some(message.clone());
                    }
                }
                self.inner.errors.emit(&ScanFailure {
                    phase: Phase::Initialize,
                    message,
                    frames_captured: 0,
                });
                Err(e)
            }
        }
    }

    async fn connect_devices(&self, settings: &ScannerSettings, session: u64) -> Result<()> {
        let camera = &self.inner.camera;
        let stage = &self.inner.stage;

        if !camera.connect(&settings.camera).await? {
            return Err(ScannerError::device("connect", "camera reported not connected"));
        }
        if let Err(e) = self.ensure_current(session, "initialize") {
            self.release_camera().await;
            return Err(e);
        }

        let stage_result = match stage.connect(&settings.stage).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ScannerError::device("connect", "stage reported not connected")),
            Err(e) => Err(e),
        };
        if let Err(e) = stage_result {
            // Never leave a half-initialized rig behind
            self.release_camera().await;
            return Err(e);
        }

        if let Err(e) = self.ensure_current(session, "initialize") {
            self.release_devices().await;
            return Err(e);
        }
        Ok(())
    }

    /// Run one full rotation.
    ///
    /// Never fails outright: rejections and device failures come back as a
    /// result with `success = false`. Device failures (but not rejections)
    /// also fire the error listeners; success fires exactly one completion.
    pub async fn scan(&self) -> ScanResult {
        let (settings, session) = {
            let mut core = self.core();
            let settings = match (core.lifecycle, &core.settings) {
                (ScannerState::Ready, Some(settings)) => settings.clone(),
                (state, settings) => {
                    let output = settings
                        .as_ref()
                        .map(|s| s.output_dir.clone())
                        .unwrap_or_default();
                    let rejection = ScannerError::invalid_state("scan", state);
                    warn!("{}", rejection);
                    return ScanResult::failed(0, output, rejection.to_string());
                }
            };
            core.lifecycle = ScannerState::Scanning;
            (settings, core.session)
        };

        let mut run = ScanRun::default();
        match self.capture_frames(&settings, session, &mut run).await {
            Ok(()) => self.finalize(&settings, session, run).await,
            Err(e) => self.fail_scan(session, run, e),
        }
    }

    async fn capture_frames(
        &self,
        settings: &ScannerSettings,
        session: u64,
        run: &mut ScanRun,
    ) -> Result<()> {
        let total = settings.frame_count;
        run.output_path = create_scan_dir(settings).await?;
        info!(
            "📸 Starting scan: {} frames, {:.2}° per frame, output {}",
            total,
            settings.degrees_per_frame(),
            run.output_path.display()
        );

        self.inner.stage.home().await?;
        self.ensure_current(session, "scan")?;
        self.core().position = 0.0;

        let mut previous = 0.0;
        for frame_number in 0..total {
            let target = frame_number as f64 * 360.0 / total as f64;

            self.inner.stage.rotate_by(target - previous).await?;
            self.ensure_current(session, "scan")?;
            previous = target;
            self.core().position = target;

            if settings.stage.step_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(settings.stage.step_delay_ms)).await;
                self.ensure_current(session, "scan")?;
            }

            let frame = self.inner.camera.capture().await?;
            self.ensure_current(session, "scan")?;

            let path = frame.path_in(&run.output_path, frame_number);
            tokio::fs::write(&path, &frame.bytes).await?;
            run.frames.push(path.clone());

            info!("Captured frame {}/{} at {:.2}°", frame_number + 1, total, target);
            self.inner.progress.emit(&ScanProgress {
                frame_number,
                total_frames: total,
                position: target,
                image_path: Some(path),
            });
        }
        Ok(())
    }

    async fn finalize(&self, settings: &ScannerSettings, session: u64, run: ScanRun) -> ScanResult {
        {
            let mut core = self.core();
            if core.session == session {
                core.lifecycle = ScannerState::Finalizing;
            }
        }

        let mut result = ScanResult::succeeded(run.frames_captured(), run.output_path.clone());

        match self.inner.stage.home().await {
            Ok(_) => {
                self.core().position = 0.0;
            }
            Err(e) => {
                warn!("⚠️ Failed to return stage home: {}", e);
                result.warnings.push(format!("Failed to return stage home: {}", e));
            }
        }

        if let Some(metadata) = &settings.metadata {
            match &self.inner.repository {
                Some(repository) => {
                    match repository
                        .create_scan(metadata, run.frames_captured(), &run.output_path)
                        .await
                    {
                        Ok(scan_id) => {
                            if let Err(e) = repository.create_images(&scan_id, &run.frames).await {
                                warn!("⚠️ Failed to record images for scan {}: {:#}", scan_id, e);
                                result
                                    .warnings
                                    .push(ScannerError::persistence(format!("{:#}", e)).to_string());
                            }
                            info!("💾 Recorded scan {}", scan_id);
                            result.scan_id = Some(scan_id);
                        }
                        Err(e) => {
                            warn!("⚠️ Failed to record scan: {:#}", e);
                            result
                                .warnings
                                .push(ScannerError::persistence(format!("{:#}", e)).to_string());
                        }
                    }
                }
                None => {
                    warn!("Scan metadata supplied but no repository attached; scan not recorded");
                    result
                        .warnings
                        .push("No scan repository attached; scan not recorded".to_string());
                }
            }
        }

        info!(
            "✅ Scan complete: {} frames in {}",
            result.frames_captured,
            result.output_path.display()
        );
        self.inner.complete.emit(&result);

        let mut core = self.core();
        if core.session == session {
            core.lifecycle = ScannerState::Ready;
        }
        drop(core);
        result
    }

    fn fail_scan(&self, session: u64, run: ScanRun, error: ScannerError) -> ScanResult {
        let message = {
            let mut core = self.core();
            if core.session == session {
                core.lifecycle = ScannerState::Error;
                let message = error.to_string();
                core.last_error = Some(message.clone());
                message
            } else {
                // Whatever failed, the cause was the cleanup
                ScannerError::Aborted("scan aborted by cleanup".to_string()).to_string()
            }
        };

        error!(
            "❌ Scan failed after {} frame(s): {}",
            run.frames_captured(),
            message
        );
        self.inner.errors.emit(&ScanFailure {
            phase: Phase::Scan,
            message: message.clone(),
            frames_captured: run.frames_captured(),
        });
        ScanResult::failed(run.frames_captured(), run.output_path, message)
    }

    /// Release both devices and return to `Uninitialized`.
    ///
    /// Accepted in any state; a scan in flight is abandoned. `success` is
    /// false if either device refused to release.
    pub async fn cleanup(&self) -> LifecycleReply {
        {
            let mut core = self.core();
            core.session += 1;
            if core.lifecycle.is_busy() {
                warn!("Cleanup requested while {}; abandoning it", core.lifecycle);
            }
            core.lifecycle = ScannerState::Uninitialized;
            core.settings = None;
            core.last_error = None;
        }

        let released = self.release_devices().await;
        info!("Scanner cleaned up");
        LifecycleReply {
            success: released,
            initialized: false,
        }
    }

    /// Disconnect both devices; a failure on one never skips the other
    async fn release_devices(&self) -> bool {
        let camera = self.release_camera().await;
        let stage = match self.inner.stage.disconnect().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to release stage: {}", e);
                false
            }
        };
        camera && stage
    }

    async fn release_camera(&self) -> bool {
        match self.inner.camera.disconnect().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to release camera: {}", e);
                false
            }
        }
    }

    /// Combine the orchestrator's own state with device status from the worker
    pub async fn get_status(&self) -> StatusReport {
        let (state, position) = {
            let core = self.core();
            (core.lifecycle, core.position)
        };

        let camera = self.inner.camera.get_status().await;
        let stage = self.inner.stage.get_status().await;

        let camera_status = match &camera {
            Ok(status) if status.connected => "connected",
            Ok(_) => "disconnected",
            Err(_) => "unknown",
        };
        let daq_status = match &stage {
            Ok(status) if status.initialized => "initialized",
            Ok(_) => "not_initialized",
            Err(_) => "unknown",
        };
        let mock = camera.as_ref().map(|s| s.mock).unwrap_or(false)
            || stage.as_ref().map(|s| s.mock).unwrap_or(false);

        StatusReport {
            success: camera.is_ok() && stage.is_ok(),
            initialized: matches!(
                state,
                ScannerState::Ready | ScannerState::Scanning | ScannerState::Finalizing
            ),
            state,
            camera_status: camera_status.to_string(),
            daq_status: daq_status.to_string(),
            position,
            mock,
        }
    }
}

/// `<output_dir>/<YYYYMMDD_HHMMSS>[_<plant_id>]`, suffixed if already taken
async fn create_scan_dir(settings: &ScannerSettings) -> Result<PathBuf> {
    let mut name = Local::now().format("%Y%m%d_%H%M%S").to_string();
    if let Some(metadata) = &settings.metadata {
        name.push('_');
        name.push_str(&sanitize(&metadata.plant_id));
    }

    let mut dir = settings.output_dir.join(&name);
    let mut attempt = 1;
    while tokio::fs::try_exists(&dir).await? {
        attempt += 1;
        dir = settings.output_dir.join(format!("{}_{}", name, attempt));
    }
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
