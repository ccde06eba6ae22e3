use anyhow::Result;
use async_channel::{Sender, TrySendError};
use log::{debug, error, info, warn};
use opencv::core::Mat;
use opencv::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::camera::{Camera, CameraFrame, FrameSource};
use crate::config::{AppPaths, DetectionParams, FaceCamConfig};
use crate::face::{self, Detector, FaceRegion, HaarDetector};
use crate::models;
use crate::recognizer::{self, AcceptanceBand, FaceModel, Identity, LbphModel, Recognition};

/// Frames waiting for the display; older ones are dropped when it is full.
pub const FRAME_QUEUE_DEPTH: usize = 2;

const DETECTION_BIT: u8 = 0b01;
const RECOGNITION_BIT: u8 = 0b10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayMode {
    pub detection: bool,
    pub recognition: bool,
}

impl OverlayMode {
    fn from_bits(bits: u8) -> Self {
        Self {
            detection: bits & DETECTION_BIT != 0,
            recognition: bits & RECOGNITION_BIT != 0,
        }
    }

    fn bits(self) -> u8 {
        let mut bits = 0;
        if self.detection {
            bits |= DETECTION_BIT;
        }
        if self.recognition {
            bits |= RECOGNITION_BIT;
        }
        bits
    }

    pub fn any(self) -> bool {
        self.detection || self.recognition
    }
}

/// Toggles written by the UI and read once per frame by the capture loop.
#[derive(Debug, Default)]
pub struct CaptureControls {
    mode: AtomicU8,
    model_generation: AtomicU64,
}

impl CaptureControls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mode(&self) -> OverlayMode {
        OverlayMode::from_bits(self.mode.load(Ordering::Acquire))
    }

    pub fn set_mode(&self, mode: OverlayMode) {
        self.mode.store(mode.bits(), Ordering::Release);
    }

    pub fn set_detection(&self, on: bool) {
        self.set_bit(DETECTION_BIT, on);
    }

    pub fn set_recognition(&self, on: bool) {
        self.set_bit(RECOGNITION_BIT, on);
    }

    fn set_bit(&self, bit: u8, on: bool) {
        if on {
            self.mode.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.mode.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    pub fn model_generation(&self) -> u64 {
        self.model_generation.load(Ordering::Acquire)
    }

    /// Ask the loop to reload the model files before the next recognized frame.
    pub fn bump_model_generation(&self) -> u64 {
        self.model_generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceAnnotation {
    pub region: FaceRegion,
    /// Set only when recognition ran for this face.
    pub identity: Option<Identity>,
}

pub struct FrameSnapshot {
    /// Frame as captured, without overlays.
    pub raw: Mat,
    pub display: CameraFrame,
    pub faces: Vec<FaceAnnotation>,
}

/// Status line for a displayed frame. `idle` is shown while both overlays are off.
pub fn status_text(mode: OverlayMode, faces: &[FaceAnnotation], idle: &str) -> String {
    if !mode.any() {
        return idle.to_string();
    }
    let names: Vec<String> = faces
        .iter()
        .filter_map(|f| f.identity.as_ref().map(|i| i.to_string()))
        .collect();
    if names.is_empty() {
        format!("{} face(s)", faces.len())
    } else {
        format!("{} face(s): {}", faces.len(), names.join(", "))
    }
}

pub enum CaptureEvent {
    Frame(FrameSnapshot),
    CameraUnavailable(String),
    Notice(String),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub detection: DetectionParams,
    pub band: AcceptanceBand,
    pub paths: AppPaths,
}

impl CaptureSettings {
    pub fn new(config: &FaceCamConfig, paths: &AppPaths) -> Self {
        Self {
            detection: config.detection.live,
            band: config.recognition.band(),
            paths: paths.clone(),
        }
    }
}

pub type ModelFactory<M> = Box<dyn FnMut() -> Result<M> + Send>;

pub struct CaptureLoop<S, D, M> {
    source: S,
    detector: D,
    new_model: ModelFactory<M>,
    recognition: Option<Recognition<M>>,
    loaded_generation: Option<u64>,
    settings: CaptureSettings,
    controls: Arc<CaptureControls>,
    running: Arc<AtomicBool>,
    events: Sender<CaptureEvent>,
}

impl<S, D, M> CaptureLoop<S, D, M>
where
    S: FrameSource,
    D: Detector,
    M: FaceModel,
{
    pub fn new(
        source: S,
        detector: D,
        new_model: ModelFactory<M>,
        settings: CaptureSettings,
        controls: Arc<CaptureControls>,
        running: Arc<AtomicBool>,
        events: Sender<CaptureEvent>,
    ) -> Self {
        Self {
            source,
            detector,
            new_model,
            recognition: None,
            loaded_generation: None,
            settings,
            controls,
            running,
            events,
        }
    }

    pub fn run(mut self) {
        info!("Capture loop started");
        let mut frames = 0u64;

        while self.running.load(Ordering::Acquire) {
            let raw = match self.source.read() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Camera read failed, stopping capture: {:#}", e);
                    break;
                }
            };

            let mode = self.controls.mode();
            if mode.recognition {
                self.refresh_recognition();
            }

            match self.process_frame(raw, mode) {
                Ok(snapshot) => self.publish(snapshot),
                Err(e) => warn!("Dropping frame: {:#}", e),
            }
            frames += 1;
        }

        self.running.store(false, Ordering::Release);
        info!("Capture loop stopped after {} frame(s)", frames);
        let _ = self.events.send_blocking(CaptureEvent::Stopped);
    }

    fn refresh_recognition(&mut self) {
        let generation = self.controls.model_generation();
        if self.loaded_generation == Some(generation) {
            return;
        }
        self.loaded_generation = Some(generation);
        self.recognition = None;

        let loaded = (self.new_model)()
            .and_then(|model| Recognition::load(model, &self.settings.paths, self.settings.band));
        match loaded {
            Ok(recognition) => self.recognition = Some(recognition),
            Err(e) => {
                warn!("Recognition unavailable: {:#}", e);
                let _ = self
                    .events
                    .send_blocking(CaptureEvent::Notice(format!("Recognition unavailable: {}", e)));
            }
        }
    }

    fn process_frame(&mut self, raw: Mat, mode: OverlayMode) -> Result<FrameSnapshot> {
        let mut frame = raw.try_clone()?;
        let mut faces = Vec::new();

        if mode.any() {
            let gray = face::to_gray(&raw)?;
            let equalized = face::equalize(&gray)?;
            let regions = self.detector.detect(&equalized, &self.settings.detection)?;

            if mode.detection {
                for region in &regions {
                    face::draw_detection(&mut frame, *region)?;
                }
            }

            for region in regions {
                let identity = if mode.recognition {
                    self.identify(&gray, region)
                } else {
                    None
                };
                if let Some(ref identity) = identity {
                    recognizer::draw_identity(&mut frame, region, identity)?;
                }
                faces.push(FaceAnnotation { region, identity });
            }
        }

        let display = CameraFrame::from_bgr(&frame)?;
        Ok(FrameSnapshot { raw, display, faces })
    }

    fn identify(&self, gray: &Mat, region: FaceRegion) -> Option<Identity> {
        let recognition = self.recognition.as_ref()?;
        let face = match face::crop(gray, region) {
            Ok(Some(face)) => face,
            Ok(None) => return None,
            Err(e) => {
                warn!("Could not crop face {:?}: {:#}", region, e);
                return None;
            }
        };
        match recognition.identify(&face) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("Prediction failed for {:?}: {:#}", region, e);
                None
            }
        }
    }

    fn publish(&mut self, snapshot: FrameSnapshot) {
        match self.events.try_send(CaptureEvent::Frame(snapshot)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Display busy, frame dropped"),
            Err(TrySendError::Closed(_)) => {
                debug!("Display went away, stopping capture");
                self.running.store(false, Ordering::Release);
            }
        }
    }
}

/// Owner side of a running capture thread.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the loop to exit after the frame in flight. Does not wait.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn join(mut self) {
        self.stop();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }
}

/// Start a capture thread. `open` runs on that thread and builds the frame
/// source and detector; if it fails the loop never starts.
pub fn spawn_with<S, D, M, F>(
    open: F,
    new_model: ModelFactory<M>,
    settings: CaptureSettings,
    controls: Arc<CaptureControls>,
    events: Sender<CaptureEvent>,
) -> CaptureHandle
where
    S: FrameSource + 'static,
    D: Detector + 'static,
    M: FaceModel + 'static,
    F: FnOnce(&Sender<CaptureEvent>) -> Result<(S, D)> + Send + 'static,
{
    let running = Arc::new(AtomicBool::new(true));
    let thread_running = running.clone();

    let worker = thread::spawn(move || {
        let (source, detector) = match open(&events) {
            Ok(parts) => parts,
            Err(e) => {
                error!("No available webcam: {:#}", e);
                thread_running.store(false, Ordering::Release);
                let _ = events.send_blocking(CaptureEvent::CameraUnavailable(e.to_string()));
                let _ = events.send_blocking(CaptureEvent::Stopped);
                return;
            }
        };
        CaptureLoop::new(source, detector, new_model, settings, controls, thread_running, events)
            .run();
    });

    CaptureHandle {
        running,
        worker: Some(worker),
    }
}

/// Start capturing from the configured camera with the OpenCV detector and
/// LBPH recognizer.
pub fn spawn(
    config: &FaceCamConfig,
    paths: &AppPaths,
    controls: Arc<CaptureControls>,
    events: Sender<CaptureEvent>,
) -> CaptureHandle {
    let camera_config = config.camera.clone();
    let recognition_config = config.recognition.clone();
    let cascade = models::locate_cascade(config, paths);

    let open = move |events: &Sender<CaptureEvent>| -> Result<(Camera, Option<HaarDetector>)> {
        let camera = Camera::open(&camera_config)?;
        let detector = match cascade {
            Some(path) => match HaarDetector::new(&path) {
                Ok(detector) => Some(detector),
                Err(e) => {
                    warn!("Face detection disabled: {:#}", e);
                    let _ = events.send_blocking(CaptureEvent::Notice(format!(
                        "Face detection disabled: {}",
                        e
                    )));
                    None
                }
            },
            None => {
                warn!("No face cascade found, detection disabled");
                let _ = events.send_blocking(CaptureEvent::Notice(
                    "Face cascade not found, detection disabled".to_string(),
                ));
                None
            }
        };
        Ok((camera, detector))
    };
    let new_model: ModelFactory<LbphModel> =
        Box::new(move || LbphModel::new(&recognition_config));

    spawn_with(open, new_model, CaptureSettings::new(config, paths), controls, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaceCamError;
    use crate::labels::LabelIndex;
    use crate::recognizer::Prediction;
    use opencv::core::{Scalar, CV_8UC3};
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;

    fn blank_frame() -> Mat {
        Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(40.0)).unwrap()
    }

    struct ScriptedSource(VecDeque<Mat>);

    impl ScriptedSource {
        fn frames(count: usize) -> Self {
            Self((0..count).map(|_| blank_frame()).collect())
        }
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<Mat> {
            self.0.pop_front().ok_or_else(|| anyhow::anyhow!("end of script"))
        }
    }

    struct EndlessSource;

    impl FrameSource for EndlessSource {
        fn read(&mut self) -> Result<Mat> {
            thread::sleep(std::time::Duration::from_millis(5));
            Ok(blank_frame())
        }
    }

    struct OneFace;

    impl Detector for OneFace {
        fn detect(&mut self, _gray: &Mat, _params: &DetectionParams) -> Result<Vec<FaceRegion>> {
            Ok(vec![FaceRegion::new(8, 8, 24, 24)])
        }
    }

    struct StubModel;

    impl FaceModel for StubModel {
        fn train(&mut self, _faces: &[Mat], _labels: &[i32]) -> Result<()> {
            Ok(())
        }
        fn predict(&self, _face: &Mat) -> Result<Prediction> {
            Ok(Prediction { label: 0, confidence: 70.0 })
        }
        fn read(&mut self, path: &Path) -> Result<()> {
            if !path.exists() {
                return Err(FaceCamError::ModelMissing(path.to_path_buf()).into());
            }
            Ok(())
        }
        fn write(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn stub_models() -> ModelFactory<StubModel> {
        Box::new(|| Ok(StubModel))
    }

    fn settings(root: &Path) -> CaptureSettings {
        let config = FaceCamConfig::default();
        CaptureSettings::new(&config, &config.paths(root))
    }

    fn write_model_files(paths: &AppPaths) {
        let mut labels = LabelIndex::new();
        labels.id_for("alice");
        labels.save(&paths.label_index).unwrap();
        fs::write(&paths.model_file, "trained").unwrap();
    }

    fn test_loop(
        source: ScriptedSource,
        root: &Path,
        controls: Arc<CaptureControls>,
    ) -> (
        CaptureLoop<ScriptedSource, OneFace, StubModel>,
        async_channel::Receiver<CaptureEvent>,
    ) {
        let (tx, rx) = async_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let capture = CaptureLoop::new(
            source,
            OneFace,
            stub_models(),
            settings(root),
            controls,
            running,
            tx,
        );
        (capture, rx)
    }

    fn drain(rx: &async_channel::Receiver<CaptureEvent>) -> Vec<CaptureEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn mode_bits_round_trip_through_controls() {
        let controls = CaptureControls::new();
        assert_eq!(controls.mode(), OverlayMode::default());

        controls.set_detection(true);
        controls.set_recognition(true);
        assert_eq!(
            controls.mode(),
            OverlayMode { detection: true, recognition: true }
        );

        controls.set_detection(false);
        assert_eq!(
            controls.mode(),
            OverlayMode { detection: false, recognition: true }
        );

        controls.set_mode(OverlayMode::default());
        assert!(!controls.mode().any());
    }

    #[test]
    fn status_returns_to_idle_text_when_overlays_off() {
        let faces = vec![FaceAnnotation {
            region: FaceRegion::new(8, 8, 24, 24),
            identity: Some(Identity::Known("alice".into())),
        }];
        let on = OverlayMode { detection: true, recognition: true };

        assert_eq!(status_text(on, &faces, "Live: video0"), "1 face(s): alice");
        assert_eq!(
            status_text(OverlayMode { detection: true, recognition: false }, &faces[..0], "Live: video0"),
            "0 face(s)"
        );
        assert_eq!(
            status_text(OverlayMode::default(), &faces, "Live: video0"),
            "Live: video0"
        );
    }

    #[test]
    fn generation_bumps_are_monotonic() {
        let controls = CaptureControls::new();
        assert_eq!(controls.model_generation(), 0);
        assert_eq!(controls.bump_model_generation(), 1);
        assert_eq!(controls.bump_model_generation(), 2);
        assert_eq!(controls.model_generation(), 2);
    }

    #[test]
    fn toggling_off_restores_plain_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (mut capture, _rx) = test_loop(ScriptedSource::frames(0), dir.path(), CaptureControls::new());
        let plain = CameraFrame::from_bgr(&blank_frame()).unwrap();

        let on = OverlayMode { detection: true, recognition: true };
        let annotated = capture.process_frame(blank_frame(), on).unwrap();
        assert_ne!(annotated.display, plain);
        assert_eq!(annotated.faces.len(), 1);

        let off = capture.process_frame(blank_frame(), OverlayMode::default()).unwrap();
        assert_eq!(off.display, plain);
        assert!(off.faces.is_empty());
    }

    #[test]
    fn raw_frame_stays_unannotated() {
        let dir = tempfile::tempdir().unwrap();
        let (mut capture, _rx) = test_loop(ScriptedSource::frames(0), dir.path(), CaptureControls::new());

        let on = OverlayMode { detection: true, recognition: false };
        let snapshot = capture.process_frame(blank_frame(), on).unwrap();
        assert_eq!(
            snapshot.raw.data_bytes().unwrap(),
            blank_frame().data_bytes().unwrap()
        );
        assert_eq!(snapshot.faces[0].identity, None);
    }

    #[test]
    fn recognition_labels_faces_when_model_present() {
        let dir = tempfile::tempdir().unwrap();
        let config = FaceCamConfig::default();
        write_model_files(&config.paths(dir.path()));

        let controls = CaptureControls::new();
        controls.set_recognition(true);
        let (capture, rx) = test_loop(ScriptedSource::frames(2), dir.path(), controls);
        capture.run();

        let identities: Vec<_> = drain(&rx)
            .into_iter()
            .filter_map(|event| match event {
                CaptureEvent::Frame(snapshot) => Some(snapshot.faces[0].identity.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            identities,
            vec![Some(Identity::Known("alice".into())); 2]
        );
    }

    #[test]
    fn missing_model_keeps_frames_flowing_undecorated() {
        let dir = tempfile::tempdir().unwrap();
        let controls = CaptureControls::new();
        controls.set_recognition(true);
        let (capture, rx) = test_loop(ScriptedSource::frames(3), dir.path(), controls);
        capture.run();

        let plain = CameraFrame::from_bgr(&blank_frame()).unwrap();
        let events = drain(&rx);
        let notices = events
            .iter()
            .filter(|e| matches!(e, CaptureEvent::Notice(_)))
            .count();
        let frames: Vec<&FrameSnapshot> = events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::Frame(snapshot) => Some(snapshot),
                _ => None,
            })
            .collect();

        assert_eq!(notices, 1);
        assert_eq!(frames.len(), 3);
        for snapshot in frames {
            assert_eq!(snapshot.display, plain);
            assert_eq!(snapshot.faces[0].identity, None);
        }
        assert!(matches!(events.last(), Some(CaptureEvent::Stopped)));
    }

    #[test]
    fn new_generation_reloads_model() {
        let dir = tempfile::tempdir().unwrap();
        let paths = FaceCamConfig::default().paths(dir.path());
        let controls = CaptureControls::new();
        controls.set_recognition(true);
        let (mut capture, _rx) = test_loop(ScriptedSource::frames(0), dir.path(), controls.clone());

        capture.refresh_recognition();
        assert!(capture.recognition.is_none());

        write_model_files(&paths);
        capture.refresh_recognition();
        assert!(capture.recognition.is_none(), "same generation must not reload");

        controls.bump_model_generation();
        capture.refresh_recognition();
        let snapshot = capture
            .process_frame(blank_frame(), controls.mode())
            .unwrap();
        assert_eq!(
            snapshot.faces[0].identity,
            Some(Identity::Known("alice".into()))
        );
    }

    #[test]
    fn full_queue_drops_frames_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = async_channel::bounded(FRAME_QUEUE_DEPTH);
        let capture = CaptureLoop::new(
            ScriptedSource::frames(5),
            OneFace,
            stub_models(),
            settings(dir.path()),
            CaptureControls::new(),
            Arc::new(AtomicBool::new(true)),
            tx,
        );

        let worker = thread::spawn(move || capture.run());
        // Two frames fit; the rest are dropped, then Stopped waits for room.
        thread::sleep(std::time::Duration::from_millis(100));
        let mut frames = 0;
        loop {
            match rx.recv_blocking() {
                Ok(CaptureEvent::Frame(_)) => frames += 1,
                Ok(CaptureEvent::Stopped) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        worker.join().unwrap();
        assert_eq!(frames, FRAME_QUEUE_DEPTH);
    }

    #[test]
    fn unavailable_camera_never_enters_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = async_channel::unbounded();
        let open = |_: &Sender<CaptureEvent>| -> Result<(ScriptedSource, OneFace)> {
            Err(FaceCamError::CameraUnavailable {
                device_id: 0,
                reason: "device did not open".into(),
            }
            .into())
        };

        let handle = spawn_with(open, stub_models(), settings(dir.path()), CaptureControls::new(), tx);
        let first = rx.recv_blocking().unwrap();
        let second = rx.recv_blocking().unwrap();
        assert!(matches!(first, CaptureEvent::CameraUnavailable(ref msg) if msg.contains("camera 0")));
        assert!(matches!(second, CaptureEvent::Stopped));
        assert!(!handle.is_running());
        handle.join();
    }

    #[test]
    fn stop_ends_a_running_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = async_channel::unbounded();
        let open = |_: &Sender<CaptureEvent>| -> Result<(EndlessSource, OneFace)> {
            Ok((EndlessSource, OneFace))
        };

        let handle = spawn_with(open, stub_models(), settings(dir.path()), CaptureControls::new(), tx);
        assert!(matches!(rx.recv_blocking().unwrap(), CaptureEvent::Frame(_)));
        assert!(handle.is_running());

        handle.stop();
        let last = std::iter::from_fn(|| rx.recv_blocking().ok()).last();
        assert!(matches!(last, Some(CaptureEvent::Stopped)));
        handle.join();
    }
}
