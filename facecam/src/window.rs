use gtk4 as gtk;
use libadwaita as adw;

use adw::prelude::*;
use adw::subclass::prelude::*;
use gtk::gdk;
use gtk::gio;
use gtk::glib;
use log::{debug, info, warn};

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::sync::Arc;

use facecam_core::camera::{self, CameraFrame};
use facecam_core::capture::{self, CaptureControls, CaptureEvent, CaptureHandle, FrameSnapshot, OverlayMode};
use facecam_core::config::{AppPaths, FaceCamConfig};
use facecam_core::dataset::{self, Dataset};
use facecam_core::{models, trainer};
use opencv::core::{Mat, MatTraitConst};

use crate::app::FaceCamApplication;

enum DownloadEvent {
    Progress(f64),
    Done(Result<PathBuf, String>),
}

mod imp {
    use super::*;

    #[derive(Default)]
    pub struct FaceCamWindow {
        pub config: RefCell<FaceCamConfig>,
        pub paths: RefCell<Option<AppPaths>>,
        pub dataset: RefCell<Option<Arc<Dataset>>>,

        // Capture state
        pub controls: Arc<CaptureControls>,
        pub capture: RefCell<Option<CaptureHandle>>,
        pub latest_frame: RefCell<Option<Mat>>,
        pub live_status: RefCell<String>,
        pub training: Cell<bool>,
        // Set while toggles are changed from code rather than by the user
        pub syncing_toggles: Cell<bool>,

        // UI widgets
        pub toast_overlay: RefCell<Option<adw::ToastOverlay>>,
        pub picture: RefCell<Option<gtk::Picture>>,
        pub btn_start: RefCell<Option<gtk::Button>>,
        pub btn_stop: RefCell<Option<gtk::Button>>,
        pub btn_recognition: RefCell<Option<gtk::ToggleButton>>,
        pub btn_detection: RefCell<Option<gtk::ToggleButton>>,
        pub entry_name: RefCell<Option<gtk::Entry>>,
        pub lbl_status: RefCell<Option<gtk::Label>>,
        pub lbl_summary: RefCell<Option<gtk::Label>>,
    }

    #[glib::object_subclass]
    impl ObjectSubclass for FaceCamWindow {
        const NAME: &'static str = "FaceCamWindow";
        type Type = super::FaceCamWindow;
        type ParentType = adw::ApplicationWindow;
    }

    impl ObjectImpl for FaceCamWindow {
        fn constructed(&self) {
            self.parent_constructed();
            self.obj().build_ui();
        }

        fn dispose(&self) {
            if let Some(handle) = self.capture.take() {
                handle.stop();
            }
        }
    }

    impl WidgetImpl for FaceCamWindow {}
    impl WindowImpl for FaceCamWindow {}
    impl ApplicationWindowImpl for FaceCamWindow {}
    impl AdwApplicationWindowImpl for FaceCamWindow {}
}

glib::wrapper! {
    pub struct FaceCamWindow(ObjectSubclass<imp::FaceCamWindow>)
        @extends gtk::Widget, gtk::Window, gtk::ApplicationWindow, adw::ApplicationWindow,
        @implements gtk::Accessible, gtk::Buildable, gtk::ConstraintTarget,
                    gtk::Native, gtk::Root, gtk::ShortcutManager;
}

impl FaceCamWindow {
    pub fn new(app: &FaceCamApplication, config: FaceCamConfig, paths: AppPaths) -> Self {
        let window: Self = glib::Object::builder()
            .property("application", app)
            .build();
        window.setup(config, paths);
        window
    }

    fn setup(&self, config: FaceCamConfig, paths: AppPaths) {
        let imp = self.imp();
        *imp.dataset.borrow_mut() = Some(Arc::new(Dataset::new(&paths.dataset_dir)));
        *imp.config.borrow_mut() = config;
        *imp.paths.borrow_mut() = Some(paths);

        self.refresh_summary();

        glib::idle_add_local_once(glib::clone!(
            #[weak(rename_to = window)] self,
            move || { window.check_cascade(); }
        ));
    }

    fn build_ui(&self) {
        let imp = self.imp();

        let toast_overlay = adw::ToastOverlay::new();
        let toolbar = adw::ToolbarView::new();
        let header = adw::HeaderBar::new();

        let menu_btn = gtk::MenuButton::builder()
            .icon_name("open-menu-symbolic")
            .build();
        let menu = gio::Menu::new();
        menu.append(Some("_About FaceCam"), Some("app.about"));
        menu.append(Some("_Quit"), Some("app.quit"));
        menu_btn.set_menu_model(Some(&menu));
        header.pack_end(&menu_btn);
        toolbar.add_top_bar(&header);

        let content = gtk::Box::builder()
            .orientation(gtk::Orientation::Vertical)
            .spacing(12)
            .margin_top(12)
            .margin_bottom(12)
            .margin_start(12)
            .margin_end(12)
            .build();

        // Start / Stop
        let camera_row = gtk::Box::builder()
            .orientation(gtk::Orientation::Horizontal)
            .spacing(12)
            .homogeneous(true)
            .build();
        let btn_start = gtk::Button::builder()
            .label("Start")
            .css_classes(["suggested-action", "pill"])
            .build();
        btn_start.connect_clicked(glib::clone!(
            #[weak(rename_to = window)] self,
            move |_| { window.start_capture(); }
        ));
        let btn_stop = gtk::Button::builder()
            .label("Stop")
            .css_classes(["destructive-action", "pill"])
            .sensitive(false)
            .build();
        btn_stop.connect_clicked(glib::clone!(
            #[weak(rename_to = window)] self,
            move |_| { window.stop_capture(); }
        ));
        camera_row.append(&btn_start);
        camera_row.append(&btn_stop);

        // Overlay toggles
        let overlay_row = gtk::Box::builder()
            .orientation(gtk::Orientation::Horizontal)
            .spacing(12)
            .homogeneous(true)
            .build();
        let btn_recognition = gtk::ToggleButton::builder()
            .label("Recognition")
            .css_classes(["pill"])
            .build();
        btn_recognition.connect_toggled(glib::clone!(
            #[weak(rename_to = window)] self,
            move |btn| { window.on_recognition_toggled(btn.is_active()); }
        ));
        let btn_detection = gtk::ToggleButton::builder()
            .label("Detection")
            .css_classes(["pill"])
            .build();
        btn_detection.connect_toggled(glib::clone!(
            #[weak(rename_to = window)] self,
            move |btn| {
                if !window.imp().syncing_toggles.get() {
                    window.imp().controls.set_detection(btn.is_active());
                }
            }
        ));
        overlay_row.append(&btn_recognition);
        overlay_row.append(&btn_detection);

        let picture = gtk::Picture::builder()
            .content_fit(gtk::ContentFit::Contain)
            .vexpand(true)
            .hexpand(true)
            .build();
        picture.add_css_class("camera-preview");

        let lbl_status = gtk::Label::builder()
            .label("Camera stopped")
            .css_classes(["status-idle"])
            .build();

        // Dataset collection
        let save_row = gtk::Box::builder()
            .orientation(gtk::Orientation::Horizontal)
            .spacing(12)
            .build();
        let lbl_name = gtk::Label::new(Some("Name:"));
        let placeholder = users::get_current_username()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "user".to_string());
        let entry_name = gtk::Entry::builder()
            .placeholder_text(placeholder.as_str())
            .hexpand(true)
            .build();
        entry_name.connect_activate(glib::clone!(
            #[weak(rename_to = window)] self,
            move |_| { window.save_image(); }
        ));
        let btn_save = gtk::Button::builder()
            .label("Save image")
            .build();
        btn_save.connect_clicked(glib::clone!(
            #[weak(rename_to = window)] self,
            move |_| { window.save_image(); }
        ));
        save_row.append(&lbl_name);
        save_row.append(&entry_name);
        save_row.append(&btn_save);

        let lbl_summary = gtk::Label::builder()
            .label("")
            .css_classes(["summary", "dim-label"])
            .wrap(true)
            .xalign(0.0)
            .build();

        content.append(&camera_row);
        content.append(&overlay_row);
        content.append(&picture);
        content.append(&lbl_status);
        content.append(&save_row);
        content.append(&lbl_summary);

        toolbar.set_content(Some(&content));
        toast_overlay.set_child(Some(&toolbar));
        self.set_content(Some(&toast_overlay));

        *imp.toast_overlay.borrow_mut() = Some(toast_overlay);
        *imp.picture.borrow_mut() = Some(picture);
        *imp.btn_start.borrow_mut() = Some(btn_start);
        *imp.btn_stop.borrow_mut() = Some(btn_stop);
        *imp.btn_recognition.borrow_mut() = Some(btn_recognition);
        *imp.btn_detection.borrow_mut() = Some(btn_detection);
        *imp.entry_name.borrow_mut() = Some(entry_name);
        *imp.lbl_status.borrow_mut() = Some(lbl_status);
        *imp.lbl_summary.borrow_mut() = Some(lbl_summary);

        self.set_title(Some("FaceCam"));
        self.set_default_size(720, 760);
    }

    fn paths(&self) -> Option<AppPaths> {
        self.imp().paths.borrow().clone()
    }

    fn is_capturing(&self) -> bool {
        self.imp()
            .capture
            .borrow()
            .as_ref()
            .map_or(false, CaptureHandle::is_running)
    }

    fn start_capture(&self) {
        if self.is_capturing() {
            debug!("Capture already running");
            return;
        }
        let Some(paths) = self.paths() else { return };
        let imp = self.imp();
        let config = imp.config.borrow().clone();

        let (tx, rx) = async_channel::bounded::<CaptureEvent>(capture::FRAME_QUEUE_DEPTH);
        let handle = capture::spawn(&config, &paths, imp.controls.clone(), tx);
        *imp.capture.borrow_mut() = Some(handle);
        let live_status = format!("Live: {}", camera::camera_name(config.camera.device_id));
        self.set_capture_ui(true, &live_status);
        *imp.live_status.borrow_mut() = live_status;

        glib::spawn_future_local(glib::clone!(
            #[weak(rename_to = window)] self,
            async move {
                while let Ok(event) = rx.recv().await {
                    match event {
                        CaptureEvent::Frame(snapshot) => window.show_frame(snapshot),
                        CaptureEvent::CameraUnavailable(msg) => {
                            window.show_toast(&format!("No available webcam: {}", msg));
                        }
                        CaptureEvent::Notice(msg) => window.show_toast(&msg),
                        CaptureEvent::Stopped => break,
                    }
                }
                window.on_capture_stopped();
            }
        ));
    }

    fn stop_capture(&self) {
        let imp = self.imp();

        imp.syncing_toggles.set(true);
        for btn in [&imp.btn_recognition, &imp.btn_detection] {
            if let Some(ref btn) = *btn.borrow() {
                btn.set_active(false);
            }
        }
        imp.syncing_toggles.set(false);
        imp.controls.set_mode(OverlayMode::default());

        if let Some(ref handle) = *imp.capture.borrow() {
            handle.stop();
        }
    }

    fn on_capture_stopped(&self) {
        if self.is_capturing() {
            // A newer session already took over
            return;
        }
        if let Some(handle) = self.imp().capture.take() {
            handle.join();
        }
        self.set_capture_ui(false, "Camera stopped");
    }

    fn set_capture_ui(&self, live: bool, status: &str) {
        let imp = self.imp();
        if let Some(ref btn) = *imp.btn_start.borrow() {
            btn.set_sensitive(!live);
        }
        if let Some(ref btn) = *imp.btn_stop.borrow() {
            btn.set_sensitive(live);
        }
        if let Some(ref lbl) = *imp.lbl_status.borrow() {
            lbl.set_label(status);
            lbl.set_css_classes(if live { &["status-live"] } else { &["status-idle"] });
        }
    }

    fn show_frame(&self, snapshot: FrameSnapshot) {
        let imp = self.imp();
        let FrameSnapshot { raw, display, faces } = snapshot;

        if let Some(ref picture) = *imp.picture.borrow() {
            picture.set_paintable(Some(&Self::texture_for(display)));
        }
        *imp.latest_frame.borrow_mut() = Some(raw);

        let status = capture::status_text(imp.controls.mode(), &faces, &imp.live_status.borrow());
        if let Some(ref lbl) = *imp.lbl_status.borrow() {
            if lbl.label().as_str() != status {
                lbl.set_label(&status);
            }
        }
    }

    fn texture_for(frame: CameraFrame) -> gdk::MemoryTexture {
        let stride = frame.stride();
        let bytes = glib::Bytes::from_owned(frame.rgb_data);
        gdk::MemoryTexture::new(
            frame.width as i32,
            frame.height as i32,
            gdk::MemoryFormat::R8g8b8,
            &bytes,
            stride,
        )
    }

    fn on_recognition_toggled(&self, active: bool) {
        let imp = self.imp();
        if imp.syncing_toggles.get() {
            return;
        }
        if !active {
            imp.controls.set_recognition(false);
            return;
        }
        if imp.training.get() {
            return;
        }
        let Some(paths) = self.paths() else { return };
        let config = imp.config.borrow().clone();

        imp.training.set(true);
        if let Some(ref btn) = *imp.btn_recognition.borrow() {
            btn.set_sensitive(false);
        }
        self.show_toast("Training recognizer...");

        let (tx, rx) = async_channel::bounded::<Result<trainer::TrainingReport, String>>(1);
        std::thread::spawn(move || {
            let result = trainer::train_with_config(&config, &paths).map_err(|e| format!("{:#}", e));
            let _ = tx.send_blocking(result);
        });

        glib::spawn_future_local(glib::clone!(
            #[weak(rename_to = window)] self,
            async move {
                let Ok(result) = rx.recv().await else { return };
                let imp = window.imp();
                imp.training.set(false);

                match result {
                    Ok(report) => window.show_toast(&format!(
                        "Trained on {} face(s) of {} people",
                        report.samples, report.labels
                    )),
                    Err(e) => {
                        warn!("Training failed: {}", e);
                        window.show_toast(&format!("Training failed: {}", e));
                    }
                }

                imp.controls.bump_model_generation();
                if let Some(ref btn) = *imp.btn_recognition.borrow() {
                    btn.set_sensitive(true);
                    if btn.is_active() {
                        imp.controls.set_recognition(true);
                    }
                }
            }
        ));
    }

    fn save_image(&self) {
        let imp = self.imp();

        let typed = imp
            .entry_name
            .borrow()
            .as_ref()
            .map(|e| {
                let text = e.text().to_string();
                if text.trim().is_empty() {
                    e.placeholder_text().map(|p| p.to_string()).unwrap_or_default()
                } else {
                    text
                }
            })
            .unwrap_or_default();
        let label = match dataset::sanitize_label(&typed) {
            Ok(label) => label,
            Err(e) => {
                self.show_toast(&format!("Cannot save: {}", e));
                return;
            }
        };

        let frame = match imp.latest_frame.borrow().as_ref().map(|m| m.try_clone()) {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("Could not copy frame: {}", e);
                self.show_toast("Could not copy the current frame");
                return;
            }
            None => {
                self.show_toast("No frame yet. Start the camera first");
                return;
            }
        };
        let Some(dataset) = imp.dataset.borrow().clone() else { return };

        let (tx, rx) = async_channel::bounded::<Result<PathBuf, String>>(1);
        std::thread::spawn(move || {
            let result = dataset.save(&label, &frame).map_err(|e| format!("{:#}", e));
            let _ = tx.send_blocking(result);
        });

        glib::spawn_future_local(glib::clone!(
            #[weak(rename_to = window)] self,
            async move {
                let Ok(result) = rx.recv().await else { return };
                match result {
                    Ok(path) => {
                        info!("Saved training image {:?}", path);
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        window.show_toast(&format!("Saved {}", name));
                    }
                    Err(e) => {
                        warn!("Save failed: {}", e);
                        window.show_toast(&format!("Save failed: {}", e));
                    }
                }
                window.refresh_summary();
            }
        ));
    }

    fn refresh_summary(&self) {
        let imp = self.imp();
        let Some(dataset) = imp.dataset.borrow().clone() else { return };

        let text = match dataset.summary() {
            Ok(summary) if summary.is_empty() => "Dataset is empty".to_string(),
            Ok(summary) => summary
                .iter()
                .map(|(label, count)| format!("{}: {}", label, count))
                .collect::<Vec<_>>()
                .join("  ·  "),
            Err(e) => {
                warn!("Could not read dataset: {:#}", e);
                "Dataset unavailable".to_string()
            }
        };
        if let Some(ref lbl) = *imp.lbl_summary.borrow() {
            lbl.set_label(&text);
        }
    }

    fn check_cascade(&self) {
        let Some(paths) = self.paths() else { return };
        let config = self.imp().config.borrow().clone();
        if models::locate_cascade(&config, &paths).is_some() {
            return;
        }
        self.show_cascade_download_dialog();
    }

    fn show_cascade_download_dialog(&self) {
        let dialog = adw::MessageDialog::builder()
            .heading("Face Detector Required")
            .body(format!(
                "FaceCam needs the OpenCV frontal face cascade (~{} KB) to find faces.\n\n\
                 It was not found in the OpenCV install. Download it now?",
                models::CASCADE.size_kb
            ))
            .modal(true)
            .transient_for(self)
            .build();

        dialog.add_response("cancel", "Not Now");
        dialog.add_response("download", "Download");
        dialog.set_response_appearance("download", adw::ResponseAppearance::Suggested);
        dialog.set_default_response(Some("download"));
        dialog.set_close_response("cancel");

        dialog.connect_response(None, glib::clone!(
            #[weak(rename_to = window)] self,
            move |_, response| {
                if response == "download" {
                    window.start_cascade_download();
                } else {
                    window.show_toast("No face cascade - detection and training are disabled");
                }
            }
        ));

        dialog.present();
    }

    fn start_cascade_download(&self) {
        let Some(paths) = self.paths() else { return };

        let dialog = adw::Window::builder()
            .title("Downloading Face Detector")
            .default_width(400)
            .default_height(160)
            .modal(true)
            .transient_for(self)
            .deletable(false)
            .build();

        let content = gtk::Box::builder()
            .orientation(gtk::Orientation::Vertical)
            .spacing(24)
            .margin_top(32)
            .margin_bottom(32)
            .margin_start(32)
            .margin_end(32)
            .valign(gtk::Align::Center)
            .build();
        let status_label = gtk::Label::builder()
            .label(format!("Downloading {}...", models::CASCADE.name))
            .css_classes(["title-4"])
            .wrap(true)
            .build();
        let progress_bar = gtk::ProgressBar::builder()
            .show_text(true)
            .build();
        content.append(&status_label);
        content.append(&progress_bar);
        dialog.set_content(Some(&content));
        dialog.present();

        let (tx, rx) = async_channel::unbounded::<DownloadEvent>();
        let progress_tx = tx.clone();
        std::thread::spawn(move || {
            let progress: models::ProgressCallback = Box::new(move |fraction| {
                let _ = progress_tx.try_send(DownloadEvent::Progress(fraction));
            });
            let result = models::download_cascade(&paths.models_dir, Some(progress))
                .map_err(|e| format!("{:#}", e));
            let _ = tx.send_blocking(DownloadEvent::Done(result));
        });

        glib::spawn_future_local(glib::clone!(
            #[weak(rename_to = window)] self,
            #[weak] dialog,
            #[weak] progress_bar,
            async move {
                while let Ok(event) = rx.recv().await {
                    match event {
                        DownloadEvent::Progress(fraction) => progress_bar.set_fraction(fraction),
                        DownloadEvent::Done(result) => {
                            dialog.close();
                            match result {
                                Ok(path) => {
                                    info!("Cascade installed at {:?}", path);
                                    window.show_toast("Face detector downloaded");
                                }
                                Err(e) => {
                                    warn!("Cascade download failed: {}", e);
                                    window.show_toast(&format!("Download failed: {}", e));
                                }
                            }
                            break;
                        }
                    }
                }
            }
        ));
    }

    fn show_toast(&self, message: &str) {
        let imp = self.imp();
        if let Some(ref overlay) = *imp.toast_overlay.borrow() {
            overlay.add_toast(adw::Toast::new(message));
        }
    }
}
