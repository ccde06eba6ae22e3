use gtk4 as gtk;
use libadwaita as adw;

use adw::prelude::*;
use adw::subclass::prelude::*;
use gtk::gio;
use gtk::glib;
use log::{info, warn};
use std::cell::OnceCell;

use facecam_core::config::{self, AppPaths, FaceCamConfig};

use crate::window::FaceCamWindow;

mod imp {
    use super::*;

    #[derive(Debug, Default)]
    pub struct FaceCamApplication {
        pub settings: OnceCell<(FaceCamConfig, AppPaths)>,
    }

    #[glib::object_subclass]
    impl ObjectSubclass for FaceCamApplication {
        const NAME: &'static str = "FaceCamApplication";
        type Type = super::FaceCamApplication;
        type ParentType = adw::Application;
    }

    impl ObjectImpl for FaceCamApplication {
        fn constructed(&self) {
            self.parent_constructed();
            let obj = self.obj();
            obj.setup_actions();
        }
    }

    impl ApplicationImpl for FaceCamApplication {
        fn startup(&self) {
            self.parent_startup();
            self.obj().load_css();
        }

        fn activate(&self) {
            let obj = self.obj();
            if let Some(window) = obj.active_window() {
                window.present();
                return;
            }
            let (config, paths) = obj.settings();
            let window = FaceCamWindow::new(&obj, config, paths);
            window.present();
        }
    }

    impl GtkApplicationImpl for FaceCamApplication {}
    impl AdwApplicationImpl for FaceCamApplication {}
}

glib::wrapper! {
    pub struct FaceCamApplication(ObjectSubclass<imp::FaceCamApplication>)
        @extends gio::Application, gtk::Application, adw::Application,
        @implements gio::ActionGroup, gio::ActionMap;
}

impl FaceCamApplication {
    pub fn new() -> Self {
        glib::Object::builder()
            .property("application-id", "io.github.facecam.FaceCam")
            .property("flags", gio::ApplicationFlags::FLAGS_NONE)
            .build()
    }

    /// Configuration and resolved paths, loaded on first use.
    pub fn settings(&self) -> (FaceCamConfig, AppPaths) {
        self.imp()
            .settings
            .get_or_init(|| match config::load_from_cwd() {
                Ok((config, paths)) => {
                    info!("Project root: {:?}", paths.root);
                    (config, paths)
                }
                Err(e) => {
                    warn!("Falling back to default configuration: {:#}", e);
                    let config = FaceCamConfig::default();
                    let paths = config.paths(std::path::Path::new("."));
                    (config, paths)
                }
            })
            .clone()
    }

    fn setup_actions(&self) {
        let about_action = gio::ActionEntry::builder("about")
            .activate(|app: &Self, _, _| app.show_about())
            .build();

        let quit_action = gio::ActionEntry::builder("quit")
            .activate(|app: &Self, _, _| app.quit())
            .build();

        self.add_action_entries([about_action, quit_action]);
        self.set_accels_for_action("app.quit", &["<Ctrl>q"]);
    }

    fn load_css(&self) {
        let css = r#"
            .camera-preview {
                background-color: @card_bg_color;
                border-radius: 12px;
                min-height: 360px;
            }
            .summary { color: @theme_fg_color; }
            .status-live { color: @success_color; font-weight: bold; }
            .status-idle { color: @warning_color; }
        "#;

        let Some(display) = gtk::gdk::Display::default() else {
            warn!("No display, skipping stylesheets");
            return;
        };

        let provider = gtk::CssProvider::new();
        provider.load_from_string(css);
        gtk::style_context_add_provider_for_display(
            &display,
            &provider,
            gtk::STYLE_PROVIDER_PRIORITY_APPLICATION,
        );

        let (_, paths) = self.settings();
        if paths.stylesheet.exists() {
            let user = gtk::CssProvider::new();
            user.load_from_path(&paths.stylesheet);
            gtk::style_context_add_provider_for_display(
                &display,
                &user,
                gtk::STYLE_PROVIDER_PRIORITY_USER,
            );
            info!("Loaded stylesheet {:?}", paths.stylesheet);
        }
    }

    fn show_about(&self) {
        let dialog = adw::AboutWindow::builder()
            .application_name("FaceCam")
            .application_icon("camera-web-symbolic")
            .developer_name("FaceCam Team")
            .version(env!("CARGO_PKG_VERSION"))
            .license_type(gtk::License::Gpl30)
            .comments("Webcam face detection, recognition and dataset collection")
            .modal(true)
            .build();

        if let Some(win) = self.active_window() {
            dialog.set_transient_for(Some(&win));
        }
        dialog.present();
    }
}
