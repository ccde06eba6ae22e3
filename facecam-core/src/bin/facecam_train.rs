use facecam_core::{config, trainer};
use log::{error, info};
use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (config, paths) = match config::load_from_cwd() {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Training from {:?}", paths.dataset_dir);
    match trainer::train_with_config(&config, &paths) {
        Ok(report) => {
            info!(
                "Done at {}: {} label(s), {} face(s) from {} image(s), {} skipped",
                report.finished_at.to_rfc3339(),
                report.labels,
                report.samples,
                report.images,
                report.skipped
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Training failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
