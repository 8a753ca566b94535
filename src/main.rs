//! stagecomposer - Multi-layer MTC-synced video composition engine
//!
//! Headless engine runner: loads the configuration, builds the engine and
//! ticks it at the project rate. Rendering is delegated to the compositor
//! implementation; this binary runs the null compositor (useful for sync
//! and decode soak testing without a display).

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use log::info;

use stagecomposer::app::{Engine, NullCompositor, Settings};

static RUNNING: AtomicBool = AtomicBool::new(true);

#[cfg(unix)]
extern "C" fn handle_signal(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handler() {
    unsafe {
        let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(unix))]
fn install_signal_handler() {}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("stagecomposer v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var_os("STAGECOMPOSER_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Settings::default_path);
    let settings = Settings::load(&config_path)?;
    info!(
        "loaded configuration from {} ({} layer(s))",
        config_path.display(),
        settings.layers.len()
    );

    install_signal_handler();

    let mut engine = Engine::new(settings);
    let mut compositor = NullCompositor::default();
    engine.run(&mut compositor, &RUNNING);

    info!(
        "composed {} frames across {} layer updates",
        compositor.frames_composed, compositor.layers_seen
    );
    Ok(())
}
