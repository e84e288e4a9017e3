use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::{
    clock_service::ClockService,
    config::AppConfig,
    console,
    error::AppError,
    server::{STREAM_PATH, TimeServer},
    time_source::TimeApiSource,
    wall_clock::SystemClock,
};

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

pub fn run(config: &AppConfig) -> Result<(), AppError> {
    let running = Arc::new(AtomicBool::new(true));
    let running_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_flag.store(false, Ordering::SeqCst);
    })?;

    let source = TimeApiSource::new(&config.time_api);
    info!(time_zone = source.time_zone(), "using time API at {}", config.time_api.base_url);
    let service = Arc::new(ClockService::new(source, SystemClock, config.sync.clone()));
    let tasks = service.start()?;

    let console = if config.ui.console_clock {
        Some(console::spawn(
            Arc::clone(&service),
            config.ui.clone(),
            Arc::clone(&running),
        )?)
    } else {
        None
    };

    let result = TimeServer::bind(&config.server, Arc::clone(&service)).and_then(|server| {
        info!(
            addr = ?server.local_addr(),
            stream = STREAM_PATH,
            "server is running"
        );
        server.run(&running)
    });

    running.store(false, Ordering::SeqCst);
    tasks.shutdown();
    if let Some(handle) = console
        && handle.join().is_err()
    {
        warn!("console clock thread panicked");
    }
    info!("time service stopped");
    result.map_err(AppError::from)
}
