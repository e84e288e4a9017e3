use std::{
    io::{self, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossterm::{cursor, execute, style::Print, terminal};
use tracing::debug;

use crate::{
    broadcast::Subscription, clock_service::ClockService, clock_state::ClockState,
    config::UiConfig,
};

const POLL: Duration = Duration::from_millis(250);
const WAITING: &str = "Connecting to time server...";

/// Renders the live clock on one terminal line as a local subscriber.
pub fn spawn(
    service: Arc<ClockService>,
    ui: UiConfig,
    running: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("console-clock".to_string())
        .spawn(move || {
            let subscription = service.subscribe();
            if let Err(e) = render_loop(&subscription, &ui, &running) {
                debug!(error = %e, "console clock stopped");
            }
            service.unsubscribe(subscription);
            println!();
        })
}

fn render_loop(
    subscription: &Subscription,
    ui: &UiConfig,
    running: &AtomicBool,
) -> io::Result<()> {
    draw(WAITING)?;
    while running.load(Ordering::SeqCst) {
        match subscription.recv_timeout(POLL) {
            Ok(state) => draw(&clock_line(&state, ui))?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

#[must_use]
pub fn clock_line(state: &ClockState, ui: &UiConfig) -> String {
    format!(
        "{}  {}",
        state.format(&ui.time_format),
        state.format(&ui.date_format)
    )
}

fn draw(line: &str) -> io::Result<()> {
    execute!(
        io::stdout(),
        cursor::MoveToColumn(0),
        terminal::Clear(terminal::ClearType::CurrentLine),
        Print(line),
    )?;
    io::stdout().flush()
}
