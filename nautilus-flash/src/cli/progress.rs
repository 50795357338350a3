//! Terminal rendering of session events

use std::sync::Mutex;

use crossterm::style::Stylize;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::report::{Event, LogLevel, Reporter};

/// A [Reporter] drawing events on the terminal as they happen
#[derive(Debug, Default)]
pub struct TerminalReporter {
    renderer: Mutex<EventRenderer>,
}

impl Reporter for TerminalReporter {
    fn report(&self, event: Event) {
        if let Ok(mut renderer) = self.renderer.lock() {
            renderer.render(event);
        }
    }
}

/// Draws a progress bar for the running operation and prints log lines
/// above it
#[derive(Default)]
pub struct EventRenderer {
    bar: Option<ProgressBar>,
}

impl std::fmt::Debug for EventRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRenderer")
            .field("drawing", &self.is_drawing())
            .finish()
    }
}

impl EventRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, event: Event) {
        match event {
            Event::Progress { percent, message } => {
                let bar = self.bar.get_or_insert_with(new_bar);
                bar.set_position(u64::from(percent));
                bar.set_message(message);
            }
            Event::Log { level, text } => {
                let line = format_line(level, &text);
                match &self.bar {
                    Some(bar) => bar.println(line),
                    None => println!("{line}"),
                }
            }
            Event::StateChanged(state) => {
                debug!("Session state: {state}");
                if state.is_stable() {
                    self.finish();
                }
            }
        }
    }

    /// Close the progress bar of the last operation, if any
    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            if bar.position() >= 100 {
                bar.finish();
            } else {
                bar.abandon();
            }
        }
    }

    /// Whether an operation's progress is currently drawn
    pub fn is_drawing(&self) -> bool {
        self.bar.is_some()
    }
}

fn new_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    bar
}

fn format_line(level: LogLevel, text: &str) -> String {
    match level {
        LogLevel::Info => text.to_string(),
        LogLevel::Success => text.green().to_string(),
        LogLevel::Warning => text.yellow().to_string(),
        LogLevel::Error => text.red().bold().to_string(),
    }
}
