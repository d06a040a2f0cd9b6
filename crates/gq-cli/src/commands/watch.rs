//! Watch command implementation

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use crossterm::{
    cursor::MoveTo,
    execute,
    terminal::{Clear, ClearType},
};
use parking_lot::Mutex;

use gq_client::ConnectionState;
use gq_core::Notification;
use gq_orchestrator::{Orchestrator, Snapshot};

use crate::output::{format_connection, format_jobs, format_results};

/// Notifications kept on screen
const EVENT_LINES: usize = 5;

/// Recent notifications, newest last
#[derive(Clone, Default)]
pub struct EventLog {
    lines: Arc<Mutex<VecDeque<Notification>>>,
}

impl EventLog {
    pub fn push(&self, notification: &Notification) {
        let mut lines = self.lines.lock();
        if lines.len() == EVENT_LINES {
            lines.pop_front();
        }
        lines.push_back(notification.clone());
    }

    pub fn recent(&self) -> Vec<Notification> {
        self.lines.lock().iter().cloned().collect()
    }
}

/// Execute the watch command
///
/// Redraws the queue on every snapshot or connection change until Ctrl-C.
pub async fn watch_command(orchestrator: &Orchestrator, events: &EventLog) -> Result<()> {
    let mut snapshots = orchestrator.subscribe();
    let mut connection = orchestrator.connection();

    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        let state = connection.borrow_and_update().clone();
        redraw(&render(&snapshot, &state, &events.recent()))?;

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

fn redraw(screen: &str) -> Result<()> {
    let mut stdout = std::io::stdout();
    execute!(stdout, Clear(ClearType::All), MoveTo(0, 0))?;
    stdout.write_all(screen.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn render(snapshot: &Snapshot, connection: &ConnectionState, events: &[Notification]) -> String {
    let mut screen = String::new();

    screen.push_str(&format!(
        "genqueue: {} [{}]",
        snapshot.base_url,
        format_connection(connection)
    ));
    if let Some(length) = snapshot.queue_length {
        screen.push_str(&format!("  queue: {}", length));
    }
    screen.push_str("\n\n");

    screen.push_str(&format_jobs(&snapshot.jobs, Utc::now()));
    screen.push_str("\n\nRecent results:\n");
    let recent = snapshot.results.len().min(5);
    screen.push_str(&format_results(&snapshot.results[..recent], false));
    screen.push('\n');

    if !events.is_empty() {
        screen.push('\n');
        for event in events {
            screen.push_str(&format!("[{}] {}\n", event.level, event.message));
        }
    }
    screen.push_str("\nPress Ctrl-C to exit\n");

    screen
}
