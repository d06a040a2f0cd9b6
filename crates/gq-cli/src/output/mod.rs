//! Output formatting utilities for the CLI
//!
//! Tables for jobs and results, the backend status block and coloured
//! status lines.

use chrono::{DateTime, Utc};
use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use gq_client::ConnectionState;
use gq_core::{GenerationResult, Job, Notification, NotificationLevel};
use gq_orchestrator::Snapshot;
use gq_protocol::{GenerationParameters, SystemStatus};

/// Format active jobs as an ASCII table
///
/// Returns "No active jobs" when the list is empty.
pub fn format_jobs(jobs: &[Job], now: DateTime<Utc>) -> String {
    if jobs.is_empty() {
        return "No active jobs".to_string();
    }

    #[derive(Tabled)]
    struct JobRow {
        #[tabled(rename = "JOB ID")]
        id: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "PROGRESS")]
        progress: String,
        #[tabled(rename = "PROMPT")]
        prompt: String,
        #[tabled(rename = "AGE")]
        age: String,
    }

    let rows: Vec<JobRow> = jobs
        .iter()
        .map(|job| JobRow {
            id: truncate(job.key(), 20),
            status: match job.position {
                Some(position) if !job.status.is_terminal() => {
                    format!("{} (#{})", job.status, position)
                }
                _ => job.status.to_string(),
            },
            progress: progress_bar(job.progress, 10),
            prompt: truncate(&job.prompt, 40),
            age: format_age(job.created_at, now),
        })
        .collect();

    Table::new(rows)
        .with(Style::rounded())
        .with(Width::wrap(120))
        .to_string()
}

/// Format cached results as an ASCII table
///
/// The detailed view adds the generation parameters and the image URL.
pub fn format_results(results: &[GenerationResult], detailed: bool) -> String {
    if results.is_empty() {
        return "No results".to_string();
    }

    #[derive(Tabled)]
    struct ResultRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "PROMPT")]
        prompt: String,
        #[tabled(rename = "RATING")]
        rating: String,
        #[tabled(rename = "FAV")]
        favorite: String,
        #[tabled(rename = "CREATED")]
        created: String,
    }

    #[derive(Tabled)]
    struct ResultRowDetailed {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "PROMPT")]
        prompt: String,
        #[tabled(rename = "PARAMETERS")]
        parameters: String,
        #[tabled(rename = "RATING")]
        rating: String,
        #[tabled(rename = "FAV")]
        favorite: String,
        #[tabled(rename = "CREATED")]
        created: String,
        #[tabled(rename = "IMAGE")]
        image: String,
    }

    if detailed {
        let rows: Vec<ResultRowDetailed> = results
            .iter()
            .map(|r| ResultRowDetailed {
                id: r.id.clone(),
                prompt: truncate(&r.prompt, 40),
                parameters: format_parameters(&r.parameters),
                rating: format_rating(r.rating),
                favorite: if r.is_favorite { "★" } else { "" }.to_string(),
                created: r.created_at.format("%Y-%m-%d %H:%M").to_string(),
                image: r.image_url.clone(),
            })
            .collect();

        Table::new(rows)
            .with(Style::rounded())
            .with(Width::wrap(140))
            .to_string()
    } else {
        let rows: Vec<ResultRow> = results
            .iter()
            .map(|r| ResultRow {
                id: truncate(&r.id, 20),
                prompt: truncate(&r.prompt, 50),
                rating: format_rating(r.rating),
                favorite: if r.is_favorite { "★" } else { "" }.to_string(),
                created: r.created_at.format("%Y-%m-%d %H:%M").to_string(),
            })
            .collect();

        Table::new(rows).with(Style::rounded()).to_string()
    }
}

/// Format the backend status block shown by `status` and `watch`
pub fn format_status(snapshot: &Snapshot, connection: &ConnectionState) -> String {
    let mut output = String::new();

    output.push_str(&format!("Backend: {}\n", snapshot.base_url));
    output.push_str(&format!("Push channel: {}\n", format_connection(connection)));

    match &snapshot.system_status {
        Some(status) => output.push_str(&format_system_status(status)),
        None => output.push_str("System status: unavailable\n"),
    }

    if let Some(length) = snapshot.queue_length {
        output.push_str(&format!("Queue length: {}\n", length));
    }
    output.push_str(&format!("Active jobs: {}\n", snapshot.jobs.len()));
    output.push_str(&format!(
        "Cached results: {} (limit {})\n",
        snapshot.results.len(),
        snapshot.history_limit
    ));

    output
}

fn format_system_status(status: &SystemStatus) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "System: {}\n",
        status.status.as_deref().unwrap_or("unknown")
    ));

    let gpu = match (status.gpu_available, status.gpu_name.as_deref()) {
        (Some(false), _) => "not available".to_string(),
        (_, Some(name)) => name.to_string(),
        (Some(true), None) => "available".to_string(),
        (None, None) => "unknown".to_string(),
    };
    output.push_str(&format!("GPU: {}\n", gpu));

    if let (Some(used), Some(total)) = (status.gpu_memory_used, status.gpu_memory_total) {
        output.push_str(&format!("GPU memory: {:.1} / {:.1} GB\n", used, total));
    }
    if let Some(model) = &status.model_loaded {
        output.push_str(&format!("Model: {}\n", model));
    }

    output
}

/// Describe the push channel in one line
pub fn format_connection(connection: &ConnectionState) -> String {
    if connection.live {
        return "connected".to_string();
    }
    if connection.stopped {
        return "stopped".to_string();
    }
    let mut line = "disconnected".to_string();
    if let Some(delay) = connection.next_retry {
        line.push_str(&format!(", retrying in {}s", delay.as_secs()));
    }
    if let Some(error) = &connection.last_error {
        line.push_str(&format!(" ({})", error));
    }
    line
}

/// Compact `WxH, N steps, cfg C, seed S` summary
pub fn format_parameters(parameters: &GenerationParameters) -> String {
    let mut parts = Vec::new();
    if let (Some(width), Some(height)) = (parameters.width, parameters.height) {
        parts.push(format!("{}x{}", width, height));
    }
    if let Some(steps) = parameters.steps {
        parts.push(format!("{} steps", steps));
    }
    if let Some(cfg) = parameters.cfg_scale {
        parts.push(format!("cfg {}", cfg));
    }
    if let Some(seed) = parameters.seed {
        parts.push(format!("seed {}", seed));
    }
    if let Some(model) = &parameters.model {
        parts.push(model.clone());
    }
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(", ")
    }
}

fn format_rating(rating: Option<u8>) -> String {
    match rating {
        Some(stars) => "★".repeat(stars as usize),
        None => "-".to_string(),
    }
}

/// Fixed-width textual progress bar, e.g. `[####------]  40%`
pub fn progress_bar(percent: u8, width: usize) -> String {
    let percent = percent.min(100) as usize;
    let filled = percent * width / 100;
    format!(
        "[{}{}] {:>3}%",
        "#".repeat(filled),
        "-".repeat(width - filled),
        percent
    )
}

/// Time elapsed since `since`, in human-readable form
fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - since).num_seconds().max(0) as u64;
    format_duration(secs)
}

/// Format duration in human-readable form
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let remaining_secs = secs % 60;
        format!("{}m {}s", mins, remaining_secs)
    } else if secs < 86400 {
        let hours = secs / 3600;
        let remaining_mins = (secs % 3600) / 60;
        format!("{}h {}m", hours, remaining_mins)
    } else {
        let days = secs / 86400;
        let remaining_hours = (secs % 86400) / 3600;
        format!("{}d {}h", days, remaining_hours)
    }
}

/// Truncate a string with ellipsis if too long
///
/// Counts characters, so prompts with multi-byte text are never split
/// inside a code point.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print an orchestrator notification with the colour of its level
pub fn print_notification(notification: &Notification) {
    match notification.level {
        NotificationLevel::Info => print_info(&notification.message),
        NotificationLevel::Success => print_success(&notification.message),
        NotificationLevel::Warning => print_warning(&notification.message),
        NotificationLevel::Error => print_error(&notification.message),
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow with a warning symbol prefix
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan with an info symbol prefix
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
