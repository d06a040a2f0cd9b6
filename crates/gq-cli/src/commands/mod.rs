//! CLI command implementations

mod config;
mod generate;
mod jobs;
mod results;
mod status;
mod watch;

pub use config::{config_get, config_init, config_path, config_set, config_show};
pub use generate::{generate_command, wait_for_job, JobOutcome};
pub use jobs::{cancel_command, clear_command, jobs_command};
pub use results::{
    delete_command, download_command, favorite_command, rate_command, results_command,
    ResultsArgs,
};
pub use status::status_command;
pub use watch::{watch_command, EventLog};
