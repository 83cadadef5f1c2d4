pub mod chains;
pub mod health;
pub mod jobs;
pub mod schedules;
pub mod sinks;
pub mod sites;
