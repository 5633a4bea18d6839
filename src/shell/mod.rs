pub mod build_info;
pub mod cli;
pub mod config;
pub mod error;
pub mod logstore;
pub mod probe;
pub mod pump;
pub mod server;
pub mod supervisor;

#[cfg(test)]
mod logstore_tests;

use chrono::Local;

/// Operator event line on stderr: `<local ts> [<component>] <msg>`.
pub(crate) fn shell_event(component: &str, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    eprintln!("{ts} [{component}] {}", msg.as_ref());
}
