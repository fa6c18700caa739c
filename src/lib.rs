//! Tulpa - A development reverse proxy that restarts your app when files change
//!
//! This library provides a proxy that sits in front of an app under development:
//! - Parks every incoming request until the source tree has been checked
//! - Scans the tree by modification time and reruns the app's command when dirty
//! - Debounces bursts of requests so a rebuild happens once per burst
//! - Retries forwarding until the restarted app answers or the request times out
//! - Serves the command's stderr as a 500 while the last build is broken

pub mod config;
pub mod debounce;
pub mod error;
pub mod proxy;
pub mod runner;
pub mod server;
pub mod watcher;
