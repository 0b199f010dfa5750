//! splashd - Boot Splash Daemon
//!
//! Process-side pieces of the daemon: configuration, the tokio event loop
//! that drives [`splash_core::Daemon`], the boot socket, and the system
//! implementations of the core's collaborator traits.
//!
//! # Module Overview
//!
//! - [`config`]: TOML file, `SPLASHD_*` environment, CLI overrides
//! - [`event_loop`]: [`event_loop::TokioEventLoop`] and the dispatch loop
//! - [`frame`]: length-prefixed, checksummed JSON frames
//! - [`protocol`]: client requests, replies, and their routing
//! - [`server`]: the boot socket
//! - [`platform`]: [`platform::SystemPlatform`]
//! - [`splash`]: the text splash
//! - [`session`]: boot log capture

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod event_loop;
pub mod frame;
pub mod platform;
pub mod protocol;
pub mod server;
pub mod session;
pub mod splash;
