//! Parrot - learn how Discord members write, imitate them, and forget them
//!
//! Parrot collects the messages of members who opt in, trains a Markov model
//! per member and guild, and generates text in their style. When a member
//! leaves a guild and stays gone past the retention period, everything
//! learned about them there is deleted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Parrot                              │
//! │                                                                  │
//! │  history scan ──► Scan Coordinator ──► Crawler ──► Store         │
//! │                                                       │          │
//! │  imitate ───────► Model Cache ◄───── corpus ──────────┘          │
//! │                        ▲                                         │
//! │                        │ invalidate                              │
//! │  platform events ► Lifecycle ─► sweep ─► Deletion Coordinator    │
//! │                                              │          │        │
//! │                                         Store rows   avatars     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`scan`]: History scans and the cancelable crawler behind them
//! - [`markov`]: Markov models and the per-member model cache
//! - [`lifecycle`]: Departure tracking and the retention sweep
//! - [`forget`]: Cascading deletion of members, memberships and guilds
//! - [`db`]: Data model and the storage trait
//! - [`platform`]: Discord REST client and the platform traits
//! - [`service`]: The process-wide state object tying it together
//! - [`config`]: Configuration management

pub mod config;
pub mod db;
pub mod error;
pub mod forget;
pub mod lifecycle;
pub mod markov;
pub mod platform;
pub mod scan;
pub mod service;

pub use config::ParrotConfig;
pub use error::{Error, Result};
pub use service::Parrot;
