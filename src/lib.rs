//! # lumind
//!
//! Module kernel of a session daemon that drives screen brightness, gamma
//! and idle handling.
//!
//! ## Features
//!
//! - **Module lifecycle**: modules are checked, initialized and destroyed
//!   along a dependency graph of HARD and SOFT edges
//! - **Message bus**: update and request topics with regex subscriptions
//! - **Inhibition**: refcounted locks behind `org.freedesktop.ScreenSaver`
//! - **D-Bus interface**: properties mirroring every update topic
//! - **Location and daytime**: sunrise and sunset from a cached or requested
//!   position, or from fixed times
//!
//! ## Architecture
//!
//! - [`Kernel`](kernel::Kernel) - owns modules, graph, bus and reactor
//! - [`DependencyGraph`](graph::DependencyGraph) - arena of typed edges
//! - [`MessageBus`](bus::MessageBus) - bitmask subscriptions per module
//! - [`LockManager`](inhibit::LockManager) - inhibition lock table
//! - [`TokioReactor`](reactor::TokioReactor) - wake-up sources and timers
//!
//! ## Example
//!
//! ```no_run
//! use lumind::{application::Application, config::ConfigManager};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()
//!         .await?
//!         .run()
//!         .await
//! }
//! ```

pub mod application;
pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod inhibit;
pub mod kernel;
pub mod message;
pub mod modules;
pub mod reactor;
pub mod task_manager;
pub mod topic;
