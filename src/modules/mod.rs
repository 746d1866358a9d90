//! Daemon modules built on top of the kernel.
//!
//! - [`interface`]: the session bus surface and the inhibition lock table
//! - [`location`]: the user's position, fixed or requested, with a cache
//! - [`daytime`]: sunrise, sunset and the day/night/event state

pub mod daytime;
pub mod interface;
pub mod location;
