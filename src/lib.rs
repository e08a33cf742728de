//! Nearby transit tracker core.
//!
//! Fetches live vehicle positions and GTFS-style static data from a transit
//! API, selects the stations nearest to the user, classifies each vehicle's
//! movement relative to them, and publishes display-ready snapshots on a
//! background refresh schedule.

pub mod config;
pub mod geo;
pub mod models;
pub mod providers;
pub mod services;
pub mod sync;
