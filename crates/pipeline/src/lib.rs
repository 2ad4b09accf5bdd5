//! Batch migration of artifacts and their metadata from an Artifactory-style
//! source to a bkrepo-style destination.
//!
//! [`runner::MigrationRunner`] drives a job: it discovers records through a
//! [`catalog::SourceCatalog`], normalizes them with a
//! [`planner::MigrationPlanner`], and transfers whatever the
//! [`destination::DestinationStore`] does not already hold.

pub mod catalog;
pub mod config;
pub mod destination;
mod http;
pub mod models;
pub mod planner;
pub mod report;
pub mod runner;
pub mod scope;
