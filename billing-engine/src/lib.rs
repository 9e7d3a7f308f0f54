//! Subscription billing periods, payment allocation and the daily renewal job.

pub mod billing;
pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod repository;
pub mod services;
pub mod startup;

pub use error::BillingError;
