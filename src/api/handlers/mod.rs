pub mod decision;
pub mod health;
pub mod metrics;
