pub mod classify;
pub mod clients;
pub mod db;
pub mod domains;
pub mod normalize;
pub mod output;
pub mod pull;
pub mod reconcile;
pub mod scheduler;
pub mod settings;
