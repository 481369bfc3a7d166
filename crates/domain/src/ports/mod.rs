use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod audit;
pub mod ballots;
pub mod db;
pub mod gatherings;
pub mod jobs;
pub mod matters;
pub mod notifications;
pub mod participants;
pub mod recompute;
pub mod results;
pub mod slots;
pub mod tallies;
pub mod units;
