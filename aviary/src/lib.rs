#![cfg_attr(not(doctest), doc = include_str!("../README.md"))]

pub mod cage;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod interface;
pub mod pool;
pub mod request;
pub mod resource;
pub mod sync;
pub mod telemetry;
pub mod transaction;
pub mod value;
pub mod worker;

pub use cage::{Cage, CageOptions};
pub use error::{Error, Result};
pub use faststr::FastStr;
pub use request::Request;
pub use transaction::Transaction;
pub use value::{Value, ValueMap};

/// `aviary::spawn` will spawn a task and propagate the ambient [`Request`]
/// into it, so that pool checkouts and nested waits performed by the child
/// keep honouring the parent deadline.
pub fn spawn<T>(future: T) -> tokio::task::JoinHandle<T::Output>
where
    T: std::future::Future + Send + 'static,
    T::Output: Send + 'static,
{
    match request::current() {
        Some(r) => tokio::spawn(request::with_request(r, future)),
        None => tokio::spawn(future),
    }
}
