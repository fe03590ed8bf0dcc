//! Round-robin fan-out of batches onto the backend set.
//!
//! ## Structure
//!
//! - [`cursor`] - [`RoundRobin`](cursor::RoundRobin), the server-wide backend
//!   cursor.
//! - [`dispatcher`] - [`Dispatcher`](dispatcher::Dispatcher), which claims a
//!   backend per buffer, runs the sub-calls through the admission pool and
//!   reassembles results in request order.

pub mod cursor;
pub mod dispatcher;

pub use cursor::RoundRobin;
pub use dispatcher::Dispatcher;
