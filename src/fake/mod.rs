//! An in-process transport for exercising sessions without a radio.

mod transport;

pub use transport::{FakeController, FakeRequest, FakeTransport};
