//! Socket reads spread over worker threads.

mod read_dispatcher;

pub use read_dispatcher::ReadDispatcher;
