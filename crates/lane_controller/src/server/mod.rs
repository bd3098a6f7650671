//! TCP listener for the controller–instance protocol.
//!
//! One reader task and one writer task per connection. The reader decodes
//! envelopes and applies them to the controller in sequence order; the writer
//! drains the connection's outbound queue, which is also where routing
//! directives for that instance are pushed.

mod connection;
mod core;

pub use self::core::ControllerServer;
