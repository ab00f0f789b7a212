pub mod bus;
pub mod connection;
pub mod dispatcher;
pub mod registry;
