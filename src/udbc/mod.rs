pub mod value;

pub mod connection;
pub mod driver;

pub use connection::Connection;
pub use driver::{Driver, DriverFactory, PoolTarget};
pub use value::{QueryResult, Row, Value};

pub const DEFAULT_HOST: &str = "localhost";
