mod connection;
mod query;
mod schema;

pub use connection::*;
pub use query::*;
pub use schema::*;
