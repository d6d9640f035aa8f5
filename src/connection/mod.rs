pub mod error_counter;
pub mod port_resolver;
pub mod url;
pub mod worker;
