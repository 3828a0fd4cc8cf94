pub mod fs;
pub mod futures;
pub mod http;
