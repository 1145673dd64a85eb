pub mod proxy;
pub mod status;

pub use proxy::proxy_request;
pub use status::get_status;
