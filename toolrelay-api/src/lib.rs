pub mod http;
pub mod impls;
