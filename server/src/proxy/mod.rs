//! Public-side proxies: external traffic in, multiplex sub-streams out.

pub mod http;
pub mod tcp;
pub mod udp;
