//! `dowe` — a host-level reverse proxy: per-host backend processes
//! supervised on Unix sockets, routed by a single HTTP/HTTPS front end,
//! with TLS materialized from an ACME client and metadata kept in a
//! small embedded record store.

pub mod btree;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod error;
pub mod http_listener;
pub mod lifecycle;
pub mod meta;
pub mod router;
pub mod storage;
pub mod supervisor;
pub mod tls;
pub mod unix_http;
