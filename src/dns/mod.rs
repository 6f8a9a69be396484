//! Relay pool resolution and DNS forwarding

mod cache;
mod forwarder;
mod pool;
mod resolver;

pub use cache::{RelayEntry, RelayPoolCache};
pub use forwarder::DnsForwarder;
pub use pool::{parse_txt_record, seed_for, shuffle_candidates, RelayPool, MAX_CANDIDATES};
pub use resolver::{DnsLookup, DohResolver, RecordKind, SystemResolver};
