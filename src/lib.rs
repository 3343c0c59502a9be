//! Feed-driven torrent submission.
//!
//! Polls RSS/Atom feeds, matches entries against per-feed rules, hands new
//! matches to a Transmission daemon, and remembers what it already handled so
//! nothing is submitted twice. When Transmission sits behind a Gluetun VPN
//! sidecar, it also keeps the forwarded peer port in sync and rotates the
//! tunnel when the port stays unreachable.
//!
//! - [`filter`]: per-feed include/exclude/size rules
//! - [`cache`]: persisted seen and error caches
//! - [`vpn`]: tunnel health state machine and the Gluetun client
//! - [`poll`]: one pass over all feeds
//! - [`watch`]: the periodic loop with live config reload

pub mod cache;
pub mod config;
pub mod feed;
pub mod filter;
pub mod poll;
pub mod prompt;
pub mod transmission;
pub mod util;
pub mod vpn;
pub mod watch;
