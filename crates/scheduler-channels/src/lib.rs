//! Channel primitives used to feed the scheduler's single event loop and to
//! fan results back out to peers.
//!
//! `mspc` is a small wrapper over `async_channel` giving both blocking and
//! async send/receive without forcing every caller onto a particular
//! runtime. `broadcast` builds a multi-subscriber fan-out on top of it,
//! used for delivering `key-done`/`key-erred` notifications to every
//! client still interested in a key.

pub mod broadcast;
pub mod mspc;
