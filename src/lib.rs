//! A structured peer-to-peer overlay based on [Pastry](https://www.cs.rice.edu/~druschel/publications/Pastry.pdf).
//!
//! Every node has a 160-bit identifier on a ring. Messages addressed to an identifier are routed
//! to the live node whose identifier is numerically closest to it, in a logarithmic number of
//! hops, using two tables:
//!
//! 1. the [leafset](leafset::Leafset): the nodes immediately clockwise and counterclockwise of
//!    this one,
//! 2. the [routing table](routing_table::RoutingTable): for every prefix length, one node per
//!    next digit, preferring the lowest round-trip time.
//!
//! Joining nodes can look for a topologically close entry point first ([proximity neighbour
//! selection](pns)), so that the routing table fills up with nearby peers.
//!
//! The [`OverlayNode`] is a state machine: it is handed received envelopes and the current time,
//! and produces the envelopes to send. The `sync` feature adds a thread-safe handle and an async
//! driver, the `codec` feature a length-delimited wire codec.
//!
//! Notable differences with the paper:
//!
//! 1. Leafset liveness relies on periodic heartbeats rather than on probing failed hops.
//! 2. Routing table entries are only admitted once their round-trip time has been measured, or
//!    assumed to be long when learned during a join.
//! 3. Nodes that forward a message propose a better routing table row to its sender when they
//!    know of one.

#![cfg_attr(doc_cfg, feature(doc_cfg))]

#[cfg(feature = "codec")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "codec")))]
pub mod codec;
#[cfg(feature = "sync")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
pub mod sync;

pub mod bootstrap;
pub mod heartbeat;
pub mod leafset;
pub mod node;
pub mod pns;
pub mod router;
pub mod routing_table;
pub mod state;

mod core;

pub use crate::core::{config, error::Error, id::NodeId, message, ring, traits::ProcessData};
pub use node::{NodeEvent, OverlayNode};
