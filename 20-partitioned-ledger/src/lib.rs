//! Partitioned banking ledger with a write node, a coordinator node and a
//! read replica.
//!
//! One binary runs every role. Each module owns a single concern:
//!
//! - [`cli`] and [`config`] parse the command line into node and client
//!   settings.
//! - [`protocol`] defines the line protocol spoken by clients and peers.
//! - [`transport`] provides the reconnecting line channel used to dial nodes.
//! - [`store`] holds users and balances and produces/applies full dumps.
//! - [`teller`] implements deposit, withdraw and transfer on a store.
//! - [`lock_table`] serializes work per account and suppresses duplicate
//!   transactions by nonce.
//! - [`replication`] drives a write through the coordinator and pushes
//!   results to the replica.
//! - [`dispatcher`] accepts connections and runs the bounded worker pool.
//! - [`handlers`] serves client and peer requests for each role.
//! - [`session`] is the client-side query layer and interactive shell.
//!
//! Unit tests live next to the code; `tests/` runs whole clusters in-process
//! and drives the compiled binary end to end.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod lock_table;
pub mod protocol;
pub mod replication;
pub mod session;
pub mod store;
pub mod teller;
pub mod transport;
