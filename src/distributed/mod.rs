//! Distributed mode
//!
//! Workers on other hosts ("agents") and the coordinator never talk directly.
//! They meet in a hierarchical coordination store:
//!
//! ```text
//! <root>/clients/client_<ts>_<seq>   ephemeral registration, one per agent
//! <root>/<id>_in                     rounds and quit for the agent
//! <root>/<id>_out                    txUpdated / testResult / error back
//! ```
//!
//! # Modules
//!
//! - `store`: the store interface and path rules
//! - `memory`: in-process store (tests, and the backing of the TCP server)
//! - `remote`: TCP store server and client
//! - `queue`: the watched-queue primitive both sides use
//! - `agent`: the worker side
//! - `coordinator`: the coordinator side

pub mod agent;
pub mod coordinator;
pub mod memory;
pub mod queue;
pub mod remote;
pub mod store;

pub use agent::Agent;
pub use coordinator::DistributedCoordinator;
pub use memory::MemoryStore;
pub use queue::MessageQueue;
pub use remote::{RemoteStore, StoreServer};
pub use store::{CoordinationStore, CreateMode, StoreError};
