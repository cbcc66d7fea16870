//! Offline-first document sync core for basket distribution clients.
//!
//! The crate keeps a local document store per user and a remote CouchDB store in sync.
//!
//! - [`Database`] wraps one store and adds reactive queries, session handling and
//!   replication.
//! - [`DatabaseHelper`] builds local and remote stores from a [`Config`].
//! - [`sync_state::SyncStateListener`] turns replication events into a [`SyncState`].
//! - [`DatabaseService`] follows the logged in user and the network state, keeps the
//!   right stores alive and replicating, and exposes the store the application should use.
//!
//! Stores are opened through a [`backend::StoreAdapter`].  [`backend::mem`] holds stores
//! in memory, [`backend::http`] talks to a CouchDB server.
#![cfg_attr(basket_sync_docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod auth;
pub mod backend;
pub mod changes;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod helper;
pub mod network;
pub mod query;
pub mod replication;
pub mod service;
pub mod sync_state;

mod handles;

pub use self::{
    auth::{AuthenticatedUser, Credentials, Profile},
    config::Config,
    database::{Database, DatabaseOptions, LiveQuery, StoreKind},
    document::{Document, Revision},
    error::{DatabaseError, ErrorInfo},
    helper::DatabaseHelper,
    network::NetworkState,
    query::{FindQuery, IndexSpec, Selector},
    service::DatabaseService,
    sync_state::{SyncState, SyncStatus},
};
