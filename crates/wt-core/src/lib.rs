//! Core of the translation project service: the project model, the
//! change-history and stability engine, the two on-disk encodings and
//! layouts, the file store with backup rotation, and the bounded project
//! cache shared by all request handlers.

pub mod cache;
pub mod codec;
pub mod config;
pub mod history;
pub mod layout;
pub mod model;
pub mod store;
