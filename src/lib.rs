//! The operation executor that sits underneath a MongoDB driver. It takes one logical request,
//! an [`Operation`](operation::Operation), and turns it into wire protocol round trips: it picks a
//! server, assembles the command with its session, concerns and read preference, frames and
//! optionally compresses it, decodes and classifies the reply, and retries what can be retried.
//!
//! Server discovery and connection pooling are not part of this crate. The executor reaches
//! servers through the [`Deployment`](sdam::Deployment), [`Server`](sdam::Server) and
//! [`Connection`](sdam::Connection) traits, which the caller implements.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use mongodb_executor::{
//! #     bson::{doc, Document},
//! #     context::Context,
//! #     operation::{Operation, OperationType, RetryMode},
//! #     sdam::{Deployment, SelectedServer},
//! #     session::Session,
//! # };
//! # async fn example(deployment: Arc<dyn Deployment>) -> mongodb_executor::error::Result<()> {
//! let mut session = Session::implicit();
//! let mut op = Operation::new("app", deployment, |command: &mut Document, _: &SelectedServer| {
//!     command.insert("insert", "users");
//!     command.insert("documents", vec![doc! { "name": "Ada" }]);
//!     Ok(())
//! })
//! .op_type(OperationType::Write)
//! .retry(RetryMode::Once)
//! .session(&mut session);
//!
//! let reply = mongodb_executor::execute(&Context::new(), &mut op).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```
//!
//! Cursor-returning commands go through [`execute_cursor`], which wraps the first batch in a
//! [`BatchCursor`](cursor::BatchCursor) that issues `getMore` and `killCursors` on the same
//! server.
//!
//! # Feature flags
//!
//! | Feature              | Description                                       | Default |
//! |:---------------------|:--------------------------------------------------|:--------|
//! | `zstd-compression`   | Compress messages with zstd when negotiated.      | yes     |
//! | `zlib-compression`   | Compress messages with zlib when negotiated.      | yes     |
//! | `snappy-compression` | Compress messages with snappy when negotiated.    | yes     |

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use ::bson;

mod bson_util;
mod compression;
mod concern;
pub mod context;
pub mod csfle;
pub mod cursor;
pub mod error;
pub mod event;
pub mod executor;
pub mod operation;
pub mod options;
pub mod sdam;
mod selection_criteria;
pub mod session;
mod trace;
pub mod wire;

pub use crate::executor::{execute, execute_cursor};
