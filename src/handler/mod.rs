//! Handler module - method registration and dispatch.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps method names to unary or streaming handlers
//! - [`UnaryHandler`] / [`StreamHandler`] - type-erased handlers working on
//!   raw request bodies
//!
//! Handlers are plain async functions. A unary handler takes its params
//! and returns one value; a streaming handler takes its params and returns
//! a `Stream` of values. Returning an [`RpcError::Application`] sends its
//! code, message and data to the caller; any other error is reported as
//! `INTERNAL_ERROR`.
//!
//! [`RpcError::Application`]: crate::RpcError::Application

mod registry;

pub use registry::{
    HandlerFuture, HandlerRegistry, HandlerStream, MethodEntry, StreamHandler, TypedStream,
    TypedUnary, UnaryHandler,
};
