//! Request body layout shared by Request and Faf frames.
//!
//! A request body is the map `{ method, params }`. The receiver decodes it
//! twice: first only the method name to find the handler, then the params
//! into the handler's own input type.

use serde::{Deserialize, Serialize};

/// Outgoing request body.
#[derive(Debug, Serialize)]
pub(crate) struct RequestEnvelope<'a, P> {
    pub method: &'a str,
    pub params: &'a P,
}

/// Method name half of an incoming request body.
#[derive(Debug, Deserialize)]
pub(crate) struct MethodName {
    pub method: String,
}

/// Params half of an incoming request body.
#[derive(Debug, Deserialize)]
pub(crate) struct Params<T> {
    pub params: T,
}
