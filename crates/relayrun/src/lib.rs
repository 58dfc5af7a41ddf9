//! # relayrun
//!
//! Long-running remote invocations over relaynet brokers. A client invokes a
//! named method and receives, in order, any number of interim responses and
//! questions, then exactly one result or exception. The server side runs the
//! handler, reports progress from an execution tree, relays questions and
//! honors cancel requests.
//!
//! ## Components
//!
//! - `InvocationRuntime`: owns the brokers; serves and connects them.
//! - `InvocationServer` / `MethodHandler`: dispatch of server-bound messages.
//! - `CallbackService`: sequenced client-bound messages for one invocation.
//! - `ExecutionCallback` / `ProgressReporter`: progress trees and snapshots.
//! - `CancelService`: cancel listeners per invocation.
//! - `QuestionService`: answers correlated by request id.
//! - `InvocationClient` / `Invocation`: the caller's view.

pub mod callback;
pub mod cancel;
pub mod client;
pub mod execution;
pub mod question;
pub mod reporter;
pub mod runtime;
pub mod server;

pub use callback::CallbackService;
pub use cancel::CancelListener;
pub use cancel::CancelService;
pub use client::Invocation;
pub use client::InvocationClient;
pub use client::InvocationEvent;
pub use client::MethodProxy;
pub use execution::Canceled;
pub use execution::ExecutionCallback;
pub use question::QuestionService;
pub use reporter::ProgressReporter;
pub use runtime::InvocationRuntime;
pub use runtime::RuntimeBuilder;
pub use runtime::RuntimeConfig;
pub use server::InvocationContext;
pub use server::InvocationServer;
pub use server::MethodHandler;
pub use server::handler_fn;
