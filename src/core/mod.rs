//! Promise chains and the worker pool they run on.

pub mod action;
mod chain;
mod combinators;
pub mod error;
pub mod promise;
pub mod signal;
pub mod value;
pub mod worker_pool;

pub use action::{
    CompleteCall, EndCall, InitialCall, Launch, PromiseAction, PromiseContext, StageCall, StageMode, StartHook,
};
pub use chain::PromiseCallHandler;
pub use error::{AppResult, PromiseError, PromiseFailure, StagePanic};
pub use promise::Promise;
pub use signal::WaitSignal;
pub use value::{PromiseData, PromiseStatus, PromiseValue};
pub use worker_pool::{
    PoolStats, WorkerCall, WorkerCallHandler, WorkerPool, WorkerThread, HTTP_SERVER_WORKER_CALL_ID,
    PROMISE_WORKER_CALL_ID, START_CUSTOM_WORKER_CALL_ID,
};
