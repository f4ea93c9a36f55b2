//! Controller-side state: the task registry and per-host dispatch.
//!
//! Both are plain values; the controller builds one of each and hands
//! `Arc`s to the HTTP layer and the session listener.

pub mod dispatch;
pub mod tasks;

pub use dispatch::{DispatchManager, Subscription, SubscriptionHandle};
pub use tasks::{RegistryError, Task, TaskRegistry, TaskStatus};
