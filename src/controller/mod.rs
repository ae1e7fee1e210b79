//! Controller: pass scheduling, task wiring and the admin API

pub mod http;
pub mod scheduler;
pub mod server;

pub use http::{create_router, AdminState};
pub use scheduler::Scheduler;
pub use server::{Components, Controller};
