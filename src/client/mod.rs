pub mod api;
pub mod controller;
pub mod poller;
pub mod snapshot;

pub use api::{ClientError, SupportClient};
pub use controller::SessionController;
