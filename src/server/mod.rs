//! Server-side components: task lifecycle, request handling, push
//! delivery, and the axum HTTP surface.

pub mod axum_integration;
pub mod event_queue;
pub mod push;
pub mod request_handler;
pub mod task_manager;

pub use axum_integration::broker_router;
pub use event_queue::EventQueue;
pub use push::{PushDeliveryQueue, PushRetryConfig, DELIVERY_ID_HEADER};
pub use request_handler::{BrokerRequestHandler, RequestHandler};
pub use task_manager::TaskManager;
